// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Inbound signal model
//!
//! A [`Signal`] is one inbound communication event awaiting reasoning:
//! an email, a chat message, or a spreadsheet edit. Signals are
//! immutable once accepted by the pipeline; stages pass them by
//! reference or clone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where a signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// An inbound email
    Email,
    /// A chat message
    Chat,
    /// A spreadsheet edit
    Sheet,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSource::Email => write!(f, "email"),
            SignalSource::Chat => write!(f, "chat"),
            SignalSource::Sheet => write!(f, "sheet"),
        }
    }
}

/// An attachment referenced by a signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name
    pub filename: String,
    /// MIME type if the source reported one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Source-side file identifier, required for document filing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Size in bytes if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl Attachment {
    /// Create an attachment with just a file name.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            file_id: None,
            size_bytes: None,
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the source-side file id.
    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Set the size in bytes.
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Relative priority of a signal, assigned at the source seam
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SignalPriority {
    /// Background traffic
    Low = 0,
    /// Everyday traffic
    #[default]
    Normal = 1,
    /// Jump the queue
    High = 2,
}

impl fmt::Display for SignalPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalPriority::Low => write!(f, "low"),
            SignalPriority::Normal => write!(f, "normal"),
            SignalPriority::High => write!(f, "high"),
        }
    }
}

/// One inbound communication event awaiting reasoning
///
/// `id` is unique within the process lifetime; `timestamp` never lies
/// in the future relative to ingress (the queue clamps it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique id (uuid v4 unless the source supplied one)
    pub id: String,
    /// Originating source
    pub source: SignalSource,
    /// Subject line, chat preview, or sheet/range reference
    pub subject: String,
    /// Full body text
    pub body: String,
    /// Sender address or handle
    pub sender: String,
    /// When the source produced the signal
    pub timestamp: DateTime<Utc>,
    /// Attachments, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Thread reference for reply chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
    /// Queue priority
    #[serde(default)]
    pub priority: SignalPriority,
    /// Free-form source metadata, opaque until preprocessing
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Signal {
    /// Create a signal with a fresh id and the current timestamp.
    pub fn new(
        source: SignalSource,
        subject: impl Into<String>,
        body: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            subject: subject.into(),
            body: body.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            thread_ref: None,
            priority: SignalPriority::Normal,
            metadata: HashMap::new(),
        }
    }

    /// Override the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Set the thread reference.
    #[must_use]
    pub fn with_thread_ref(mut self, thread_ref: impl Into<String>) -> Self {
        self.thread_ref = Some(thread_ref.into());
        self
    }

    /// Set the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: SignalPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True when the signal carries at least one attachment.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Raw event shape delivered by a source adapter (inbound seam)
///
/// The core treats `data` as opaque until preprocessing; the adapter is
/// responsible for mapping its upstream payload into these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Originating source
    pub source: SignalSource,
    /// Adapter-specific event type (e.g. "message.created")
    pub event_type: String,
    /// Opaque payload; must contain `subject`, `body`, `sender`
    pub data: serde_json::Value,
    /// Adapter metadata carried through to the signal
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Queue priority
    #[serde(default)]
    pub priority: SignalPriority,
}

impl SourceEvent {
    /// Convert a source event into a [`Signal`], pulling the standard
    /// fields out of the opaque payload. Missing fields become empty
    /// strings; the classifier's boundary behavior handles those.
    #[must_use]
    pub fn into_signal(self) -> Signal {
        let field = |key: &str| {
            self.data
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let mut signal = Signal::new(self.source, field("subject"), field("body"), field("sender"))
            .with_priority(self.priority);

        if let Some(thread_ref) = self.data.get("thread_ref").and_then(|v| v.as_str()) {
            signal.thread_ref = Some(thread_ref.to_string());
        }
        if let Some(attachments) = self.data.get("attachments").and_then(|v| v.as_array()) {
            for raw in attachments {
                if let Ok(attachment) = serde_json::from_value::<Attachment>(raw.clone()) {
                    signal.attachments.push(attachment);
                }
            }
        }
        signal.metadata = self.metadata;
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_builder() {
        let signal = Signal::new(
            SignalSource::Email,
            "Quarterly report",
            "Attached is the Q3 report.",
            "finance@example.com",
        )
        .with_thread_ref("thread-42")
        .with_priority(SignalPriority::High)
        .with_attachment(Attachment::new("q3.pdf").with_file_id("file-1"))
        .with_metadata("mailbox", serde_json::json!("inbound"));

        assert_eq!(signal.source, SignalSource::Email);
        assert_eq!(signal.subject, "Quarterly report");
        assert_eq!(signal.thread_ref.as_deref(), Some("thread-42"));
        assert_eq!(signal.priority, SignalPriority::High);
        assert!(signal.has_attachments());
        assert!(!signal.id.is_empty());
    }

    #[test]
    fn test_signal_ids_unique() {
        let a = Signal::new(SignalSource::Chat, "a", "b", "c");
        let b = Signal::new(SignalSource::Chat, "a", "b", "c");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_signal_serde_round_trip() {
        let signal = Signal::new(SignalSource::Sheet, "Budget!A1:C3", "edited totals", "ops@x.com")
            .with_attachment(Attachment::new("x.csv").with_mime_type("text/csv"));
        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal, back);
    }

    #[test]
    fn test_source_serde_names() {
        assert_eq!(
            serde_json::to_string(&SignalSource::Email).unwrap(),
            "\"email\""
        );
        assert_eq!(
            serde_json::from_str::<SignalSource>("\"sheet\"").unwrap(),
            SignalSource::Sheet
        );
    }

    #[test]
    fn test_priority_ordering() {
        assert!(SignalPriority::High > SignalPriority::Normal);
        assert!(SignalPriority::Normal > SignalPriority::Low);
    }

    #[test]
    fn test_source_event_into_signal() {
        let event = SourceEvent {
            source: SignalSource::Email,
            event_type: "message.received".to_string(),
            data: serde_json::json!({
                "subject": "Invoice #12345",
                "body": "Please find attached...",
                "sender": "billing@vendor.com",
                "thread_ref": "t-9",
                "attachments": [{"filename": "invoice.pdf", "file_id": "f-3"}],
            }),
            metadata: HashMap::new(),
            priority: SignalPriority::Normal,
        };

        let signal = event.into_signal();
        assert_eq!(signal.subject, "Invoice #12345");
        assert_eq!(signal.sender, "billing@vendor.com");
        assert_eq!(signal.thread_ref.as_deref(), Some("t-9"));
        assert_eq!(signal.attachments.len(), 1);
        assert_eq!(signal.attachments[0].file_id.as_deref(), Some("f-3"));
    }

    #[test]
    fn test_source_event_missing_fields() {
        let event = SourceEvent {
            source: SignalSource::Chat,
            event_type: "message".to_string(),
            data: serde_json::json!({}),
            metadata: HashMap::new(),
            priority: SignalPriority::Low,
        };
        let signal = event.into_signal();
        assert!(signal.subject.is_empty());
        assert!(signal.body.is_empty());
        assert_eq!(signal.priority, SignalPriority::Low);
    }
}

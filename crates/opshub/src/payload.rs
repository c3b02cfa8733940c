// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Platform payload construction
//!
//! The parameter builder turns a decision's loose parameter blob into
//! the bit-exact payload its executor requires. Per platform it
//! enumerates required fields, applies defaults for missing optional
//! fields (recording a warning for each default), and rejects with the
//! list of missing fields when a required field is absent, including
//! required configuration such as destination container ids.
//! Deterministic given the decision, the prepared signal, and the
//! builder configuration: due dates are computed from the decision
//! timestamp, not the wall clock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::{ActionKind, Decision, TaskDetails};
use crate::error::{Error, Result};
use crate::markdown::{parse_inline, to_plain_text};
use crate::preprocess::PreparedSignal;

/// Default days until a task is due when the signal named no date.
const DEFAULT_DUE_DAYS: i64 = 7;

/// Default meeting length when the signal named none.
const DEFAULT_MEETING_MINUTES: u32 = 30;

/// Destination configuration the builder needs
#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    /// Task board / container id (required for task payloads)
    pub board_id: Option<String>,
    /// Fallback notification channel
    pub default_channel: Option<String>,
    /// Root folder for filed documents
    pub document_root: Option<String>,
    /// Calendar id for meeting payloads
    pub calendar_id: Option<String>,
    /// Build board cards instead of plain tasks
    pub board_style: bool,
}

impl BuilderConfig {
    /// Config with a board id.
    #[must_use]
    pub fn with_board_id(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    /// Config with a default channel.
    #[must_use]
    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    /// Config with a document root.
    #[must_use]
    pub fn with_document_root(mut self, root: impl Into<String>) -> Self {
        self.document_root = Some(root.into());
        self
    }

    /// Config with a calendar id.
    #[must_use]
    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
        self
    }

    /// Emit board cards for task-creating decisions.
    #[must_use]
    pub fn with_board_style(mut self, board_style: bool) -> Self {
        self.board_style = board_style;
        self
    }
}

/// Task payload for the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Destination board / container
    pub board_id: String,
    /// Task title
    pub title: String,
    /// Plain-text description
    pub description: String,
    /// 1..=5
    pub priority: u8,
    /// Workflow status
    pub status: String,
    /// Due date
    pub due_date: DateTime<Utc>,
    /// Source tag ("email", "chat", "sheet")
    pub source: String,
    /// Assignee, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Board-card payload for card-style trackers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPayload {
    /// Destination board
    pub board_id: String,
    /// Card title
    pub title: String,
    /// Plain-text description
    pub description: String,
    /// Priority label ("Urgent" | "High" | "Medium" | "Low")
    pub label: String,
    /// "top" for high priority, "bottom" otherwise
    pub position: String,
    /// Source reference URL, when the signal carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// Notification payload for chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Destination channel
    pub channel: String,
    /// Header line
    pub header: String,
    /// Body text, markup flattened
    pub body: String,
    /// Context lines (source, sender)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    /// Links pulled out of the body markup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// Thread to reply into, if the signal was part of one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
}

/// Document payload for the filesystem platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Target container (folder)
    pub folder: String,
    /// File name
    pub file_name: String,
    /// Source-side file id; must be supplied
    pub file_id: String,
    /// Description
    pub description: String,
}

/// Calendar event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingPayload {
    /// Destination calendar
    pub calendar_id: String,
    /// Event title
    pub title: String,
    /// Event description
    pub description: String,
    /// Raw date hints extracted from the signal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_hints: Vec<String>,
    /// Attendee addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
    /// Event length
    pub duration_minutes: u32,
}

/// Tagged union over target platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum PlatformPayload {
    /// Task tracker, list style
    Task(TaskPayload),
    /// Task tracker, board style
    Card(CardPayload),
    /// Chat notification
    Notification(NotificationPayload),
    /// Document filing
    Document(DocumentPayload),
    /// Calendar event
    Meeting(MeetingPayload),
}

/// A built payload plus the defaults that were applied
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPayload {
    /// The platform payload
    pub payload: PlatformPayload,
    /// One entry per defaulted field
    pub warnings: Vec<String>,
}

/// Priority label for card payloads.
fn priority_label(priority: u8) -> &'static str {
    match priority {
        1 => "Urgent",
        2 => "High",
        3 => "Medium",
        _ => "Low",
    }
}

fn param_str(decision: &Decision, key: &str) -> Option<String> {
    decision
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

fn param_str_list(decision: &Decision, key: &str) -> Vec<String> {
    decision
        .parameters
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Builds platform payloads from decisions
pub struct ParameterBuilder {
    config: BuilderConfig,
}

impl ParameterBuilder {
    /// Builder over a destination configuration.
    #[must_use]
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Build the payload for a decision.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] with `missing_fields` when a
    /// required field or required configuration is absent, and for
    /// actions that carry no payload (`ignore`).
    pub fn build(&self, decision: &Decision, prepared: &PreparedSignal) -> Result<BuiltPayload> {
        match decision.action {
            ActionKind::CreateTask => self.build_task(decision, prepared),
            ActionKind::SendNotification | ActionKind::Escalate | ActionKind::Clarify => {
                self.build_notification(decision, prepared)
            }
            ActionKind::UpdateDocument => self.build_document(decision, prepared),
            ActionKind::ScheduleMeeting => self.build_meeting(decision, prepared),
            ActionKind::Ignore => Err(Error::validation("ignore decisions carry no payload")),
        }
    }

    /// Collect the task-shaped fields out of a decision, defaulting
    /// optional ones and recording a warning per default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the title is absent.
    pub fn task_details(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
        warnings: &mut Vec<String>,
    ) -> Result<TaskDetails> {
        let title = param_str(decision, "title").ok_or_else(|| {
            Error::missing_fields("task payload incomplete", vec!["title".to_string()])
        })?;

        let description = match param_str(decision, "description") {
            Some(description) if !description.trim().is_empty() => to_plain_text(&description),
            _ => {
                warnings.push("description defaulted to signal body".to_string());
                to_plain_text(&prepared.signal.body)
            }
        };

        let due_date = decision
            .parameters
            .get("due_in_hours")
            .and_then(serde_json::Value::as_i64)
            .map(|hours| decision.decided_at + ChronoDuration::hours(hours));

        Ok(TaskDetails {
            title,
            description,
            due_date,
            assignee: param_str(decision, "assignee"),
            labels: param_str_list(decision, "labels"),
            priority: decision.priority,
            source: prepared.signal.source.to_string(),
            metadata: serde_json::Map::new(),
        })
    }

    fn build_task(&self, decision: &Decision, prepared: &PreparedSignal) -> Result<BuiltPayload> {
        let mut warnings = Vec::new();

        let Some(board_id) = self.config.board_id.clone() else {
            // Report the title's absence alongside the missing config.
            let mut missing = vec!["board_id".to_string()];
            if param_str(decision, "title").is_none() {
                missing.push("title".to_string());
            }
            return Err(Error::missing_fields("task payload incomplete", missing));
        };
        let details = self.task_details(decision, prepared, &mut warnings)?;

        let due_date = details.due_date.unwrap_or_else(|| {
            warnings.push(format!("due_date defaulted to +{DEFAULT_DUE_DAYS} days"));
            decision.decided_at + ChronoDuration::days(DEFAULT_DUE_DAYS)
        });

        if self.config.board_style {
            let position = if decision.priority <= 2 { "top" } else { "bottom" };
            let source_url = prepared
                .signal
                .metadata
                .get("source_url")
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            return Ok(BuiltPayload {
                payload: PlatformPayload::Card(CardPayload {
                    board_id,
                    title: details.title,
                    description: details.description,
                    label: priority_label(decision.priority).to_string(),
                    position: position.to_string(),
                    source_url,
                }),
                warnings,
            });
        }

        Ok(BuiltPayload {
            payload: PlatformPayload::Task(TaskPayload {
                board_id,
                title: details.title,
                description: details.description,
                priority: details.priority,
                status: "Not Started".to_string(),
                due_date,
                source: details.source,
                assignee: details.assignee,
                labels: details.labels,
            }),
            warnings,
        })
    }

    fn build_notification(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
    ) -> Result<BuiltPayload> {
        let mut warnings = Vec::new();

        let channel = match param_str(decision, "channel") {
            Some(channel) => channel,
            None => match &self.config.default_channel {
                Some(channel) => {
                    warnings.push("channel defaulted from configuration".to_string());
                    channel.clone()
                }
                None => {
                    return Err(Error::missing_fields(
                        "notification payload incomplete",
                        vec!["channel".to_string()],
                    ));
                }
            },
        };

        let header = param_str(decision, "header")
            .or_else(|| param_str(decision, "summary"))
            .unwrap_or_else(|| match decision.action {
                ActionKind::Escalate => format!("Escalation: {}", prepared.signal.subject),
                ActionKind::Clarify => format!("Clarification needed: {}", prepared.signal.subject),
                _ => prepared.signal.subject.clone(),
            });

        let raw_body = param_str(decision, "body")
            .or_else(|| param_str(decision, "question"))
            .unwrap_or_else(|| prepared.signal.body.clone());
        let links: Vec<String> = parse_inline(&raw_body)
            .into_iter()
            .filter_map(|span| span.link)
            .collect();
        let body = to_plain_text(&raw_body);

        let thread_ref = param_str(decision, "thread_ref").or_else(|| prepared.signal.thread_ref.clone());

        Ok(BuiltPayload {
            payload: PlatformPayload::Notification(NotificationPayload {
                channel,
                header,
                body,
                context: vec![
                    format!("source: {}", prepared.signal.source),
                    format!("from: {}", prepared.signal.sender),
                ],
                links,
                thread_ref,
            }),
            warnings,
        })
    }

    fn build_document(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
    ) -> Result<BuiltPayload> {
        let mut warnings = Vec::new();
        let mut missing = Vec::new();

        let folder = match (param_str(decision, "folder"), &self.config.document_root) {
            (Some(folder), Some(root)) => format!("{root}{folder}"),
            (Some(folder), None) => folder,
            (None, Some(root)) => {
                warnings.push("folder defaulted to document root".to_string());
                root.clone()
            }
            (None, None) => {
                missing.push("folder".to_string());
                String::new()
            }
        };

        let attachment = prepared.signal.attachments.first();
        let file_name = param_str(decision, "file_name")
            .or_else(|| attachment.map(|a| a.filename.clone()))
            .unwrap_or_else(|| {
                missing.push("file_name".to_string());
                String::new()
            });
        let file_id = param_str(decision, "file_id")
            .or_else(|| attachment.and_then(|a| a.file_id.clone()))
            .unwrap_or_else(|| {
                missing.push("file_id".to_string());
                String::new()
            });

        if !missing.is_empty() {
            return Err(Error::missing_fields("document payload incomplete", missing));
        }

        let description = param_str(decision, "description").unwrap_or_else(|| {
            warnings.push("description defaulted to signal subject".to_string());
            prepared.signal.subject.clone()
        });

        Ok(BuiltPayload {
            payload: PlatformPayload::Document(DocumentPayload {
                folder,
                file_name,
                file_id,
                description,
            }),
            warnings,
        })
    }

    fn build_meeting(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
    ) -> Result<BuiltPayload> {
        let mut warnings = Vec::new();

        let calendar_id = self.config.calendar_id.clone().ok_or_else(|| {
            Error::missing_fields(
                "meeting payload incomplete",
                vec!["calendar_id".to_string()],
            )
        })?;

        let title = param_str(decision, "title").unwrap_or_else(|| {
            warnings.push("title defaulted to signal subject".to_string());
            prepared.signal.subject.clone()
        });
        let description = param_str(decision, "description")
            .map(|d| to_plain_text(&d))
            .unwrap_or_else(|| to_plain_text(&prepared.signal.body));

        let mut attendees = param_str_list(decision, "attendees");
        if attendees.is_empty() {
            attendees = prepared.entities.emails.clone();
        }
        if !attendees.contains(&prepared.signal.sender.trim().to_lowercase()) {
            attendees.push(prepared.signal.sender.trim().to_lowercase());
        }

        warnings.push(format!(
            "duration defaulted to {DEFAULT_MEETING_MINUTES} minutes"
        ));

        Ok(BuiltPayload {
            payload: PlatformPayload::Meeting(MeetingPayload {
                calendar_id,
                title,
                description,
                date_hints: param_str_list(decision, "date_hints"),
                attendees,
                duration_minutes: DEFAULT_MEETING_MINUTES,
            }),
            warnings,
        })
    }
}

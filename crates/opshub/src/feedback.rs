// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Feedback tracking
//!
//! Every terminal outcome (executed, rejected, modified, failed)
//! appends a [`FeedbackRecord`]. The corpus feeds the pattern store and
//! the prompt optimizer, and the aggregate stats feed the dashboard
//! snapshot. Cancelled work records nothing.
//!
//! Records can additionally be mirrored to an append-only JSONL file,
//! one self-describing object per line, and loaded back on startup.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::classification::Classification;
use crate::constants::DEFAULT_ROLLING_WINDOW;
use crate::decision::{ActionKind, Decision, TargetPlatform};
use crate::error::Result;
use crate::preprocess::PreparedSignal;

/// Terminal outcome of one signal's journey through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    /// Executed (or intentionally skipped as a duplicate)
    Success,
    /// Execution failed after retries
    Failure,
    /// A human modified the decision before execution
    Modified,
    /// Rejected in review (or timed out under the reject policy)
    Rejected,
}

impl fmt::Display for FeedbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackOutcome::Success => write!(f, "success"),
            FeedbackOutcome::Failure => write!(f, "failure"),
            FeedbackOutcome::Modified => write!(f, "modified"),
            FeedbackOutcome::Rejected => write!(f, "rejected"),
        }
    }
}

/// One recorded outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Unique record id
    pub feedback_id: String,
    /// Fingerprint of the classified signal
    pub fingerprint: String,
    /// Signal id
    pub signal_id: String,
    /// Sender, for sender-pattern mining
    pub sender: String,
    /// Normalized subject, for subject-pattern mining
    pub subject: String,
    /// Keywords, for urgency-keyword mining
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// The classification that drove the decision
    pub classification: Classification,
    /// What the engine decided
    pub action: ActionKind,
    /// Where it was to execute
    pub target_platform: TargetPlatform,
    /// How it ended
    pub outcome: FeedbackOutcome,
    /// Delta a human applied to the decision, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifications: Option<serde_json::Value>,
    /// Free-form user note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
    /// Pipeline wall-clock for this signal, in milliseconds
    pub processing_ms: u64,
    /// Confidence the classifier reported
    pub confidence_score: f64,
}

impl FeedbackRecord {
    /// Build a record from the pipeline artifacts of one signal.
    pub fn new(
        prepared: &PreparedSignal,
        classification: &Classification,
        decision: &Decision,
        outcome: FeedbackOutcome,
        processing_ms: u64,
    ) -> Self {
        Self {
            feedback_id: uuid::Uuid::new_v4().to_string(),
            fingerprint: prepared.fingerprint.clone(),
            signal_id: prepared.signal.id.clone(),
            sender: prepared.signal.sender.trim().to_lowercase(),
            subject: prepared.normalized_subject.clone(),
            keywords: prepared.keywords.clone(),
            classification: classification.clone(),
            action: decision.action,
            target_platform: decision.target_platform,
            outcome,
            modifications: None,
            note: None,
            timestamp: Utc::now(),
            processing_ms,
            confidence_score: classification.confidence,
        }
    }

    /// Attach the human's modification delta.
    #[must_use]
    pub fn with_modifications(mut self, delta: serde_json::Value) -> Self {
        self.modifications = Some(delta);
        self
    }

    /// Attach a user note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// True when the outcome counts toward the success rate.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == FeedbackOutcome::Success
    }
}

/// Aggregates over the feedback corpus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    /// Total records
    pub total: u64,
    /// Counts by outcome name
    pub by_outcome: HashMap<String, u64>,
    /// Counts by category name
    pub by_category: HashMap<String, u64>,
    /// Counts by action name
    pub by_action: HashMap<String, u64>,
    /// Counts by urgency name
    pub by_urgency: HashMap<String, u64>,
    /// Success fraction over the most recent window
    pub rolling_success_rate: f64,
    /// Success fraction over everything
    pub overall_success_rate: f64,
    /// Mean reported confidence
    pub avg_confidence: f64,
    /// Mean processing time in milliseconds
    pub avg_processing_ms: f64,
    /// Median processing time
    pub p50_processing_ms: u64,
    /// 95th percentile processing time
    pub p95_processing_ms: u64,
}

/// Percentile from sorted values.
fn percentile(sorted: &[u64], p: u8) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p as usize) * sorted.len() / 100).min(sorted.len() - 1);
    sorted[idx]
}

/// Append-only tracker over terminal outcomes
pub struct FeedbackTracker {
    records: RwLock<Vec<FeedbackRecord>>,
    rolling_window: usize,
    log_path: Option<PathBuf>,
}

impl FeedbackTracker {
    /// In-memory tracker with the default rolling window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            rolling_window: DEFAULT_ROLLING_WINDOW,
            log_path: None,
        }
    }

    /// Mirror records to an append-only JSONL file.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Override the rolling window size.
    #[must_use]
    pub fn with_rolling_window(mut self, window: usize) -> Self {
        self.rolling_window = window.max(1);
        self
    }

    /// Load a tracker from an existing JSONL log. Unparseable lines
    /// are skipped with a warning; the file keeps receiving appends.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut records = Vec::new();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path).await?;
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<FeedbackRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(error) => {
                        tracing::warn!(
                            line = lineno + 1,
                            error = %error,
                            "Skipping unparseable feedback record"
                        );
                    }
                }
            }
        }

        Ok(Self {
            records: RwLock::new(records),
            rolling_window: DEFAULT_ROLLING_WINDOW,
            log_path: Some(path.to_path_buf()),
        })
    }

    /// Append one record, mirroring to the JSONL sink when configured.
    pub async fn record(&self, record: FeedbackRecord) -> Result<()> {
        if let Some(path) = &self.log_path {
            let line = serde_json::to_string(&record)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }

        self.records.write().push(record);
        Ok(())
    }

    /// Snapshot of the whole corpus.
    #[must_use]
    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.records.read().clone()
    }

    /// The `n` most recent records, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<FeedbackRecord> {
        let records = self.records.read();
        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when no outcomes were recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Aggregate statistics over the corpus.
    #[must_use]
    pub fn stats(&self) -> FeedbackStats {
        let records = self.records.read();
        if records.is_empty() {
            return FeedbackStats::default();
        }

        let total = records.len() as u64;
        let mut by_outcome: HashMap<String, u64> = HashMap::new();
        let mut by_category: HashMap<String, u64> = HashMap::new();
        let mut by_action: HashMap<String, u64> = HashMap::new();
        let mut by_urgency: HashMap<String, u64> = HashMap::new();

        for record in records.iter() {
            *by_outcome.entry(record.outcome.to_string()).or_default() += 1;
            *by_category
                .entry(record.classification.category.to_string())
                .or_default() += 1;
            *by_action.entry(record.action.to_string()).or_default() += 1;
            *by_urgency
                .entry(record.classification.urgency.to_string())
                .or_default() += 1;
        }

        let successes = records.iter().filter(|r| r.is_success()).count();
        let window_start = records.len().saturating_sub(self.rolling_window);
        let window = &records[window_start..];
        let window_successes = window.iter().filter(|r| r.is_success()).count();

        let avg_confidence =
            records.iter().map(|r| r.confidence_score).sum::<f64>() / records.len() as f64;
        let avg_processing_ms =
            records.iter().map(|r| r.processing_ms as f64).sum::<f64>() / records.len() as f64;

        let mut latencies: Vec<u64> = records.iter().map(|r| r.processing_ms).collect();
        latencies.sort_unstable();

        FeedbackStats {
            total,
            by_outcome,
            by_category,
            by_action,
            by_urgency,
            rolling_success_rate: window_successes as f64 / window.len() as f64,
            overall_success_rate: successes as f64 / records.len() as f64,
            avg_confidence,
            avg_processing_ms,
            p50_processing_ms: percentile(&latencies, 50),
            p95_processing_ms: percentile(&latencies, 95),
        }
    }
}

impl Default for FeedbackTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::{Category, Importance, Urgency};
    use crate::preprocess::preprocess;
    use crate::signal::{Signal, SignalSource};

    fn record(outcome: FeedbackOutcome, confidence: f64, processing_ms: u64) -> FeedbackRecord {
        let prepared = preprocess(Signal::new(
            SignalSource::Email,
            "Server down",
            "The API server is not responding",
            "alerts@x.com",
        ));
        let classification = Classification::new(
            Urgency::High,
            Importance::High,
            Category::Incident,
            confidence,
            "test",
        );
        let decision = Decision::new(
            prepared.signal.id.clone(),
            ActionKind::CreateTask,
            TargetPlatform::TaskTracker,
        );
        FeedbackRecord::new(&prepared, &classification, &decision, outcome, processing_ms)
    }

    #[tokio::test]
    async fn test_record_and_stats() {
        let tracker = FeedbackTracker::new();
        tracker
            .record(record(FeedbackOutcome::Success, 0.9, 100))
            .await
            .unwrap();
        tracker
            .record(record(FeedbackOutcome::Success, 0.7, 200))
            .await
            .unwrap();
        tracker
            .record(record(FeedbackOutcome::Failure, 0.5, 300))
            .await
            .unwrap();
        tracker
            .record(record(FeedbackOutcome::Rejected, 0.3, 400))
            .await
            .unwrap();

        let stats = tracker.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_outcome["success"], 2);
        assert_eq!(stats.by_outcome["failure"], 1);
        assert_eq!(stats.by_outcome["rejected"], 1);
        assert_eq!(stats.by_category["incident"], 4);
        assert_eq!(stats.by_action["create_task"], 4);
        assert_eq!(stats.by_urgency["high"], 4);
        assert!((stats.overall_success_rate - 0.5).abs() < 1e-9);
        assert!((stats.avg_confidence - 0.6).abs() < 1e-9);
        assert!((stats.avg_processing_ms - 250.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rolling_window_success_rate() {
        let tracker = FeedbackTracker::new().with_rolling_window(2);
        tracker
            .record(record(FeedbackOutcome::Failure, 0.5, 10))
            .await
            .unwrap();
        tracker
            .record(record(FeedbackOutcome::Success, 0.5, 10))
            .await
            .unwrap();
        tracker
            .record(record(FeedbackOutcome::Success, 0.5, 10))
            .await
            .unwrap();

        let stats = tracker.stats();
        // Window sees only the last two successes.
        assert!((stats.rolling_success_rate - 1.0).abs() < 1e-9);
        assert!(stats.overall_success_rate < 1.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = FeedbackTracker::new().stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.rolling_success_rate, 0.0);
    }

    #[test]
    fn test_percentiles() {
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&values, 50), 51);
        assert_eq!(percentile(&values, 95), 96);
        assert_eq!(percentile(&[], 50), 0);
    }

    #[tokio::test]
    async fn test_jsonl_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.jsonl");

        let tracker = FeedbackTracker::new().with_log_path(&path);
        tracker
            .record(record(FeedbackOutcome::Success, 0.8, 120))
            .await
            .unwrap();
        tracker
            .record(
                record(FeedbackOutcome::Modified, 0.6, 340)
                    .with_note("changed assignee")
                    .with_modifications(serde_json::json!({"assignee": "alice"})),
            )
            .await
            .unwrap();

        let loaded = FeedbackTracker::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let records = loaded.records();
        assert_eq!(records[1].note.as_deref(), Some("changed assignee"));
        assert_eq!(
            records[1].modifications,
            Some(serde_json::json!({"assignee": "alice"}))
        );
    }

    #[tokio::test]
    async fn test_load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.jsonl");
        let good = serde_json::to_string(&record(FeedbackOutcome::Success, 0.9, 50)).unwrap();
        tokio::fs::write(&path, format!("{good}\nnot json\n\n")).await.unwrap();

        let loaded = FeedbackTracker::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_recent_returns_tail() {
        let tracker = FeedbackTracker::new();
        for ms in [1, 2, 3] {
            tracker
                .record(record(FeedbackOutcome::Success, 0.5, ms))
                .await
                .unwrap();
        }
        let recent = tracker.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].processing_ms, 2);
        assert_eq!(recent[1].processing_ms, 3);
    }
}

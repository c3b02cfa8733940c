// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Learned-pattern store
//!
//! Patterns are regularities mined in bulk from the feedback corpus:
//! senders with a dominant category, keywords that correlate with
//! elevated urgency, time buckets that outperform the baseline, and
//! category→action pairs that almost always succeed. Derivation is
//! pure and idempotent (the same corpus always yields the same
//! patterns), so the snapshot file can be truncated and rederived at
//! any time.
//!
//! The store is append-only from the feedback tracker's perspective
//! and read-only during classification and decisioning: readers get an
//! `Arc` snapshot that is swapped atomically on rederivation.

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::classification::{Category, Classification, Urgency};
use crate::constants::{
    DEFAULT_PATTERN_AFFINITY_RATE, DEFAULT_PATTERN_AFFINITY_THRESHOLD,
    DEFAULT_PATTERN_KEYWORD_THRESHOLD, DEFAULT_PATTERN_SENDER_THRESHOLD,
    DEFAULT_PATTERN_TIME_LIFT, DEFAULT_PATTERN_TIME_THRESHOLD,
};
use crate::decision::ActionKind;
use crate::error::Result;
use crate::feedback::FeedbackRecord;
use crate::preprocess::PreparedSignal;

/// Detection thresholds for pattern derivation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternThresholds {
    /// Feedback records a sender needs before a pattern is emitted
    pub sender_min_records: usize,
    /// Signals a keyword must appear in before a pattern is emitted
    pub keyword_min_occurrences: usize,
    /// Records a time bucket needs before it is considered
    pub time_min_records: usize,
    /// Success-rate lift a time bucket needs over the baseline
    pub time_min_lift: f64,
    /// Records a (category, action) pair needs before it is considered
    pub affinity_min_records: usize,
    /// Success rate a (category, action) pair needs to qualify
    pub affinity_min_rate: f64,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self {
            sender_min_records: DEFAULT_PATTERN_SENDER_THRESHOLD,
            keyword_min_occurrences: DEFAULT_PATTERN_KEYWORD_THRESHOLD,
            time_min_records: DEFAULT_PATTERN_TIME_THRESHOLD,
            time_min_lift: DEFAULT_PATTERN_TIME_LIFT,
            affinity_min_records: DEFAULT_PATTERN_AFFINITY_THRESHOLD,
            affinity_min_rate: DEFAULT_PATTERN_AFFINITY_RATE,
        }
    }
}

/// A sender with enough history to predict its traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderPattern {
    /// Canonical sender address
    pub sender: String,
    /// Supporting record count
    pub records: usize,
    /// Most frequent category from this sender
    pub dominant_category: Category,
    /// Mean urgency, encoded 1..4
    pub avg_urgency: f64,
    /// Most frequent action taken for this sender
    pub preferred_action: ActionKind,
    /// Success fraction across the sender's records
    pub success_rate: f64,
    /// Most recent record timestamp
    pub last_seen: DateTime<Utc>,
}

/// A keyword correlated with elevated urgency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordPattern {
    /// The keyword
    pub keyword: String,
    /// Signals the keyword appeared in
    pub occurrences: usize,
    /// Success fraction across those signals
    pub success_rate: f64,
    /// Mean urgency lift over the corpus baseline, in encoded units
    pub urgency_boost: f64,
    /// Most recent record timestamp
    pub last_seen: DateTime<Utc>,
}

/// A time-of-day bucket that outperforms the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePattern {
    /// Day of week, 0 = Monday
    pub weekday: u8,
    /// Hour of day, 0..24
    pub hour: u8,
    /// Supporting record count
    pub records: usize,
    /// Success fraction inside the bucket
    pub success_rate: f64,
    /// Lift over the corpus baseline
    pub lift: f64,
    /// Most recent record timestamp
    pub last_seen: DateTime<Utc>,
}

/// A (category, action) pair that almost always succeeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryActionPattern {
    /// Signal category
    pub category: Category,
    /// Action taken
    pub action: ActionKind,
    /// Supporting record count
    pub records: usize,
    /// Success fraction for the pair
    pub success_rate: f64,
    /// Most recent record timestamp
    pub last_seen: DateTime<Utc>,
}

/// A recurring subject prefix, stored as an anchored regex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectPattern {
    /// Anchored, case-insensitive regex over normalized subjects
    pub pattern: String,
    /// Supporting record count
    pub support: usize,
    /// Success fraction across matching records
    pub success_rate: f64,
    /// Most recent record timestamp
    pub last_seen: DateTime<Utc>,
}

/// Everything the store knows, derived from one corpus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patterns {
    /// Keyword → urgency correlation
    pub urgency_keywords: HashMap<String, KeywordPattern>,
    /// Sender → behavior
    pub sender_patterns: HashMap<String, SenderPattern>,
    /// "weekday-hour" → success lift
    pub time_patterns: HashMap<String, TimePattern>,
    /// "category:action" → affinity
    pub category_action_affinity: HashMap<String, CategoryActionPattern>,
    /// Recurring subject prefixes, sorted by pattern text
    pub subject_patterns: Vec<SubjectPattern>,
}

impl Patterns {
    /// Affinity-preferred action for a category, if one qualified.
    #[must_use]
    pub fn preferred_action(&self, category: Category) -> Option<ActionKind> {
        self.category_action_affinity
            .values()
            .filter(|p| p.category == category)
            .max_by(|a, b| {
                (a.success_rate, a.records)
                    .partial_cmp(&(b.success_rate, b.records))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| p.action)
    }

    /// Apply sender and keyword adjustments to a classification.
    ///
    /// Bounded: urgency rises at most one step, confidence at most
    /// +0.1, and only the sender's dominant category may override the
    /// original category.
    #[must_use]
    pub fn adjust(&self, prepared: &PreparedSignal, classification: &Classification) -> Classification {
        let mut adjusted = classification.clone();
        let original_urgency = classification.urgency;
        let original_confidence = classification.confidence;
        let mut confidence_bonus: f64 = 0.0;

        let sender_key = prepared.signal.sender.trim().to_lowercase();
        if let Some(sender) = self.sender_patterns.get(&sender_key) {
            if sender.success_rate >= 0.5 {
                if sender.dominant_category != adjusted.category {
                    tracing::debug!(
                        sender = %sender_key,
                        from = %adjusted.category,
                        to = %sender.dominant_category,
                        "Sender pattern overrides category"
                    );
                    adjusted.category = sender.dominant_category;
                }
                if Urgency::decode(sender.avg_urgency) > original_urgency {
                    adjusted.urgency = original_urgency.raised();
                }
                confidence_bonus += 0.05;
            }
        }

        let keyword_boosted = prepared.keywords.iter().any(|keyword| {
            self.urgency_keywords
                .get(keyword)
                .is_some_and(|p| p.urgency_boost >= 0.5)
        });
        if keyword_boosted {
            if adjusted.urgency == original_urgency {
                adjusted.urgency = original_urgency.raised();
            }
            confidence_bonus += 0.05;
        }

        adjusted.confidence = (original_confidence + confidence_bonus.min(0.1)).min(1.0);
        adjusted
    }
}

/// Snapshot file contents: the four maps plus provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternsSnapshot {
    /// When the patterns were derived
    pub derived_at: DateTime<Utc>,
    /// Size of the corpus they were derived from
    pub signals_analyzed: usize,
    /// The patterns themselves
    pub patterns: Patterns,
}

/// Derive patterns from a feedback corpus. Pure and idempotent.
#[must_use]
pub fn derive_patterns(records: &[FeedbackRecord], thresholds: &PatternThresholds) -> Patterns {
    if records.is_empty() {
        return Patterns::default();
    }

    let baseline_success =
        records.iter().filter(|r| r.is_success()).count() as f64 / records.len() as f64;
    let baseline_urgency = records
        .iter()
        .map(|r| f64::from(r.classification.urgency.encode()))
        .sum::<f64>()
        / records.len() as f64;

    Patterns {
        urgency_keywords: derive_keywords(records, thresholds, baseline_urgency),
        sender_patterns: derive_senders(records, thresholds),
        time_patterns: derive_time_buckets(records, thresholds, baseline_success),
        category_action_affinity: derive_affinities(records, thresholds),
        subject_patterns: derive_subjects(records, thresholds),
    }
}

fn success_rate(records: &[&FeedbackRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records.iter().filter(|r| r.is_success()).count() as f64 / records.len() as f64
}

fn last_seen(records: &[&FeedbackRecord]) -> DateTime<Utc> {
    records
        .iter()
        .map(|r| r.timestamp)
        .max()
        .unwrap_or_else(Utc::now)
}

/// Most frequent value; ties break toward the lexically-smaller name so
/// derivation stays deterministic.
fn dominant<T: Copy + std::fmt::Display>(values: impl Iterator<Item = T>) -> Option<T> {
    let mut counts: HashMap<String, (usize, T)> = HashMap::new();
    for value in values {
        let entry = counts.entry(value.to_string()).or_insert((0, value));
        entry.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(name_a, (count_a, _)), (name_b, (count_b, _))| {
            count_a.cmp(count_b).then(name_b.cmp(name_a))
        })
        .map(|(_, (_, value))| value)
}

fn derive_senders(
    records: &[FeedbackRecord],
    thresholds: &PatternThresholds,
) -> HashMap<String, SenderPattern> {
    let mut by_sender: HashMap<String, Vec<&FeedbackRecord>> = HashMap::new();
    for record in records {
        by_sender.entry(record.sender.clone()).or_default().push(record);
    }

    by_sender
        .into_iter()
        .filter(|(_, group)| group.len() >= thresholds.sender_min_records)
        .filter_map(|(sender, group)| {
            let dominant_category = dominant(group.iter().map(|r| r.classification.category))?;
            let preferred_action = dominant(group.iter().map(|r| r.action))?;
            let avg_urgency = group
                .iter()
                .map(|r| f64::from(r.classification.urgency.encode()))
                .sum::<f64>()
                / group.len() as f64;
            Some((
                sender.clone(),
                SenderPattern {
                    sender,
                    records: group.len(),
                    dominant_category,
                    avg_urgency,
                    preferred_action,
                    success_rate: success_rate(&group),
                    last_seen: last_seen(&group),
                },
            ))
        })
        .collect()
}

fn derive_keywords(
    records: &[FeedbackRecord],
    thresholds: &PatternThresholds,
    baseline_urgency: f64,
) -> HashMap<String, KeywordPattern> {
    let mut by_keyword: HashMap<String, Vec<&FeedbackRecord>> = HashMap::new();
    for record in records {
        for keyword in &record.keywords {
            by_keyword.entry(keyword.clone()).or_default().push(record);
        }
    }

    by_keyword
        .into_iter()
        .filter(|(_, group)| group.len() >= thresholds.keyword_min_occurrences)
        .filter_map(|(keyword, group)| {
            let avg_urgency = group
                .iter()
                .map(|r| f64::from(r.classification.urgency.encode()))
                .sum::<f64>()
                / group.len() as f64;
            let urgency_boost = avg_urgency - baseline_urgency;
            // Only keywords with a measured upward effect qualify.
            if urgency_boost <= 0.0 {
                return None;
            }
            Some((
                keyword.clone(),
                KeywordPattern {
                    keyword,
                    occurrences: group.len(),
                    success_rate: success_rate(&group),
                    urgency_boost,
                    last_seen: last_seen(&group),
                },
            ))
        })
        .collect()
}

fn derive_time_buckets(
    records: &[FeedbackRecord],
    thresholds: &PatternThresholds,
    baseline_success: f64,
) -> HashMap<String, TimePattern> {
    let mut by_bucket: HashMap<(u8, u8), Vec<&FeedbackRecord>> = HashMap::new();
    for record in records {
        let weekday = record.timestamp.weekday().num_days_from_monday() as u8;
        let hour = record.timestamp.hour() as u8;
        by_bucket.entry((weekday, hour)).or_default().push(record);
    }

    by_bucket
        .into_iter()
        .filter(|(_, group)| group.len() >= thresholds.time_min_records)
        .filter_map(|((weekday, hour), group)| {
            let rate = success_rate(&group);
            let lift = rate - baseline_success;
            if lift < thresholds.time_min_lift {
                return None;
            }
            Some((
                format!("{weekday}-{hour:02}"),
                TimePattern {
                    weekday,
                    hour,
                    records: group.len(),
                    success_rate: rate,
                    lift,
                    last_seen: last_seen(&group),
                },
            ))
        })
        .collect()
}

fn derive_affinities(
    records: &[FeedbackRecord],
    thresholds: &PatternThresholds,
) -> HashMap<String, CategoryActionPattern> {
    let mut by_pair: HashMap<(Category, ActionKind), Vec<&FeedbackRecord>> = HashMap::new();
    for record in records {
        by_pair
            .entry((record.classification.category, record.action))
            .or_default()
            .push(record);
    }

    by_pair
        .into_iter()
        .filter(|(_, group)| group.len() >= thresholds.affinity_min_records)
        .filter_map(|((category, action), group)| {
            let rate = success_rate(&group);
            if rate < thresholds.affinity_min_rate {
                return None;
            }
            Some((
                format!("{category}:{action}"),
                CategoryActionPattern {
                    category,
                    action,
                    records: group.len(),
                    success_rate: rate,
                    last_seen: last_seen(&group),
                },
            ))
        })
        .collect()
}

fn derive_subjects(
    records: &[FeedbackRecord],
    thresholds: &PatternThresholds,
) -> Vec<SubjectPattern> {
    let mut by_prefix: HashMap<String, Vec<&FeedbackRecord>> = HashMap::new();
    for record in records {
        let prefix: Vec<&str> = record.subject.split_whitespace().take(2).collect();
        if prefix.len() < 2 {
            continue;
        }
        by_prefix.entry(prefix.join(" ")).or_default().push(record);
    }

    let mut patterns: Vec<SubjectPattern> = by_prefix
        .into_iter()
        .filter(|(_, group)| group.len() >= thresholds.keyword_min_occurrences)
        .map(|(prefix, group)| SubjectPattern {
            pattern: format!("(?i)^{}", regex::escape(&prefix)),
            support: group.len(),
            success_rate: success_rate(&group),
            last_seen: last_seen(&group),
        })
        .collect();
    patterns.sort_by(|a, b| a.pattern.cmp(&b.pattern));
    patterns
}

/// Store handing out immutable pattern snapshots
pub struct PatternStore {
    thresholds: PatternThresholds,
    current: RwLock<Arc<Patterns>>,
    derived_at: RwLock<Option<DateTime<Utc>>>,
    signals_analyzed: RwLock<usize>,
}

impl PatternStore {
    /// Create an empty store with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_thresholds(PatternThresholds::default())
    }

    /// Create an empty store with explicit thresholds.
    #[must_use]
    pub fn with_thresholds(thresholds: PatternThresholds) -> Self {
        Self {
            thresholds,
            current: RwLock::new(Arc::new(Patterns::default())),
            derived_at: RwLock::new(None),
            signals_analyzed: RwLock::new(0),
        }
    }

    /// The thresholds in force.
    #[must_use]
    pub fn thresholds(&self) -> &PatternThresholds {
        &self.thresholds
    }

    /// Rederive from a corpus and swap the snapshot in.
    pub fn rederive(&self, records: &[FeedbackRecord]) -> Arc<Patterns> {
        let patterns = Arc::new(derive_patterns(records, &self.thresholds));
        *self.current.write() = Arc::clone(&patterns);
        *self.derived_at.write() = Some(Utc::now());
        *self.signals_analyzed.write() = records.len();
        tracing::info!(
            senders = patterns.sender_patterns.len(),
            keywords = patterns.urgency_keywords.len(),
            time_buckets = patterns.time_patterns.len(),
            affinities = patterns.category_action_affinity.len(),
            corpus = records.len(),
            "Patterns rederived"
        );
        patterns
    }

    /// Current snapshot; readers hold it without blocking writers.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Patterns> {
        Arc::clone(&self.current.read())
    }

    /// Write the current snapshot to a JSON file.
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = PatternsSnapshot {
            derived_at: self.derived_at.read().unwrap_or_else(Utc::now),
            signals_analyzed: *self.signals_analyzed.read(),
            patterns: self.snapshot().as_ref().clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Replace the current snapshot with a previously-saved file.
    pub async fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let snapshot: PatternsSnapshot = serde_json::from_str(&content)?;
        *self.current.write() = Arc::new(snapshot.patterns);
        *self.derived_at.write() = Some(snapshot.derived_at);
        *self.signals_analyzed.write() = snapshot.signals_analyzed;
        Ok(())
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::Importance;
    use crate::decision::{Decision, TargetPlatform};
    use crate::feedback::FeedbackOutcome;
    use crate::preprocess::preprocess;
    use crate::signal::{Signal, SignalSource};

    fn record(
        sender: &str,
        subject: &str,
        body: &str,
        category: Category,
        urgency: Urgency,
        action: ActionKind,
        outcome: FeedbackOutcome,
    ) -> FeedbackRecord {
        let prepared = preprocess(Signal::new(SignalSource::Email, subject, body, sender));
        let classification =
            Classification::new(urgency, Importance::Medium, category, 0.8, "test");
        let decision = Decision::new(prepared.signal.id.clone(), action, TargetPlatform::TaskTracker);
        FeedbackRecord::new(&prepared, &classification, &decision, outcome, 50)
    }

    fn incident_corpus(n: usize) -> Vec<FeedbackRecord> {
        (0..n)
            .map(|i| {
                record(
                    "alerts@x.com",
                    &format!("Server alert {i}"),
                    "database latency exceeded threshold",
                    Category::Incident,
                    Urgency::High,
                    ActionKind::CreateTask,
                    FeedbackOutcome::Success,
                )
            })
            .collect()
    }

    #[test]
    fn test_sender_pattern_needs_threshold() {
        let thresholds = PatternThresholds::default();
        let patterns = derive_patterns(&incident_corpus(9), &thresholds);
        assert!(patterns.sender_patterns.is_empty());

        let patterns = derive_patterns(&incident_corpus(10), &thresholds);
        let sender = &patterns.sender_patterns["alerts@x.com"];
        assert_eq!(sender.records, 10);
        assert_eq!(sender.dominant_category, Category::Incident);
        assert_eq!(sender.preferred_action, ActionKind::CreateTask);
        assert!((sender.success_rate - 1.0).abs() < 1e-9);
        assert!((sender.avg_urgency - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_pattern_requires_boost() {
        // "database" appears in every high-urgency record; mix in low
        // records without it so the baseline sits below.
        let mut records = incident_corpus(6);
        for i in 0..6 {
            records.push(record(
                &format!("fyi{i}@x.com"),
                &format!("Newsletter {i}"),
                "weekly roundup of notes",
                Category::Information,
                Urgency::Low,
                ActionKind::SendNotification,
                FeedbackOutcome::Success,
            ));
        }

        let patterns = derive_patterns(&records, &PatternThresholds::default());
        let keyword = &patterns.urgency_keywords["database"];
        assert_eq!(keyword.occurrences, 6);
        assert!(keyword.urgency_boost > 0.0);
        // Low-urgency-only keywords carry no boost and are not emitted.
        assert!(!patterns.urgency_keywords.contains_key("roundup"));
    }

    #[test]
    fn test_affinity_requires_rate_and_support() {
        let thresholds = PatternThresholds::default();
        // 10 incident/create_task successes qualifies.
        let patterns = derive_patterns(&incident_corpus(10), &thresholds);
        assert!(patterns
            .category_action_affinity
            .contains_key("incident:create_task"));

        // 10 records at 70% success does not reach the 80% bar.
        let mut mixed = incident_corpus(7);
        for _ in 0..3 {
            let mut r = incident_corpus(1).remove(0);
            r.outcome = FeedbackOutcome::Failure;
            mixed.push(r);
        }
        let patterns = derive_patterns(&mixed, &thresholds);
        assert!(!patterns
            .category_action_affinity
            .contains_key("incident:create_task"));
    }

    #[test]
    fn test_time_pattern_needs_lift_over_baseline() {
        // All records share one bucket and all succeed; baseline is
        // also 1.0, so there is no lift and no pattern.
        let records = incident_corpus(25);
        let patterns = derive_patterns(&records, &PatternThresholds::default());
        assert!(patterns.time_patterns.is_empty());

        // Add failures outside the mined bucket semantics is awkward to
        // fabricate through timestamps, so lower the lift threshold to
        // zero-lift acceptance instead and confirm the bucket shape.
        let thresholds = PatternThresholds {
            time_min_lift: 0.0,
            ..PatternThresholds::default()
        };
        let patterns = derive_patterns(&records, &thresholds);
        assert_eq!(patterns.time_patterns.len(), 1);
        let bucket = patterns.time_patterns.values().next().unwrap();
        assert_eq!(bucket.records, 25);
        assert!(bucket.weekday < 7);
        assert!(bucket.hour < 24);
    }

    #[test]
    fn test_subject_patterns_sorted_and_anchored() {
        let records = incident_corpus(10);
        let patterns = derive_patterns(&records, &PatternThresholds::default());
        // All subjects share the "server alert" prefix.
        assert_eq!(patterns.subject_patterns.len(), 1);
        let subject = &patterns.subject_patterns[0];
        assert!(subject.pattern.starts_with("(?i)^"));
        assert_eq!(subject.support, 10);
        let re = regex::Regex::new(&subject.pattern).unwrap();
        assert!(re.is_match("server alert 99"));
        assert!(!re.is_match("about server alert"));
    }

    #[test]
    fn test_derivation_idempotent() {
        let mut records = incident_corpus(12);
        records.extend((0..6).map(|i| {
            record(
                "billing@vendor.com",
                &format!("Invoice {i}"),
                "invoice attached for processing",
                Category::Request,
                Urgency::Medium,
                ActionKind::UpdateDocument,
                if i % 2 == 0 {
                    FeedbackOutcome::Success
                } else {
                    FeedbackOutcome::Rejected
                },
            )
        }));

        let thresholds = PatternThresholds::default();
        let first = derive_patterns(&records, &thresholds);
        let second = derive_patterns(&records, &thresholds);
        assert_eq!(first, second);
    }

    #[test]
    fn test_adjust_sender_lifts_classification() {
        let store = PatternStore::new();
        store.rederive(&incident_corpus(15));
        let patterns = store.snapshot();

        // New signal from the same sender, initially request/medium.
        let prepared = preprocess(Signal::new(
            SignalSource::Email,
            "Please check disk usage",
            "can someone take a look",
            "alerts@x.com",
        ));
        let classification = Classification::new(
            Urgency::Medium,
            Importance::Medium,
            Category::Request,
            0.70,
            "initial",
        );

        let adjusted = patterns.adjust(&prepared, &classification);
        assert_eq!(adjusted.category, Category::Incident);
        // Raised exactly one step, not straight to the sender average.
        assert_eq!(adjusted.urgency, Urgency::High);
        assert!(adjusted.confidence > classification.confidence);
        assert!(adjusted.confidence <= classification.confidence + 0.1 + 1e-9);
    }

    #[test]
    fn test_adjust_bounds_confidence_gain() {
        let store = PatternStore::new();
        let mut records = incident_corpus(15);
        // Make "database" a boosted keyword too.
        records.extend(incident_corpus(5));
        store.rederive(&records);
        let patterns = store.snapshot();

        let prepared = preprocess(Signal::new(
            SignalSource::Email,
            "database looks slow",
            "database latency creeping up",
            "alerts@x.com",
        ));
        let classification = Classification::new(
            Urgency::Medium,
            Importance::Medium,
            Category::Request,
            0.70,
            "initial",
        );
        let adjusted = patterns.adjust(&prepared, &classification);
        // Sender and keyword both fire; gain still capped at +0.1 and
        // urgency still one step.
        assert!(adjusted.confidence <= 0.80 + 1e-9);
        assert_eq!(adjusted.urgency, Urgency::High);
    }

    #[test]
    fn test_adjust_without_patterns_is_identity() {
        let patterns = Patterns::default();
        let prepared = preprocess(Signal::new(
            SignalSource::Chat,
            "hello",
            "just checking in",
            "friend@x.com",
        ));
        let classification = Classification::new(
            Urgency::Low,
            Importance::Low,
            Category::Discussion,
            0.9,
            "chat",
        );
        assert_eq!(patterns.adjust(&prepared, &classification), classification);
    }

    #[test]
    fn test_preferred_action() {
        let store = PatternStore::new();
        store.rederive(&incident_corpus(10));
        let patterns = store.snapshot();
        assert_eq!(
            patterns.preferred_action(Category::Incident),
            Some(ActionKind::CreateTask)
        );
        assert_eq!(patterns.preferred_action(Category::Spam), None);
    }

    #[tokio::test]
    async fn test_snapshot_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");

        let store = PatternStore::new();
        store.rederive(&incident_corpus(12));
        store.save_snapshot(&path).await.unwrap();

        let restored = PatternStore::new();
        restored.load_snapshot(&path).await.unwrap();
        assert_eq!(
            restored.snapshot().as_ref(),
            store.snapshot().as_ref()
        );
    }
}

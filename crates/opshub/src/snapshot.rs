// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dashboard snapshot service
//!
//! Read-only aggregate views for external consumers: queue depth,
//! in-flight signals per pipeline stage, a bounded ring of recent
//! decisions, pending reviews, rolling success and cache-hit rates,
//! per-minute throughput, error counts by kind, uptime, and the latest
//! learning insights. Snapshots are cached briefly so dashboard
//! polling never hammers the underlying stores. Consumers never
//! mutate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::classifier::Classifier;
use crate::constants::{DEFAULT_RECENT_DECISIONS, DEFAULT_SNAPSHOT_TTL};
use crate::decision::{ActionKind, Decision, TargetPlatform};
use crate::feedback::FeedbackTracker;
use crate::ingest::SignalQueue;
use crate::review::ReviewQueue;

/// Pipeline stages tracked for the in-flight view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Normalization and fingerprinting
    Preprocess,
    /// Oracle classification
    Classify,
    /// Rule cascade
    Decide,
    /// Payload construction
    Build,
    /// Waiting in the review queue
    Review,
    /// Executor call in progress
    Dispatch,
}

impl PipelineStage {
    const ALL: [PipelineStage; 6] = [
        PipelineStage::Preprocess,
        PipelineStage::Classify,
        PipelineStage::Decide,
        PipelineStage::Build,
        PipelineStage::Review,
        PipelineStage::Dispatch,
    ];

    fn index(self) -> usize {
        match self {
            PipelineStage::Preprocess => 0,
            PipelineStage::Classify => 1,
            PipelineStage::Decide => 2,
            PipelineStage::Build => 3,
            PipelineStage::Review => 4,
            PipelineStage::Dispatch => 5,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Preprocess => write!(f, "preprocess"),
            PipelineStage::Classify => write!(f, "classify"),
            PipelineStage::Decide => write!(f, "decide"),
            PipelineStage::Build => write!(f, "build"),
            PipelineStage::Review => write!(f, "review"),
            PipelineStage::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// Per-stage in-flight counters
#[derive(Default)]
pub struct StageTracker {
    counters: [AtomicUsize; 6],
}

impl StageTracker {
    /// Fresh tracker with all stages at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one signal entering a stage.
    pub fn enter(&self, stage: PipelineStage) {
        self.counters[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one signal leaving a stage.
    pub fn exit(&self, stage: PipelineStage) {
        let counter = &self.counters[stage.index()];
        let mut current = counter.load(Ordering::Relaxed);
        while current > 0 {
            match counter.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Stage name → current in-flight count.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, usize> {
        PipelineStage::ALL
            .iter()
            .map(|stage| {
                (
                    stage.to_string(),
                    self.counters[stage.index()].load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

/// One entry in the recent-decision ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentDecision {
    /// Decision id
    pub decision_id: String,
    /// Signal id
    pub signal_id: String,
    /// Action decided
    pub action: ActionKind,
    /// Target platform
    pub target_platform: TargetPlatform,
    /// Numeric priority
    pub priority: u8,
    /// Whether approval was required
    pub requires_approval: bool,
    /// Terminal outcome once known ("success", "rejected", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl RecentDecision {
    /// Project a decision into its dashboard form.
    #[must_use]
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            decision_id: decision.decision_id.clone(),
            signal_id: decision.signal_id.clone(),
            action: decision.action,
            target_platform: decision.target_platform,
            priority: decision.priority,
            requires_approval: decision.requires_approval,
            outcome: None,
            decided_at: decision.decided_at,
        }
    }
}

/// The read-only structure served to dashboard consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    /// When the snapshot was generated
    pub generated_at: DateTime<Utc>,
    /// Process uptime
    pub uptime: Duration,
    /// Signals waiting in the ingress queue
    pub queue_depth: usize,
    /// In-flight signals per pipeline stage
    pub in_flight: HashMap<String, usize>,
    /// Most recent decisions, newest first
    pub recent_decisions: Vec<RecentDecision>,
    /// Items waiting in the review queue
    pub pending_reviews: usize,
    /// Rolling success rate from the feedback tracker
    pub rolling_success_rate: f64,
    /// Classification cache hit rate
    pub cache_hit_rate: f64,
    /// Signals that reached a terminal outcome in the last minute
    pub throughput_per_minute: usize,
    /// Error counts by kind
    pub error_counts: HashMap<String, u64>,
    /// Errors over terminal outcomes
    pub error_rate: f64,
    /// Latest learning insights
    pub insights: Vec<String>,
}

/// Aggregates core state into cached dashboard snapshots
pub struct MetricsAggregator {
    started: Instant,
    ttl: Duration,
    queue: Arc<SignalQueue>,
    review: Arc<ReviewQueue>,
    tracker: Arc<FeedbackTracker>,
    classifier: Arc<Classifier>,
    stages: Arc<StageTracker>,
    recent: Mutex<VecDeque<RecentDecision>>,
    recent_cap: usize,
    completions: Mutex<VecDeque<Instant>>,
    errors: Mutex<HashMap<String, u64>>,
    insights: Mutex<Vec<String>>,
    cached: Mutex<Option<(Instant, DashboardData)>>,
}

impl MetricsAggregator {
    /// Create an aggregator over the core's shared stores.
    pub fn new(
        queue: Arc<SignalQueue>,
        review: Arc<ReviewQueue>,
        tracker: Arc<FeedbackTracker>,
        classifier: Arc<Classifier>,
        stages: Arc<StageTracker>,
    ) -> Self {
        Self {
            started: Instant::now(),
            ttl: DEFAULT_SNAPSHOT_TTL,
            queue,
            review,
            tracker,
            classifier,
            stages,
            recent: Mutex::new(VecDeque::new()),
            recent_cap: DEFAULT_RECENT_DECISIONS,
            completions: Mutex::new(VecDeque::new()),
            errors: Mutex::new(HashMap::new()),
            insights: Mutex::new(Vec::new()),
            cached: Mutex::new(None),
        }
    }

    /// Override the snapshot cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Record a decision into the bounded ring.
    pub fn record_decision(&self, decision: &Decision) {
        let mut recent = self.recent.lock();
        if recent.len() >= self.recent_cap {
            recent.pop_front();
        }
        recent.push_back(RecentDecision::from_decision(decision));
    }

    /// Attach a terminal outcome to a ring entry and count throughput.
    pub fn record_outcome(&self, decision_id: &str, outcome: &str) {
        {
            let mut recent = self.recent.lock();
            if let Some(entry) = recent
                .iter_mut()
                .rev()
                .find(|entry| entry.decision_id == decision_id)
            {
                entry.outcome = Some(outcome.to_string());
            }
        }
        let now = Instant::now();
        let mut completions = self.completions.lock();
        completions.push_back(now);
        while let Some(&front) = completions.front() {
            if now.duration_since(front) > Duration::from_secs(60) {
                completions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count an error by kind.
    pub fn record_error(&self, kind: &str) {
        *self.errors.lock().entry(kind.to_string()).or_default() += 1;
    }

    /// Replace the learning insights shown on the dashboard.
    pub fn set_insights(&self, insights: Vec<String>) {
        *self.insights.lock() = insights;
    }

    /// Produce (or reuse) a snapshot. Consumers never mutate.
    #[must_use]
    pub fn snapshot(&self) -> DashboardData {
        {
            let cached = self.cached.lock();
            if let Some((at, data)) = cached.as_ref() {
                if at.elapsed() < self.ttl {
                    return data.clone();
                }
            }
        }

        let data = self.build_snapshot();
        *self.cached.lock() = Some((Instant::now(), data.clone()));
        data
    }

    fn build_snapshot(&self) -> DashboardData {
        let stats = self.tracker.stats();
        let errors = self.errors.lock().clone();
        let error_total: u64 = errors.values().sum();
        let terminal = stats.total.max(1);

        let now = Instant::now();
        let throughput = {
            let completions = self.completions.lock();
            completions
                .iter()
                .filter(|at| now.duration_since(**at) <= Duration::from_secs(60))
                .count()
        };

        let recent_decisions: Vec<RecentDecision> =
            self.recent.lock().iter().rev().cloned().collect();

        DashboardData {
            generated_at: Utc::now(),
            uptime: self.started.elapsed(),
            queue_depth: self.queue.len(),
            in_flight: self.stages.snapshot(),
            recent_decisions,
            pending_reviews: self.review.pending_count(),
            rolling_success_rate: stats.rolling_success_rate,
            cache_hit_rate: self.classifier.cache_stats().hit_rate(),
            throughput_per_minute: throughput,
            error_counts: errors,
            error_rate: error_total as f64 / terminal as f64,
            insights: self.insights.lock().clone(),
        }
    }
}

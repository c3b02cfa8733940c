// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Centralized defaults for the OpsHub core
//!
//! Every tunable documented in the configuration surface lives here so
//! the defaults are greppable in one place. [`crate::config::CoreConfig`]
//! reads these and allows per-deployment overrides.

use std::time::Duration;

/// Classification cache capacity (`CACHE_MAX_SIZE`).
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Classification cache TTL (`CACHE_TTL_MS`).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(3_600_000);

/// Title similarity at or above which a task is a duplicate
/// (`DUPLICATE_THRESHOLD`).
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.85;

/// Confidence below which decisions require approval
/// (`CONFIDENCE_APPROVAL_THRESHOLD`).
pub const DEFAULT_CONFIDENCE_APPROVAL_THRESHOLD: f64 = 0.60;

/// Signals admitted per rolling window (`RATE_LIMIT_N`).
pub const DEFAULT_RATE_LIMIT_N: usize = 10;

/// Rolling admission window (`RATE_LIMIT_WINDOW_MS`).
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_millis(60_000);

/// Signal queue capacity (`QUEUE_CAPACITY`).
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Review item time-to-live (`MAX_REVIEW_TTL_MS`).
pub const DEFAULT_REVIEW_TTL: Duration = Duration::from_millis(3_600_000);

/// Review scanner wake interval.
pub const DEFAULT_REVIEW_TICK: Duration = Duration::from_secs(60);

/// Per-platform executor minimum interval between calls
/// (`EXECUTOR_RATE_LIMIT_MS`) when no platform-specific value is set.
pub const DEFAULT_EXECUTOR_RATE_LIMIT: Duration = Duration::from_millis(1000);

/// Maximum executor attempts including the first (`MAX_EXECUTOR_ATTEMPTS`).
pub const DEFAULT_MAX_EXECUTOR_ATTEMPTS: u32 = 3;

/// Feedback records required before a sender pattern is emitted
/// (`PATTERN_SENDER_THRESHOLD`).
pub const DEFAULT_PATTERN_SENDER_THRESHOLD: usize = 10;

/// Signal occurrences required before an urgency keyword is emitted
/// (`PATTERN_KEYWORD_THRESHOLD`).
pub const DEFAULT_PATTERN_KEYWORD_THRESHOLD: usize = 5;

/// Records required before a time-bucket pattern is considered.
pub const DEFAULT_PATTERN_TIME_THRESHOLD: usize = 20;

/// Success-rate lift (percentage points) a time bucket needs over the
/// corpus baseline.
pub const DEFAULT_PATTERN_TIME_LIFT: f64 = 0.20;

/// Records required before a category-action affinity is emitted.
pub const DEFAULT_PATTERN_AFFINITY_THRESHOLD: usize = 10;

/// Success rate a category-action pair needs to qualify as an affinity.
pub const DEFAULT_PATTERN_AFFINITY_RATE: f64 = 0.80;

/// Few-shot example cap on a prompt template (`PROMPT_MAX_EXAMPLES`).
pub const DEFAULT_PROMPT_MAX_EXAMPLES: usize = 10;

/// Success-rate drop (percentage points) that triggers template rollback
/// (`AB_DEGRADATION_ROLLBACK_PP`).
pub const DEFAULT_AB_DEGRADATION_ROLLBACK: f64 = 0.10;

/// Evaluations per variant before an A/B experiment concludes.
pub const DEFAULT_AB_EVALUATIONS: usize = 30;

/// Oracle call deadline (`ORACLE_TIMEOUT`).
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Executor call deadline per attempt (`EXEC_TIMEOUT`).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Dashboard snapshot cache TTL.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_millis(5_000);

/// Bounded ring of recent decisions kept for the dashboard.
pub const DEFAULT_RECENT_DECISIONS: usize = 100;

/// Per-event-type history ring on the event bus.
pub const DEFAULT_BUS_HISTORY: usize = 100;

/// Maximum reconnection attempts for a fatally-failed subscriber.
pub const DEFAULT_BUS_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay for subscriber reconnection backoff.
pub const DEFAULT_BUS_RECONNECT_BASE: Duration = Duration::from_millis(100);

/// Cap for subscriber reconnection backoff.
pub const DEFAULT_BUS_RECONNECT_CAP: Duration = Duration::from_secs(5);

/// Base delay for dispatcher retry backoff.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);

/// Cap for dispatcher retry backoff.
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(5);

/// Most recent task titles retained by the duplicate index.
pub const DEFAULT_DUPLICATE_CORPUS: usize = 500;

/// Window of recent feedback records for the rolling success rate.
pub const DEFAULT_ROLLING_WINDOW: usize = 200;

/// Body prefix length folded into the signal fingerprint.
pub const FINGERPRINT_BODY_PREFIX: usize = 256;

/// Body length above which a signal is summarized as information
/// rather than sent to the oracle.
pub const OVERSIZE_BODY_CHARS: usize = 5000;

/// Default capacity for internal mpsc channels.
pub const DEFAULT_MPSC_CHANNEL_CAPACITY: usize = 64;

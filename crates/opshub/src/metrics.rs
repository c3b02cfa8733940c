// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid (e.g., "{name}_invalid").
#![allow(clippy::expect_used)]

//! Prometheus metric names and safe registration for the OpsHub core.
//!
//! Metric names are centralized here so they stay consistent across the
//! crate. Naming follows Prometheus conventions: counters end with
//! `_total`. OpsHub is a library that may be linked into several
//! binaries; when two components register the same metric name the
//! default registry errors, and the upstream `register_*` macros panic
//! on that. The helpers here log and continue instead, handing back the
//! already-registered metric.

use prometheus::{Counter, CounterVec, Opts};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use tracing::{debug, warn};

// ============================================================================
// Counter metric names (_total suffix)
// ============================================================================

/// Total signals accepted at ingress.
pub const METRIC_SIGNALS_INGESTED_TOTAL: &str = "opshub_signals_ingested_total";

/// Total signals rejected by the rolling-window rate limiter.
pub const METRIC_SIGNALS_RATE_LIMITED_TOTAL: &str = "opshub_signals_rate_limited_total";

/// Total signals dropped by the queue overflow policy.
pub const METRIC_SIGNALS_DROPPED_TOTAL: &str = "opshub_signals_dropped_total";

/// Classification cache hits.
pub const METRIC_CACHE_HITS_TOTAL: &str = "opshub_classification_cache_hits_total";

/// Classification cache misses.
pub const METRIC_CACHE_MISSES_TOTAL: &str = "opshub_classification_cache_misses_total";

/// Oracle invocations (label: outcome = ok | parse_retry | fallback | error).
pub const METRIC_ORACLE_CALLS_TOTAL: &str = "opshub_oracle_calls_total";

/// Decisions emitted (label: action).
pub const METRIC_DECISIONS_TOTAL: &str = "opshub_decisions_total";

/// Dispatcher attempts (label: platform).
pub const METRIC_DISPATCH_ATTEMPTS_TOTAL: &str = "opshub_dispatch_attempts_total";

/// Dispatcher retries after transient errors (label: platform).
pub const METRIC_DISPATCH_RETRIES_TOTAL: &str = "opshub_dispatch_retries_total";

/// Dispatcher terminal failures (label: platform).
pub const METRIC_DISPATCH_FAILURES_TOTAL: &str = "opshub_dispatch_failures_total";

/// Task creations skipped as duplicates at dispatch time.
pub const METRIC_DISPATCH_DUPLICATES_SKIPPED_TOTAL: &str =
    "opshub_dispatch_duplicates_skipped_total";

/// Events emitted on the bus (label: priority).
pub const METRIC_BUS_EVENTS_TOTAL: &str = "opshub_bus_events_total";

/// Subscriber callback errors on the bus.
pub const METRIC_BUS_SUBSCRIBER_ERRORS_TOTAL: &str = "opshub_bus_subscriber_errors_total";

/// Subscriber reconnection attempts on the bus.
pub const METRIC_BUS_RECONNECT_ATTEMPTS_TOTAL: &str = "opshub_bus_reconnect_attempts_total";

/// Review items resolved by timeout.
pub const METRIC_REVIEW_TIMEOUTS_TOTAL: &str = "opshub_review_timeouts_total";

/// Duplicate-index lookups that failed and were treated as no-match.
pub const METRIC_DUPLICATE_LOOKUP_FAILURES_TOTAL: &str =
    "opshub_duplicate_lookup_failures_total";

// ============================================================================
// Registered metric handles
// ============================================================================

pub(crate) static SIGNALS_INGESTED: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_SIGNALS_INGESTED_TOTAL,
        "Total signals accepted at ingress",
    )
});

pub(crate) static SIGNALS_RATE_LIMITED: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_SIGNALS_RATE_LIMITED_TOTAL,
        "Total signals rejected by the ingress rate limiter",
    )
});

pub(crate) static SIGNALS_DROPPED: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_SIGNALS_DROPPED_TOTAL,
        "Total signals dropped by the queue overflow policy",
    )
});

pub(crate) static CACHE_HITS: LazyLock<Counter> = LazyLock::new(|| {
    counter(METRIC_CACHE_HITS_TOTAL, "Classification cache hits")
});

pub(crate) static CACHE_MISSES: LazyLock<Counter> = LazyLock::new(|| {
    counter(METRIC_CACHE_MISSES_TOTAL, "Classification cache misses")
});

pub(crate) static ORACLE_CALLS: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(METRIC_ORACLE_CALLS_TOTAL, "Oracle invocations by outcome"),
        &["outcome"],
    )
});

pub(crate) static DECISIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(METRIC_DECISIONS_TOTAL, "Decisions emitted by action"),
        &["action"],
    )
});

pub(crate) static DISPATCH_ATTEMPTS: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_DISPATCH_ATTEMPTS_TOTAL,
            "Dispatcher attempts by platform",
        ),
        &["platform"],
    )
});

pub(crate) static DISPATCH_RETRIES: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_DISPATCH_RETRIES_TOTAL,
            "Dispatcher retries after transient errors by platform",
        ),
        &["platform"],
    )
});

pub(crate) static DISPATCH_FAILURES: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_DISPATCH_FAILURES_TOTAL,
            "Dispatcher terminal failures by platform",
        ),
        &["platform"],
    )
});

pub(crate) static DISPATCH_DUPLICATES_SKIPPED: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_DISPATCH_DUPLICATES_SKIPPED_TOTAL,
        "Task creations skipped as duplicates at dispatch time",
    )
});

pub(crate) static BUS_EVENTS: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(METRIC_BUS_EVENTS_TOTAL, "Events emitted on the bus"),
        &["priority"],
    )
});

pub(crate) static BUS_SUBSCRIBER_ERRORS: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_BUS_SUBSCRIBER_ERRORS_TOTAL,
        "Subscriber callback errors on the bus",
    )
});

pub(crate) static BUS_RECONNECT_ATTEMPTS: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_BUS_RECONNECT_ATTEMPTS_TOTAL,
        "Subscriber reconnection attempts on the bus",
    )
});

pub(crate) static REVIEW_TIMEOUTS: LazyLock<Counter> = LazyLock::new(|| {
    counter(METRIC_REVIEW_TIMEOUTS_TOTAL, "Review items resolved by timeout")
});

pub(crate) static DUPLICATE_LOOKUP_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
    counter(
        METRIC_DUPLICATE_LOOKUP_FAILURES_TOTAL,
        "Duplicate-index lookups that failed open",
    )
});

// ============================================================================
// Safe registration helpers
// ============================================================================

static COUNTERS: LazyLock<Mutex<HashMap<String, Counter>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static COUNTER_VECS: LazyLock<Mutex<HashMap<String, CounterVec>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn counter(name: &str, help: &str) -> Counter {
    warn_invalid_counter_name(name);

    let mut counters = COUNTERS.lock().expect("metrics registry poisoned");
    if let Some(existing) = counters.get(name) {
        return existing.clone();
    }

    let metric = Counter::new(name, help).unwrap_or_else(|e| {
        warn!(metric = name, error = %e, "Failed to create Counter");
        Counter::new(format!("{name}_invalid"), help)
            .expect("fallback counter name should be valid")
    });

    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = name, "Counter already registered; continuing");
            }
            other => {
                warn!(
                    metric = name,
                    error = %other,
                    "Counter registration failed; continuing without global registration"
                );
            }
        }
    }

    counters.insert(name.to_string(), metric.clone());
    metric
}

fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let name = opts.name.clone();
    warn_invalid_counter_name(&name);

    let mut vecs = COUNTER_VECS.lock().expect("metrics registry poisoned");
    if let Some(existing) = vecs.get(&name) {
        return existing.clone();
    }

    let metric = CounterVec::new(opts, labels).unwrap_or_else(|e| {
        warn!(metric = %name, error = %e, "Failed to create CounterVec");
        CounterVec::new(
            Opts::new(format!("{name}_invalid"), "invalid counter vec"),
            labels,
        )
        .expect("fallback counter vec should be valid")
    });

    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = %name, "CounterVec already registered; continuing");
            }
            other => {
                warn!(
                    metric = %name,
                    error = %other,
                    "CounterVec registration failed; continuing without global registration"
                );
            }
        }
    }

    vecs.insert(name, metric.clone());
    metric
}

/// Counter names should end with `_total` per Prometheus conventions.
fn validate_counter_name(name: &str) -> bool {
    name.ends_with("_total")
}

#[inline]
fn warn_invalid_counter_name(name: &str) {
    if !validate_counter_name(name) {
        warn!(
            metric = name,
            "Counter metric name should end with '_total' per Prometheus conventions"
        );
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Core configuration surface
//!
//! [`CoreConfig`] collects every tunable the pipeline recognizes.
//! Values come from [`crate::constants`] defaults, `with_*` builder
//! overrides, or `OPSHUB_*` environment variables via
//! [`CoreConfig::from_env`]. Unparseable environment values fall back
//! to the default and log a warning rather than failing startup.

use std::collections::HashMap;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AB_DEGRADATION_ROLLBACK, DEFAULT_AB_EVALUATIONS, DEFAULT_CACHE_MAX_SIZE,
    DEFAULT_CACHE_TTL, DEFAULT_CONFIDENCE_APPROVAL_THRESHOLD, DEFAULT_DUPLICATE_CORPUS,
    DEFAULT_DUPLICATE_THRESHOLD, DEFAULT_EXECUTOR_RATE_LIMIT, DEFAULT_EXEC_TIMEOUT,
    DEFAULT_MAX_EXECUTOR_ATTEMPTS, DEFAULT_ORACLE_TIMEOUT, DEFAULT_PROMPT_MAX_EXAMPLES,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RATE_LIMIT_N, DEFAULT_RATE_LIMIT_WINDOW,
    DEFAULT_REVIEW_TICK, DEFAULT_REVIEW_TTL,
};
use crate::decision::TargetPlatform;
use crate::patterns::PatternThresholds;
use crate::review::TimeoutPolicy;

/// Environment variable prefix for all recognized keys.
const ENV_PREFIX: &str = "OPSHUB_";

/// Configuration for the OpsHub core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Classification cache capacity (`OPSHUB_CACHE_MAX_SIZE`)
    pub cache_max_size: usize,
    /// Classification cache TTL (`OPSHUB_CACHE_TTL_MS`)
    pub cache_ttl: Duration,
    /// Duplicate similarity threshold (`OPSHUB_DUPLICATE_THRESHOLD`)
    pub duplicate_threshold: f64,
    /// Recent titles retained by the duplicate index
    pub duplicate_corpus: usize,
    /// Confidence below which approval is required
    /// (`OPSHUB_CONFIDENCE_APPROVAL_THRESHOLD`)
    pub confidence_approval_threshold: f64,
    /// Signals admitted per window (`OPSHUB_RATE_LIMIT_N`)
    pub rate_limit_n: usize,
    /// Rolling admission window (`OPSHUB_RATE_LIMIT_WINDOW_MS`)
    pub rate_limit_window: Duration,
    /// Signal queue capacity (`OPSHUB_QUEUE_CAPACITY`)
    pub queue_capacity: usize,
    /// Default review item TTL (`OPSHUB_MAX_REVIEW_TTL_MS`)
    pub review_ttl: Duration,
    /// Review scanner wake interval
    pub review_tick: Duration,
    /// What happens to a review item whose timeout elapses
    pub review_timeout_policy: TimeoutPolicy,
    /// Per-platform minimum interval between executor calls
    /// (`OPSHUB_EXECUTOR_RATE_LIMIT_MS` sets the fallback)
    pub executor_rate_limits: HashMap<TargetPlatform, Duration>,
    /// Fallback executor interval for platforms without an entry
    pub executor_rate_limit: Duration,
    /// Maximum executor attempts (`OPSHUB_MAX_EXECUTOR_ATTEMPTS`)
    pub max_executor_attempts: u32,
    /// Pattern detection thresholds
    /// (`OPSHUB_PATTERN_SENDER_THRESHOLD`, `OPSHUB_PATTERN_KEYWORD_THRESHOLD`)
    pub pattern_thresholds: PatternThresholds,
    /// Few-shot cap on prompt templates (`OPSHUB_PROMPT_MAX_EXAMPLES`)
    pub prompt_max_examples: usize,
    /// Rollback trigger in success-rate percentage points
    /// (`OPSHUB_AB_DEGRADATION_ROLLBACK_PP`)
    pub ab_degradation_rollback: f64,
    /// Evaluations per variant before an A/B experiment concludes
    pub ab_evaluations: usize,
    /// Oracle call deadline (`OPSHUB_ORACLE_TIMEOUT_MS`)
    pub oracle_timeout: Duration,
    /// Executor attempt deadline (`OPSHUB_EXEC_TIMEOUT_MS`)
    pub exec_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        // Chat is the one platform with a documented stricter default.
        let mut executor_rate_limits = HashMap::new();
        executor_rate_limits.insert(TargetPlatform::Chat, Duration::from_millis(1000));

        Self {
            cache_max_size: DEFAULT_CACHE_MAX_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            duplicate_corpus: DEFAULT_DUPLICATE_CORPUS,
            confidence_approval_threshold: DEFAULT_CONFIDENCE_APPROVAL_THRESHOLD,
            rate_limit_n: DEFAULT_RATE_LIMIT_N,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            review_ttl: DEFAULT_REVIEW_TTL,
            review_tick: DEFAULT_REVIEW_TICK,
            review_timeout_policy: TimeoutPolicy::Reject,
            executor_rate_limits,
            executor_rate_limit: DEFAULT_EXECUTOR_RATE_LIMIT,
            max_executor_attempts: DEFAULT_MAX_EXECUTOR_ATTEMPTS,
            pattern_thresholds: PatternThresholds::default(),
            prompt_max_examples: DEFAULT_PROMPT_MAX_EXAMPLES,
            ab_degradation_rollback: DEFAULT_AB_DEGRADATION_ROLLBACK,
            ab_evaluations: DEFAULT_AB_EVALUATIONS,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

impl CoreConfig {
    /// Create a config with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from defaults overridden by `OPSHUB_*`
    /// environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("CACHE_MAX_SIZE") {
            config.cache_max_size = v;
        }
        if let Some(v) = env_millis("CACHE_TTL_MS") {
            config.cache_ttl = v;
        }
        if let Some(v) = env_f64("DUPLICATE_THRESHOLD") {
            config.duplicate_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_f64("CONFIDENCE_APPROVAL_THRESHOLD") {
            config.confidence_approval_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_usize("RATE_LIMIT_N") {
            config.rate_limit_n = v;
        }
        if let Some(v) = env_millis("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit_window = v;
        }
        if let Some(v) = env_usize("QUEUE_CAPACITY") {
            config.queue_capacity = v;
        }
        if let Some(v) = env_millis("MAX_REVIEW_TTL_MS") {
            config.review_ttl = v;
        }
        if let Some(v) = env_millis("EXECUTOR_RATE_LIMIT_MS") {
            config.executor_rate_limit = v;
        }
        if let Some(v) = env_u32("MAX_EXECUTOR_ATTEMPTS") {
            config.max_executor_attempts = v.max(1);
        }
        if let Some(v) = env_usize("PATTERN_SENDER_THRESHOLD") {
            config.pattern_thresholds.sender_min_records = v;
        }
        if let Some(v) = env_usize("PATTERN_KEYWORD_THRESHOLD") {
            config.pattern_thresholds.keyword_min_occurrences = v;
        }
        if let Some(v) = env_usize("PROMPT_MAX_EXAMPLES") {
            config.prompt_max_examples = v;
        }
        if let Some(v) = env_f64("AB_DEGRADATION_ROLLBACK_PP") {
            // Accept either percentage points (10) or a fraction (0.10).
            config.ab_degradation_rollback = if v > 1.0 { v / 100.0 } else { v };
        }
        if let Some(v) = env_millis("ORACLE_TIMEOUT_MS") {
            config.oracle_timeout = v;
        }
        if let Some(v) = env_millis("EXEC_TIMEOUT_MS") {
            config.exec_timeout = v;
        }

        config
    }

    /// Set the classification cache capacity.
    #[must_use]
    pub fn with_cache_max_size(mut self, size: usize) -> Self {
        self.cache_max_size = size;
        self
    }

    /// Set the classification cache TTL.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the duplicate similarity threshold.
    #[must_use]
    pub fn with_duplicate_threshold(mut self, threshold: f64) -> Self {
        self.duplicate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the approval confidence threshold.
    #[must_use]
    pub fn with_confidence_approval_threshold(mut self, threshold: f64) -> Self {
        self.confidence_approval_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the ingress rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, n: usize, window: Duration) -> Self {
        self.rate_limit_n = n;
        self.rate_limit_window = window;
        self
    }

    /// Set the signal queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the default review TTL.
    #[must_use]
    pub fn with_review_ttl(mut self, ttl: Duration) -> Self {
        self.review_ttl = ttl;
        self
    }

    /// Set the review scanner wake interval.
    #[must_use]
    pub fn with_review_tick(mut self, tick: Duration) -> Self {
        self.review_tick = tick;
        self
    }

    /// Set the timeout policy for expired review items.
    #[must_use]
    pub fn with_review_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.review_timeout_policy = policy;
        self
    }

    /// Set a per-platform executor rate limit.
    #[must_use]
    pub fn with_executor_rate_limit(
        mut self,
        platform: TargetPlatform,
        interval: Duration,
    ) -> Self {
        self.executor_rate_limits.insert(platform, interval);
        self
    }

    /// Set the maximum executor attempts.
    #[must_use]
    pub fn with_max_executor_attempts(mut self, attempts: u32) -> Self {
        self.max_executor_attempts = attempts.max(1);
        self
    }

    /// Set the pattern detection thresholds.
    #[must_use]
    pub fn with_pattern_thresholds(mut self, thresholds: PatternThresholds) -> Self {
        self.pattern_thresholds = thresholds;
        self
    }

    /// Set the oracle call deadline.
    #[must_use]
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// Set the executor attempt deadline.
    #[must_use]
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    /// Executor interval for a platform, falling back to the default.
    #[must_use]
    pub fn executor_interval(&self, platform: TargetPlatform) -> Duration {
        self.executor_rate_limits
            .get(&platform)
            .copied()
            .unwrap_or(self.executor_rate_limit)
    }
}

fn env_raw(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env_raw(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    let raw = env_raw(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    let raw = env_raw(key)?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            tracing::warn!(key = key, value = %raw, "Ignoring unparseable config value");
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_u32(key).map(|ms| Duration::from_millis(u64::from(ms)))
}

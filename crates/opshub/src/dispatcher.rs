// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Action dispatch
//!
//! Routes approved decisions to per-platform executors. Each platform
//! has an independent token-bucket rate limiter (chat defaults to one
//! call per second) and every attempt is bounded by a deadline.
//! Transient failures (timeout, 5xx, 429, network) retry with
//! exponential backoff and jitter up to a bounded attempt count;
//! permanent failures surface immediately. Before `create_task` the
//! dispatcher re-consults the duplicate index; a match that appeared
//! after the decision was made produces a skipped success and no
//! external side effect. Batches are partial: one item's failure never
//! aborts its siblings.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_EXECUTOR_RATE_LIMIT, DEFAULT_EXEC_TIMEOUT, DEFAULT_MAX_EXECUTOR_ATTEMPTS,
    DEFAULT_RETRY_BASE, DEFAULT_RETRY_CAP,
};
use crate::decision::{ActionKind, Decision, TargetPlatform};
use crate::duplicates::DuplicateIndex;
use crate::error::{Error, Result};
use crate::executor::{ExecError, ExecErrorKind, ExecutionResult, Executor};
use crate::metrics;
use crate::payload::{BuiltPayload, ParameterBuilder};
use crate::preprocess::PreparedSignal;

/// Dispatcher tunables
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Attempts per decision, including the first
    pub max_attempts: u32,
    /// Deadline per attempt
    pub exec_timeout: Duration,
    /// Base backoff delay
    pub retry_base: Duration,
    /// Backoff cap
    pub retry_cap: Duration,
    /// Per-platform minimum interval between calls
    pub rate_limits: HashMap<TargetPlatform, Duration>,
    /// Interval for platforms without an entry
    pub default_rate_limit: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(TargetPlatform::Chat, Duration::from_millis(1000));
        Self {
            max_attempts: DEFAULT_MAX_EXECUTOR_ATTEMPTS,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            retry_cap: DEFAULT_RETRY_CAP,
            rate_limits,
            default_rate_limit: DEFAULT_EXECUTOR_RATE_LIMIT,
        }
    }
}

/// Token bucket: capacity one, refilled at one token per configured
/// interval.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
    refill_per_sec: f64,
}

impl TokenBucket {
    fn new(interval: Duration) -> Self {
        let refill_per_sec = if interval.is_zero() {
            f64::INFINITY
        } else {
            1.0 / interval.as_secs_f64()
        };
        Self {
            tokens: 1.0,
            capacity: 1.0,
            last_refill: Instant::now(),
            refill_per_sec,
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = Instant::now();
    }

    /// Consume one token, or report how long until one is available.
    fn try_consume(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec == 0.0 {
            return Err(Duration::from_secs(1));
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }
}

/// Result of a batch dispatch
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Decision id → result for items that succeeded (or skipped)
    pub successful: Vec<(String, ExecutionResult)>,
    /// Decision id → result for items that terminally failed
    pub failed: Vec<(String, ExecutionResult)>,
}

/// Per-platform rate-limited executor front
pub struct ActionDispatcher {
    config: DispatcherConfig,
    builder: ParameterBuilder,
    duplicates: Arc<DuplicateIndex>,
    executors: RwLock<HashMap<TargetPlatform, Arc<dyn Executor>>>,
    buckets: Mutex<HashMap<TargetPlatform, TokenBucket>>,
}

impl ActionDispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: DispatcherConfig,
        builder: ParameterBuilder,
        duplicates: Arc<DuplicateIndex>,
    ) -> Self {
        Self {
            config,
            builder,
            duplicates,
            executors: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register the executor for its platform; replaces any previous
    /// registration.
    pub fn register(&self, executor: Arc<dyn Executor>) {
        self.executors.write().insert(executor.platform(), executor);
    }

    /// Platforms with a registered executor.
    #[must_use]
    pub fn registered_platforms(&self) -> Vec<TargetPlatform> {
        self.executors.read().keys().copied().collect()
    }

    /// Dispatch one decision.
    ///
    /// Returns `Err` only for cancellation (which must leave no
    /// feedback record); every execution failure is a normal
    /// [`ExecutionResult`] with `success = false`.
    pub async fn dispatch(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let platform = decision.target_platform;

        if decision.requires_approval {
            // The review queue clears this flag on approval; reaching
            // here with it set is a pipeline bug, not an executor call.
            return Ok(ExecutionResult::failure(
                "decision still requires approval",
                started.elapsed(),
                "dispatcher",
            ));
        }
        if !decision.is_actionable() {
            return Ok(ExecutionResult::failure(
                "decision is not actionable",
                started.elapsed(),
                "dispatcher",
            ));
        }

        // Idempotency: a duplicate that appeared after the decision
        // still suppresses the task.
        if decision.action == ActionKind::CreateTask {
            let title = decision
                .parameters
                .get("title")
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| crate::engine::DecisionEngine::intended_title(prepared));
            if let Some(existing) = self.duplicates.find_duplicate(&title).await {
                metrics::DISPATCH_DUPLICATES_SKIPPED.inc();
                tracing::info!(
                    decision_id = %decision.decision_id,
                    existing = %existing.reference,
                    similarity = existing.similarity,
                    "Skipping task creation; duplicate appeared post-decision"
                );
                return Ok(ExecutionResult::skipped_duplicate(
                    existing.reference,
                    started.elapsed(),
                ));
            }
        }

        let built = match self.builder.build(decision, prepared) {
            Ok(built) => built,
            Err(Error::Validation {
                message,
                missing_fields,
            }) => {
                let mut result = ExecutionResult::failure(
                    format!("validation: {message}"),
                    started.elapsed(),
                    "parameter-builder",
                );
                result.data = Some(serde_json::json!({ "missing_fields": missing_fields }));
                metrics::DISPATCH_FAILURES
                    .with_label_values(&[&platform.to_string()])
                    .inc();
                return Ok(result);
            }
            Err(other) => {
                metrics::DISPATCH_FAILURES
                    .with_label_values(&[&platform.to_string()])
                    .inc();
                return Ok(ExecutionResult::failure(
                    other.to_string(),
                    started.elapsed(),
                    "parameter-builder",
                ));
            }
        };
        for warning in &built.warnings {
            tracing::debug!(decision_id = %decision.decision_id, warning, "Payload field defaulted");
        }

        let executor = match self.executors.read().get(&platform) {
            Some(executor) => Arc::clone(executor),
            None => {
                metrics::DISPATCH_FAILURES
                    .with_label_values(&[&platform.to_string()])
                    .inc();
                return Ok(ExecutionResult::failure(
                    format!("no executor registered for {platform}"),
                    started.elapsed(),
                    "dispatcher",
                ));
            }
        };

        self.acquire_token(platform, cancel).await?;
        self.execute_with_retry(&executor, decision, &built, started, cancel)
            .await
    }

    /// Dispatch a batch; failures do not abort siblings. Cancelled
    /// items are omitted from both lists.
    pub async fn dispatch_batch(
        &self,
        items: &[(Decision, PreparedSignal)],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let futures = items
            .iter()
            .map(|(decision, prepared)| async move {
                let result = self.dispatch(decision, prepared, cancel).await;
                (decision.decision_id.clone(), result)
            })
            .collect::<Vec<_>>();

        let mut outcome = BatchOutcome::default();
        for (decision_id, result) in futures::future::join_all(futures).await {
            match result {
                Ok(result) if result.success => outcome.successful.push((decision_id, result)),
                Ok(result) => outcome.failed.push((decision_id, result)),
                Err(Error::Cancelled) => {}
                Err(other) => {
                    outcome.failed.push((
                        decision_id,
                        ExecutionResult::failure(other.to_string(), Duration::ZERO, "dispatcher"),
                    ));
                }
            }
        }
        outcome
    }

    async fn acquire_token(
        &self,
        platform: TargetPlatform,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let wait = {
                let mut buckets = self.buckets.lock();
                let interval = self
                    .config
                    .rate_limits
                    .get(&platform)
                    .copied()
                    .unwrap_or(self.config.default_rate_limit);
                let bucket = buckets
                    .entry(platform)
                    .or_insert_with(|| TokenBucket::new(interval));
                match bucket.try_consume() {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn execute_with_retry(
        &self,
        executor: &Arc<dyn Executor>,
        decision: &Decision,
        built: &BuiltPayload,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let platform_label = decision.target_platform.to_string();
        let mut last_error = ExecError::new(ExecErrorKind::Network, "not attempted");

        for attempt in 1..=self.config.max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            metrics::DISPATCH_ATTEMPTS
                .with_label_values(&[&platform_label])
                .inc();

            let call = executor.execute(decision, &built.payload);
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(self.config.exec_timeout, call) => result,
            };

            let error = match result {
                Ok(Ok(data)) => {
                    self.record_created_task(decision, &data).await;
                    return Ok(ExecutionResult::success(
                        data,
                        started.elapsed(),
                        executor.name(),
                    ));
                }
                Ok(Err(error)) => error,
                Err(_) => ExecError::new(
                    ExecErrorKind::Timeout,
                    format!("attempt exceeded {:?}", self.config.exec_timeout),
                ),
            };

            tracing::warn!(
                decision_id = %decision.decision_id,
                attempt,
                error = %error,
                transient = error.is_transient(),
                "Executor attempt failed"
            );

            if !error.is_transient() || attempt == self.config.max_attempts {
                metrics::DISPATCH_FAILURES
                    .with_label_values(&[&platform_label])
                    .inc();
                return Ok(ExecutionResult::failure(
                    error.to_string(),
                    started.elapsed(),
                    executor.name(),
                ));
            }

            last_error = error;
            metrics::DISPATCH_RETRIES
                .with_label_values(&[&platform_label])
                .inc();
            let backoff = self.backoff_delay(attempt);
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
        }

        // Unreachable with max_attempts >= 1; kept for completeness.
        Ok(ExecutionResult::failure(
            last_error.to_string(),
            started.elapsed(),
            executor.name(),
        ))
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1), capped,
    /// plus up to half of itself in jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .retry_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.retry_cap);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..=jitter_ms))
        };
        base + jitter
    }

    async fn record_created_task(&self, decision: &Decision, data: &serde_json::Value) {
        if decision.action != ActionKind::CreateTask {
            return;
        }
        let title = decision
            .parameters
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if title.is_empty() {
            return;
        }
        let reference = data
            .get("task_id")
            .or_else(|| data.get("id"))
            .or_else(|| data.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or(decision.decision_id.as_str());
        self.duplicates.record(title, reference).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplicates::InMemoryTitleStore;
    use crate::payload::{BuilderConfig, PlatformPayload};
    use crate::preprocess::preprocess;
    use crate::signal::{Signal, SignalSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Executor that fails a scripted number of times, then succeeds.
    struct FlakyExecutor {
        platform: TargetPlatform,
        failures: AtomicU32,
        kind: ExecErrorKind,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(platform: TargetPlatform, failures: u32, kind: ExecErrorKind) -> Arc<Self> {
            Arc::new(Self {
                platform,
                failures: AtomicU32::new(failures),
                kind,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        async fn execute(
            &self,
            decision: &Decision,
            _payload: &PlatformPayload,
        ) -> std::result::Result<serde_json::Value, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecError::new(self.kind, "scripted failure"));
            }
            Ok(serde_json::json!({"task_id": format!("T-{}", decision.decision_id)}))
        }

        fn platform(&self) -> TargetPlatform {
            self.platform
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(4),
            rate_limits: HashMap::new(),
            default_rate_limit: Duration::ZERO,
            ..DispatcherConfig::default()
        }
    }

    fn dispatcher_with(config: DispatcherConfig) -> (ActionDispatcher, Arc<DuplicateIndex>) {
        let duplicates = Arc::new(DuplicateIndex::new(Arc::new(InMemoryTitleStore::new())));
        let builder = ParameterBuilder::new(
            BuilderConfig::default()
                .with_board_id("board-1")
                .with_default_channel("#ops")
                .with_calendar_id("cal-1"),
        );
        (
            ActionDispatcher::new(config, builder, Arc::clone(&duplicates)),
            duplicates,
        )
    }

    fn task_decision(title: &str) -> Decision {
        Decision::new("sig-1", ActionKind::CreateTask, TargetPlatform::TaskTracker)
            .with_priority(2)
            .with_parameters(serde_json::json!({"title": title, "description": "d"}))
    }

    fn prepared() -> PreparedSignal {
        preprocess(Signal::new(SignalSource::Email, "subject", "body", "s@x.com"))
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_title() {
        let (dispatcher, duplicates) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 0, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let result = dispatcher
            .dispatch(&task_decision("Fix login bug"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.executor_used, "flaky");
        assert_eq!(executor.calls(), 1);
        // The created title is now in the duplicate index.
        assert!(duplicates.find_duplicate("Fix login bug").await.is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_succeed() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 2, ExecErrorKind::Server5xx);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let result = dispatcher
            .dispatch(&task_decision("Retry me"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_attempts() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 10, ExecErrorKind::RateLimited);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let result = dispatcher
            .dispatch(&task_decision("Never works"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(executor.calls(), DEFAULT_MAX_EXECUTOR_ATTEMPTS);
        assert!(result.error.unwrap().contains("rate_limited"));
    }

    #[tokio::test]
    async fn test_permanent_error_no_retry() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 10, ExecErrorKind::Auth);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let result = dispatcher
            .dispatch(&task_decision("Denied"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_appearing_post_decision_skips() {
        let (dispatcher, duplicates) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 0, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        // The duplicate landed after the decision was made.
        duplicates.record("Fix the login bug", "TASK-77").await;

        let result = dispatcher
            .dispatch(&task_decision("Fix login bug"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.is_skipped());
        assert_eq!(
            result.data.unwrap()["existing_reference"],
            "TASK-77"
        );
        // No external side effect.
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_requires_approval_never_executes() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 0, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let decision = task_decision("Needs sign-off").with_approval_required(true);
        let result = dispatcher
            .dispatch(&decision, &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_executor_fails_permanently() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let result = dispatcher
            .dispatch(&task_decision("No executor"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no executor"));
    }

    #[tokio::test]
    async fn test_validation_failure_reports_missing_fields() {
        let duplicates = Arc::new(DuplicateIndex::new(Arc::new(InMemoryTitleStore::new())));
        // Builder with no board id.
        let dispatcher = ActionDispatcher::new(
            fast_config(),
            ParameterBuilder::new(BuilderConfig::default()),
            duplicates,
        );
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 0, ExecErrorKind::Network);
        dispatcher.register(executor as Arc<dyn Executor>);

        let result = dispatcher
            .dispatch(&task_decision("x"), &prepared(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        let data = result.data.unwrap();
        assert_eq!(data["missing_fields"][0], "board_id");
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let mut config = fast_config();
        config.retry_base = Duration::from_millis(100);
        config.retry_cap = Duration::from_millis(200);
        let (dispatcher, _) = dispatcher_with(config);
        let executor = FlakyExecutor::new(TargetPlatform::TaskTracker, 10, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let dispatcher = Arc::new(dispatcher);
        let cancel = CancellationToken::new();
        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&task_decision("Cancelled"), &prepared(), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // First attempt ran; the cancel landed in the backoff.
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_calls() {
        let mut config = fast_config();
        config
            .rate_limits
            .insert(TargetPlatform::Chat, Duration::from_millis(80));
        let (dispatcher, _) = dispatcher_with(config);
        let executor = FlakyExecutor::new(TargetPlatform::Chat, 0, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&executor) as Arc<dyn Executor>);

        let decision = Decision::new("sig-1", ActionKind::SendNotification, TargetPlatform::Chat)
            .with_parameters(serde_json::json!({"header": "h", "body": "b"}));

        let started = Instant::now();
        for _ in 0..3 {
            let result = dispatcher
                .dispatch(&decision, &prepared(), &CancellationToken::new())
                .await
                .unwrap();
            assert!(result.success);
        }
        // Three calls through a 1-per-80ms bucket need ≥ 160ms.
        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let tracker = FlakyExecutor::new(TargetPlatform::TaskTracker, 0, ExecErrorKind::Network);
        dispatcher.register(Arc::clone(&tracker) as Arc<dyn Executor>);
        // No chat executor registered: notifications fail.

        let items = vec![
            (task_decision("Task one"), prepared()),
            (
                Decision::new("sig-2", ActionKind::SendNotification, TargetPlatform::Chat)
                    .with_parameters(serde_json::json!({"header": "h", "body": "b"})),
                prepared(),
            ),
            (task_decision("Task two"), prepared()),
        ];

        let outcome = dispatcher
            .dispatch_batch(&items, &CancellationToken::new())
            .await;

        assert_eq!(outcome.successful.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
    }
}

//! A recording executor with scriptable failures

use async_trait::async_trait;
use opshub::decision::{Decision, TargetPlatform};
use opshub::executor::{ExecError, ExecErrorKind, Executor};
use opshub::payload::PlatformPayload;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The decision that was executed
    pub decision: Decision,
    /// The payload it carried
    pub payload: PlatformPayload,
}

/// A recording [`Executor`]: every invocation is captured, failures can
/// be scripted (fail N times then succeed, or always fail), and a delay
/// can simulate slow platforms for timeout tests.
pub struct MockExecutor {
    platform: TargetPlatform,
    name: String,
    calls: AtomicU32,
    failures_remaining: AtomicU32,
    always_fail: Mutex<Option<ExecErrorKind>>,
    failure_kind: Mutex<ExecErrorKind>,
    delay: Mutex<Duration>,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl MockExecutor {
    /// A succeeding executor for a platform.
    #[must_use]
    pub fn new(platform: TargetPlatform) -> Self {
        Self {
            platform,
            name: format!("mock-{platform}"),
            calls: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
            always_fail: Mutex::new(None),
            failure_kind: Mutex::new(ExecErrorKind::Server5xx),
            delay: Mutex::new(Duration::ZERO),
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` calls with the given kind, then succeed.
    #[must_use]
    pub fn failing_times(self, n: u32, kind: ExecErrorKind) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        *self.failure_kind.lock() = kind;
        self
    }

    /// Fail every call with the given kind.
    #[must_use]
    pub fn always_failing(self, kind: ExecErrorKind) -> Self {
        *self.always_fail.lock() = Some(kind);
        self
    }

    /// Delay every call.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Number of invocations.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Everything this executor was asked to do.
    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(
        &self,
        decision: &Decision,
        payload: &PlatformPayload,
    ) -> std::result::Result<serde_json::Value, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.recorded.lock().push(RecordedCall {
            decision: decision.clone(),
            payload: payload.clone(),
        });

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = *self.always_fail.lock() {
            return Err(ExecError::new(kind, "scripted permanent failure"));
        }
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            let kind = *self.failure_kind.lock();
            return Err(ExecError::new(kind, "scripted failure"));
        }

        Ok(serde_json::json!({
            "task_id": format!("{}-{}", self.platform, decision.decision_id),
            "platform": self.platform,
        }))
    }

    fn platform(&self) -> TargetPlatform {
        self.platform
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Executor seam
//!
//! One [`Executor`] implementation exists per target platform, outside
//! the core. Executors must be idempotent under retry of identical
//! inputs; the dispatcher handles retries, rate limiting, and the
//! duplicate check for task creation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::decision::{Decision, TargetPlatform};
use crate::payload::PlatformPayload;

/// How an executor call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorKind {
    /// The call exceeded its deadline
    Timeout,
    /// Upstream 5xx
    Server5xx,
    /// Upstream 429
    RateLimited,
    /// Connection-level failure
    Network,
    /// Upstream 4xx other than 429
    Client4xx,
    /// Authentication or authorization failure
    Auth,
    /// Target resource does not exist
    NotFound,
    /// The payload was rejected as invalid
    Validation,
}

impl ExecErrorKind {
    /// Transient errors are retried with backoff; permanent errors
    /// surface immediately.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ExecErrorKind::Timeout
                | ExecErrorKind::Server5xx
                | ExecErrorKind::RateLimited
                | ExecErrorKind::Network
        )
    }
}

impl fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecErrorKind::Timeout => write!(f, "timeout"),
            ExecErrorKind::Server5xx => write!(f, "server_5xx"),
            ExecErrorKind::RateLimited => write!(f, "rate_limited"),
            ExecErrorKind::Network => write!(f, "network"),
            ExecErrorKind::Client4xx => write!(f, "client_4xx"),
            ExecErrorKind::Auth => write!(f, "auth"),
            ExecErrorKind::NotFound => write!(f, "not_found"),
            ExecErrorKind::Validation => write!(f, "validation"),
        }
    }
}

/// An executor failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    /// Failure class
    pub kind: ExecErrorKind,
    /// Upstream detail
    pub message: String,
}

impl ExecError {
    /// Build an error of a kind.
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a transient network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Network, message)
    }

    /// True when the dispatcher should retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ExecError {}

impl From<ExecError> for crate::error::Error {
    fn from(error: ExecError) -> Self {
        crate::error::Error::Executor {
            kind: error.kind,
            message: error.message,
        }
    }
}

/// Outcome of dispatching one decision
///
/// Built by the dispatcher from what the executor actually returned;
/// there is no success-before-return shortcut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the action took effect (or was intentionally skipped)
    pub success: bool,
    /// Executor-reported data; `{"skipped": true, ...}` for duplicates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Terminal error description, when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock spent across all attempts
    pub execution_time: Duration,
    /// Name of the executor that handled the decision
    pub executor_used: String,
}

impl ExecutionResult {
    /// Successful execution with the executor's data.
    pub fn success(
        data: serde_json::Value,
        execution_time: Duration,
        executor_used: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time,
            executor_used: executor_used.into(),
        }
    }

    /// Duplicate-suppressed execution: success with no side effect.
    pub fn skipped_duplicate(
        reference: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            success: true,
            data: Some(serde_json::json!({
                "skipped": true,
                "reason": "duplicate_detected",
                "existing_reference": reference.into(),
            })),
            error: None,
            execution_time,
            executor_used: "duplicate-index".to_string(),
        }
    }

    /// Terminal failure.
    pub fn failure(
        error: impl Into<String>,
        execution_time: Duration,
        executor_used: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time,
            executor_used: executor_used.into(),
        }
    }

    /// True when the result is a duplicate skip.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("skipped"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Performs decisions on one target platform
#[async_trait]
pub trait Executor: Send + Sync {
    /// Perform the decision. The payload is the validated,
    /// platform-exact form built by the parameter builder.
    async fn execute(
        &self,
        decision: &Decision,
        payload: &PlatformPayload,
    ) -> std::result::Result<serde_json::Value, ExecError>;

    /// The platform this executor serves.
    fn platform(&self) -> TargetPlatform;

    /// Name for logs and results.
    fn name(&self) -> &str;
}

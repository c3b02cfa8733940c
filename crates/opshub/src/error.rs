// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the OpsHub core
//!
//! One error enum for the whole pipeline. The dispatcher additionally
//! classifies executor failures as transient or permanent via
//! [`crate::executor::ExecErrorKind`]; everything else maps onto a
//! variant here.

use std::time::Duration;
use thiserror::Error;

/// Core errors for the OpsHub pipeline
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation exceeded its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The oracle call failed at the transport or API level
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// The oracle returned content that could not be parsed into the
    /// expected schema, even after the stricter retry
    #[error("Oracle schema error: {0}")]
    Schema(String),

    /// A payload or decision failed validation
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        /// Required fields that were absent
        missing_fields: Vec<String>,
    },

    /// An executor failed; `kind` carries the transient/permanent split
    #[error("Executor error ({kind}): {message}")]
    Executor {
        kind: crate::executor::ExecErrorKind,
        message: String,
    },

    /// A signal was rejected by the ingress rate limiter
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The signal queue was full and the item was the lowest priority present
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// In-flight work was cancelled; produces no feedback record
    #[error("Cancelled")]
    Cancelled,

    /// An internal channel closed unexpectedly
    #[error("Channel closed: {0}")]
    Channel(String),

    /// A component was asked for something it does not hold
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (feedback log, pattern snapshots)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a validation error without missing-field detail.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            missing_fields: Vec::new(),
        }
    }

    /// Build a validation error listing the absent required fields.
    pub fn missing_fields(message: impl Into<String>, fields: Vec<String>) -> Self {
        Error::Validation {
            message: message.into(),
            missing_fields: fields,
        }
    }

    /// True when the error should be retried by the dispatcher.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Executor { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for the OpsHub core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecErrorKind;

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout(Duration::from_secs(30));
        assert!(format!("{}", err).contains("30s"));
    }

    #[test]
    fn test_error_display_oracle() {
        let err = Error::Oracle("connection reset".to_string());
        assert_eq!(format!("{}", err), "Oracle error: connection reset");
    }

    #[test]
    fn test_error_display_validation() {
        let err = Error::missing_fields(
            "task payload incomplete",
            vec!["title".to_string(), "board_id".to_string()],
        );
        assert!(format!("{}", err).contains("task payload incomplete"));
        match err {
            Error::Validation { missing_fields, .. } => {
                assert_eq!(missing_fields, vec!["title", "board_id"]);
            }
            _ => panic!("expected Validation"),
        }
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(format!("{}", err).starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_transient());
        assert!(Error::Executor {
            kind: ExecErrorKind::Server5xx,
            message: "bad gateway".to_string(),
        }
        .is_transient());
        assert!(!Error::Executor {
            kind: ExecErrorKind::Auth,
            message: "bad token".to_string(),
        }
        .is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::validation("nope").is_transient());
    }
}

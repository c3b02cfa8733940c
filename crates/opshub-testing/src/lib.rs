// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # OpsHub Testing Utilities
//!
//! This crate provides testing utilities for OpsHub applications,
//! including:
//!
//! - **MockOracle**: a scripted oracle for deterministic
//!   classification tests
//! - **MockExecutor**: a recording executor with scriptable failures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use opshub_testing::{MockOracle, MockExecutor};
//! use opshub::TargetPlatform;
//!
//! // An oracle that always returns a critical incident.
//! let oracle = MockOracle::incident();
//!
//! // A task executor that fails twice with 503s, then succeeds.
//! let executor = MockExecutor::new(TargetPlatform::TaskTracker)
//!     .failing_times(2, opshub::ExecErrorKind::Server5xx);
//! ```

mod mock_executor;
mod mock_oracle;

pub use mock_executor::{MockExecutor, RecordedCall};
pub use mock_oracle::{classification_json, MockOracle};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{MockExecutor, MockOracle};
}

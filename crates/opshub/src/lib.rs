// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # OpsHub Core
//!
//! The reasoning and dispatch core of an operations-automation system.
//! Inbound communication signals (email, chat messages, spreadsheet
//! edits) are classified by an LLM oracle, turned into platform
//! actions under a rule cascade, routed through a human approval queue
//! when warranted, and executed by per-platform rate-limited
//! executors. A learning loop mines the feedback corpus into patterns
//! and evolves the classifier's prompt through controlled experiments.
//!
//! ## Subsystems
//!
//! - **Event bus** ([`event_bus`]): priority dispatch, bounded
//!   history, subscriber reconnection.
//! - **Reasoning pipeline** ([`preprocess`], [`classifier`],
//!   [`engine`], [`payload`]): preprocess → classify → decide →
//!   build, with a fingerprint-keyed classification cache and a
//!   review queue ([`review`]) for human-in-the-loop approval.
//! - **Duplicate index** ([`duplicates`]): normalized fuzzy matching
//!   over recent task titles.
//! - **Action dispatcher** ([`dispatcher`], [`executor`]): retry,
//!   token-bucket rate limits, partial-failure batches.
//! - **Learning** ([`feedback`], [`patterns`], [`optimizer`]):
//!   outcome tracking, pattern mining, prompt A/B selection.
//!
//! Everything is owned by one [`Pipeline`] context root; there are no
//! ambient singletons.
//!
//! ## Example
//!
//! ```rust,ignore
//! use opshub::{CoreConfig, Pipeline, Signal, SignalSource};
//! use opshub::payload::BuilderConfig;
//! use std::sync::Arc;
//!
//! let pipeline = Pipeline::new(
//!     Arc::new(my_oracle),
//!     CoreConfig::from_env(),
//!     BuilderConfig::default()
//!         .with_board_id("board-1")
//!         .with_default_channel("#ops"),
//! );
//! pipeline.register_executor(Arc::new(my_task_executor));
//! pipeline.start();
//!
//! pipeline.ingest(Signal::new(
//!     SignalSource::Email,
//!     "URGENT: Production database is down",
//!     "All reads are failing.",
//!     "alerts@example.com",
//! ));
//! ```

pub mod classification;
pub mod classifier;
pub mod config;
pub mod constants;
pub mod decision;
pub mod dispatcher;
pub mod duplicates;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod feedback;
pub mod ingest;
pub mod markdown;
pub mod metrics;
pub mod optimizer;
pub mod oracle;
pub mod patterns;
pub mod payload;
pub mod pipeline;
pub mod preprocess;
pub mod review;
pub mod signal;
pub mod snapshot;

pub use classification::{Category, Classification, Importance, Urgency};
pub use classifier::{CacheStats, Classifier, ClassifyOutcome};
pub use config::CoreConfig;
pub use decision::{ActionKind, Decision, TargetPlatform, TaskDetails, ValidationReport};
pub use dispatcher::{ActionDispatcher, BatchOutcome, DispatcherConfig};
pub use duplicates::{DuplicateIndex, DuplicateMatch, InMemoryTitleStore, TitleStore};
pub use engine::{DecisionEngine, EngineConfig};
pub use error::{Error, Result};
pub use event_bus::{BusPublisher, BusStats, EventBus, EventPriority, HubEvent, Subscriber};
pub use executor::{ExecError, ExecErrorKind, ExecutionResult, Executor};
pub use feedback::{FeedbackOutcome, FeedbackRecord, FeedbackStats, FeedbackTracker};
pub use ingest::{EnqueueOutcome, QueueStats, SignalQueue};
pub use optimizer::{AbSelector, PromptOptimizer, PromptTemplate, TemplateRegistry};
pub use oracle::{Oracle, OracleMessage, OracleOptions, OracleResponse, OracleUsage, TokenEstimator};
pub use patterns::{PatternStore, PatternThresholds, Patterns};
pub use payload::{BuilderConfig, ParameterBuilder, PlatformPayload};
pub use pipeline::{Disposition, Pipeline, ProcessOutcome};
pub use preprocess::{preprocess, PreparedSignal};
pub use review::{ReviewItem, ReviewOutcome, ReviewQueue, ReviewStatus, TimeoutPolicy};
pub use signal::{Attachment, Signal, SignalPriority, SignalSource, SourceEvent};
pub use snapshot::{DashboardData, MetricsAggregator};

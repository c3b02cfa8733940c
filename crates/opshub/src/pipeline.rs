// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The pipeline: OpsHub's context root
//!
//! One [`Pipeline`] value owns every shared component (bus, queue,
//! classifier, engine, duplicate index, dispatcher, review queue,
//! tracker, pattern store, template registry, aggregator) and threads
//! them through the stages. There are no ambient singletons.
//!
//! Per signal the stage order is strict:
//! `preprocess → classify → decide → build → (approve? → execute)`.
//! Across signals no total order is promised. Cancellation is honored
//! at stage boundaries, during the oracle call, and between dispatch
//! retry attempts; cancelled work records no feedback. Every other
//! terminal outcome (executed, rejected, modified, failed) reaches
//! the feedback tracker.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::classification::Classification;
use crate::classifier::{Classifier, ClassifyOutcome};
use crate::config::CoreConfig;
use crate::decision::{ActionKind, Decision};
use crate::dispatcher::{ActionDispatcher, DispatcherConfig};
use crate::duplicates::{DuplicateIndex, InMemoryTitleStore, TitleStore};
use crate::engine::{DecisionEngine, EngineConfig};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, EventPriority, HubEvent};
use crate::executor::{ExecutionResult, Executor};
use crate::feedback::{FeedbackOutcome, FeedbackRecord, FeedbackTracker};
use crate::ingest::{EnqueueOutcome, SignalQueue};
use crate::metrics;
use crate::optimizer::{AbSelector, PromptOptimizer, PromptTemplate, TemplateRegistry};
use crate::patterns::PatternStore;
use crate::payload::{BuilderConfig, ParameterBuilder};
use crate::preprocess::{preprocess, PreparedSignal};
use crate::review::{ReviewConfig, ReviewItem, ReviewOutcome, ReviewQueue, TimeoutPolicy};
use crate::signal::{Signal, SignalPriority, SourceEvent};
use crate::snapshot::{DashboardData, MetricsAggregator, PipelineStage, StageTracker};

/// Bus event types the pipeline emits.
pub mod events {
    /// A signal was accepted at ingress.
    pub const SIGNAL_RECEIVED: &str = "signal.received";
    /// A signal was classified.
    pub const SIGNAL_CLASSIFIED: &str = "signal.classified";
    /// A decision was made.
    pub const DECISION_MADE: &str = "decision.made";
    /// A decision entered the review queue.
    pub const REVIEW_QUEUED: &str = "review.queued";
    /// A terminal outcome was recorded.
    pub const SIGNAL_COMPLETED: &str = "signal.completed";
}

/// Where one signal ended up
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Dispatched; the result reflects the executor's actual outcome
    Executed(ExecutionResult),
    /// Deliberately not acted on (spam, duplicate, auto-reply)
    Ignored {
        /// The fired rule's reasoning
        reason: String,
    },
    /// Waiting for a human in the review queue
    QueuedForReview {
        /// Review item id
        review_id: String,
    },
}

/// Everything the pipeline produced for one signal
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Signal id
    pub signal_id: String,
    /// Cache fingerprint
    pub fingerprint: String,
    /// The classification
    pub classification: Classification,
    /// The decision
    pub decision: Decision,
    /// Terminal or parked disposition
    pub disposition: Disposition,
}

struct PendingReview {
    prepared: PreparedSignal,
    classify: ClassifyOutcome,
    started: Instant,
    modifications: Option<serde_json::Value>,
}

/// The reasoning and dispatch core, assembled
pub struct Pipeline {
    config: CoreConfig,
    bus: Arc<EventBus>,
    queue: Arc<SignalQueue>,
    classifier: Arc<Classifier>,
    engine: DecisionEngine,
    duplicates: Arc<DuplicateIndex>,
    dispatcher: Arc<ActionDispatcher>,
    review: Arc<ReviewQueue>,
    released_rx: Mutex<Option<mpsc::Receiver<ReviewItem>>>,
    tracker: Arc<FeedbackTracker>,
    patterns: Arc<PatternStore>,
    selector: Arc<AbSelector>,
    registry: Arc<TemplateRegistry>,
    optimizer: PromptOptimizer,
    aggregator: Arc<MetricsAggregator>,
    stages: Arc<StageTracker>,
    pending: Mutex<HashMap<String, PendingReview>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Pipeline {
    /// Assemble a pipeline around an oracle with default stores.
    pub fn new(
        oracle: Arc<dyn crate::oracle::Oracle>,
        config: CoreConfig,
        builder_config: BuilderConfig,
    ) -> Arc<Self> {
        Self::with_title_store(
            oracle,
            config,
            builder_config,
            Arc::new(InMemoryTitleStore::new()),
        )
    }

    /// Assemble a pipeline with an explicit duplicate-title store.
    pub fn with_title_store(
        oracle: Arc<dyn crate::oracle::Oracle>,
        config: CoreConfig,
        builder_config: BuilderConfig,
        title_store: Arc<dyn TitleStore>,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let queue = Arc::new(SignalQueue::with_limits(
            config.queue_capacity,
            config.rate_limit_n,
            config.rate_limit_window,
        ));
        let patterns = Arc::new(PatternStore::with_thresholds(
            config.pattern_thresholds.clone(),
        ));
        let registry = Arc::new(TemplateRegistry::new(
            PromptTemplate::classification_default()
                .with_max_examples(config.prompt_max_examples),
        ));
        let selector = Arc::new(AbSelector::with_tunables(
            Arc::clone(&registry),
            config.ab_evaluations,
            config.ab_degradation_rollback,
        ));
        let classifier = Arc::new(
            Classifier::with_cache(
                oracle,
                Arc::clone(&selector),
                Arc::clone(&patterns),
                config.cache_max_size,
                config.cache_ttl,
            )
            .with_oracle_timeout(config.oracle_timeout),
        );
        let duplicates = Arc::new(DuplicateIndex::with_threshold(
            title_store,
            config.duplicate_threshold,
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            DispatcherConfig {
                max_attempts: config.max_executor_attempts,
                exec_timeout: config.exec_timeout,
                rate_limits: config.executor_rate_limits.clone(),
                default_rate_limit: config.executor_rate_limit,
                ..DispatcherConfig::default()
            },
            ParameterBuilder::new(builder_config),
            Arc::clone(&duplicates),
        ));
        let (review, released_rx) = ReviewQueue::new(ReviewConfig {
            default_ttl: config.review_ttl,
            tick: config.review_tick,
            timeout_policy: config.review_timeout_policy,
        });
        let tracker = Arc::new(FeedbackTracker::new());
        let stages = Arc::new(StageTracker::new());
        let aggregator = Arc::new(MetricsAggregator::new(
            Arc::clone(&queue),
            Arc::clone(&review),
            Arc::clone(&tracker),
            Arc::clone(&classifier),
            Arc::clone(&stages),
        ));
        let engine = DecisionEngine::with_config(EngineConfig {
            duplicate_threshold: config.duplicate_threshold,
            confidence_threshold: config.confidence_approval_threshold,
        });

        Arc::new(Self {
            config,
            bus,
            queue,
            classifier,
            engine,
            duplicates,
            dispatcher,
            review,
            released_rx: Mutex::new(Some(released_rx)),
            tracker,
            patterns,
            selector,
            registry,
            optimizer: PromptOptimizer::new(),
            aggregator,
            stages,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Register a platform executor.
    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        self.dispatcher.register(executor);
    }

    /// Spawn the background workers: bus drainer, queue drainer,
    /// approved-decision consumer, review timeout scanner. Idempotent
    /// per worker kind is not needed; call once.
    pub fn start(self: &Arc<Self>) {
        self.bus.start();
        let mut workers = self.workers.lock();

        // Queue drainer: pulls accepted signals through the stages.
        {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                loop {
                    let signal = tokio::select! {
                        () = pipeline.shutdown.cancelled() => break,
                        signal = pipeline.queue.dequeue() => signal,
                    };
                    let Some(signal) = signal else { break };
                    let cancel = pipeline.shutdown.child_token();
                    if let Err(error) = pipeline.process(signal, &cancel).await {
                        if !matches!(error, Error::Cancelled) {
                            tracing::error!(error = %error, "Signal processing failed");
                        }
                    }
                }
            }));
        }

        // Approved-decision consumer: dispatches what review released.
        if let Some(mut released_rx) = self.released_rx.lock().take() {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        () = pipeline.shutdown.cancelled() => break,
                        item = released_rx.recv() => item,
                    };
                    let Some(item) = item else { break };
                    pipeline.dispatch_released(item).await;
                }
            }));
        }

        // Review timeout scanner; expired items under the reject
        // policy become rejected feedback here.
        {
            let pipeline = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(pipeline.config.review_tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = pipeline.shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    pipeline.expire_reviews().await;
                }
            }));
        }
    }

    /// Stop workers and drain. Safe to call once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.close();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        self.review.shutdown().await;
        self.bus.shutdown().await;
    }

    /// Accept a raw source event: convert, emit, enqueue.
    pub fn ingest_source_event(&self, event: SourceEvent) -> EnqueueOutcome {
        self.ingest(event.into_signal())
    }

    /// Accept a signal at ingress.
    pub fn ingest(&self, signal: Signal) -> EnqueueOutcome {
        let priority = bus_priority(signal.priority);
        let event_payload = serde_json::json!({
            "signal_id": signal.id,
            "source": signal.source,
            "sender": signal.sender,
        });
        let outcome = self.queue.enqueue(signal);
        if outcome.is_accepted() {
            self.emit(events::SIGNAL_RECEIVED, event_payload, priority);
        }
        outcome
    }

    /// Drive one signal through the stages.
    ///
    /// Returns `Err(Cancelled)` only for cancellation; every other path
    /// produces a [`ProcessOutcome`] and (unless parked in review) a
    /// feedback record.
    pub async fn process(
        &self,
        signal: Signal,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let started = Instant::now();

        // Preprocess: pure, aborts immediately on cancellation.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.stages.enter(PipelineStage::Preprocess);
        let prepared = preprocess(signal);
        self.stages.exit(PipelineStage::Preprocess);

        // Classify.
        self.stages.enter(PipelineStage::Classify);
        let classify = self
            .classifier
            .classify(&prepared, cancel)
            .await
            .inspect_err(|_| self.stages.exit(PipelineStage::Classify));
        let classify = match classify {
            Ok(outcome) => outcome,
            Err(error) => return Err(error),
        };
        self.stages.exit(PipelineStage::Classify);
        self.emit(
            events::SIGNAL_CLASSIFIED,
            serde_json::json!({
                "signal_id": prepared.signal.id,
                "fingerprint": prepared.fingerprint,
                "category": classify.classification.category,
                "urgency": classify.classification.urgency,
                "from_cache": classify.from_cache,
            }),
            bus_priority(prepared.signal.priority),
        );

        // Decide: engine is pure over the snapshots we hand it.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.stages.enter(PipelineStage::Decide);
        let duplicate = self
            .duplicates
            .best_match(&DecisionEngine::intended_title(&prepared))
            .await;
        let patterns_snapshot = self.patterns.snapshot();
        let decision = self.engine.decide(
            &prepared,
            &classify.classification,
            &patterns_snapshot,
            duplicate.as_ref(),
        );
        self.stages.exit(PipelineStage::Decide);

        metrics::DECISIONS
            .with_label_values(&[&decision.action.to_string()])
            .inc();
        self.aggregator.record_decision(&decision);
        self.emit(
            events::DECISION_MADE,
            serde_json::json!({
                "signal_id": prepared.signal.id,
                "decision_id": decision.decision_id,
                "action": decision.action,
                "platform": decision.target_platform,
                "requires_approval": decision.requires_approval,
            }),
            bus_priority(prepared.signal.priority),
        );

        // Ignores are terminal successes with zero executed actions.
        if decision.action == ActionKind::Ignore {
            let reason = decision.reasoning.clone();
            self.record_terminal(
                &prepared,
                &classify,
                &decision,
                FeedbackOutcome::Success,
                None,
                started,
            )
            .await;
            return Ok(ProcessOutcome {
                signal_id: prepared.signal.id.clone(),
                fingerprint: prepared.fingerprint.clone(),
                classification: classify.classification,
                decision,
                disposition: Disposition::Ignored { reason },
            });
        }

        // Approval gate: park the decision and wait for a human.
        if decision.requires_approval {
            let item = self.review.enqueue(
                decision.clone(),
                decision
                    .validation
                    .rules_applied
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "requires_approval".to_string()),
                classify.classification.urgency,
                None,
            );
            self.stages.enter(PipelineStage::Review);
            self.pending.lock().insert(
                item.review_id.clone(),
                PendingReview {
                    prepared: prepared.clone(),
                    classify: classify.clone(),
                    started,
                    modifications: None,
                },
            );
            self.emit(
                events::REVIEW_QUEUED,
                serde_json::json!({
                    "review_id": item.review_id,
                    "signal_id": prepared.signal.id,
                    "decision_id": decision.decision_id,
                }),
                EventPriority::Normal,
            );
            return Ok(ProcessOutcome {
                signal_id: prepared.signal.id.clone(),
                fingerprint: prepared.fingerprint.clone(),
                classification: classify.classification,
                decision,
                disposition: Disposition::QueuedForReview {
                    review_id: item.review_id,
                },
            });
        }

        // Build + execute.
        let result = self.execute(&decision, &prepared, cancel).await?;
        let outcome = if result.success {
            FeedbackOutcome::Success
        } else {
            FeedbackOutcome::Failure
        };
        if !result.success {
            self.aggregator.record_error(&error_kind_label(&result));
        }
        self.record_terminal(&prepared, &classify, &decision, outcome, None, started)
            .await;

        Ok(ProcessOutcome {
            signal_id: prepared.signal.id.clone(),
            fingerprint: prepared.fingerprint.clone(),
            classification: classify.classification,
            decision,
            disposition: Disposition::Executed(result),
        })
    }

    /// Approve a review item, optionally noting a human modification
    /// delta recorded with the eventual outcome.
    pub async fn approve_review(
        &self,
        review_id: &str,
        note: Option<String>,
        modifications: Option<serde_json::Value>,
    ) -> Result<ReviewItem> {
        if let Some(pending) = self.pending.lock().get_mut(review_id) {
            pending.modifications = modifications;
        }
        self.review
            .resolve(review_id, ReviewOutcome::Approve, note)
            .await
    }

    /// Reject a review item; records a rejected feedback outcome.
    pub async fn reject_review(&self, review_id: &str, note: Option<String>) -> Result<ReviewItem> {
        let item = self
            .review
            .resolve(review_id, ReviewOutcome::Reject, note)
            .await?;
        self.finish_review(review_id, &item, FeedbackOutcome::Rejected)
            .await;
        Ok(item)
    }

    /// Rederive patterns from the full feedback corpus and refresh the
    /// dashboard insights.
    pub fn refresh_patterns(&self) -> usize {
        let records = self.tracker.records();
        let patterns = self.patterns.rederive(&records);
        let mut insights = Vec::new();
        for sender in patterns.sender_patterns.values() {
            insights.push(format!(
                "sender {} maps to {} ({} records, {:.0}% success)",
                sender.sender,
                sender.dominant_category,
                sender.records,
                sender.success_rate * 100.0
            ));
        }
        for keyword in patterns.urgency_keywords.values() {
            insights.push(format!(
                "keyword '{}' raises urgency (+{:.2} over baseline)",
                keyword.keyword, keyword.urgency_boost
            ));
        }
        insights.sort();
        let count = insights.len();
        self.aggregator.set_insights(insights);
        count
    }

    /// Derive a candidate template from feedback and start an A/B
    /// experiment against the incumbent. Returns the candidate version
    /// when one was worth testing.
    pub fn optimize_prompt(&self) -> Option<u32> {
        let active = self.registry.active();
        let records = self.tracker.records();
        let candidate = self.optimizer.derive_candidate(&active, &records)?;
        Some(self.selector.start_experiment(candidate))
    }

    /// Read-only dashboard snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DashboardData {
        self.aggregator.snapshot()
    }

    /// The event bus (for subscribing and diagnostics).
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The review queue (for UI listings).
    #[must_use]
    pub fn review_queue(&self) -> &Arc<ReviewQueue> {
        &self.review
    }

    /// The feedback tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<FeedbackTracker> {
        &self.tracker
    }

    /// The pattern store.
    #[must_use]
    pub fn pattern_store(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    /// The template registry.
    #[must_use]
    pub fn template_registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// The signal queue.
    #[must_use]
    pub fn signal_queue(&self) -> &Arc<SignalQueue> {
        &self.queue
    }

    /// The duplicate index.
    #[must_use]
    pub fn duplicate_index(&self) -> &Arc<DuplicateIndex> {
        &self.duplicates
    }

    async fn execute(
        &self,
        decision: &Decision,
        prepared: &PreparedSignal,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.stages.enter(PipelineStage::Dispatch);
        let result = self.dispatcher.dispatch(decision, prepared, cancel).await;
        self.stages.exit(PipelineStage::Dispatch);
        result
    }

    /// Dispatch a decision the review queue released (approve or
    /// auto-approve on timeout).
    async fn dispatch_released(&self, item: ReviewItem) {
        let Some(pending) = self.pending.lock().remove(&item.review_id) else {
            tracing::warn!(
                review_id = %item.review_id,
                "Released review item has no pending context; dropping"
            );
            self.stages.exit(PipelineStage::Review);
            return;
        };
        self.stages.exit(PipelineStage::Review);

        let cancel = self.shutdown.child_token();
        let result = match self
            .execute(&item.decision, &pending.prepared, &cancel)
            .await
        {
            Ok(result) => result,
            Err(Error::Cancelled) => return,
            Err(error) => {
                tracing::error!(error = %error, "Released decision dispatch failed");
                return;
            }
        };

        let outcome = match (result.success, pending.modifications.is_some()) {
            (true, true) => FeedbackOutcome::Modified,
            (true, false) => FeedbackOutcome::Success,
            (false, _) => FeedbackOutcome::Failure,
        };
        if !result.success {
            self.aggregator.record_error(&error_kind_label(&result));
        }

        let record = FeedbackRecord::new(
            &pending.prepared,
            &pending.classify.classification,
            &item.decision,
            outcome,
            pending.started.elapsed().as_millis() as u64,
        );
        let record = match pending.modifications {
            Some(delta) => record.with_modifications(delta),
            None => record,
        };
        self.commit_feedback(record, &pending.classify, &item.decision)
            .await;
    }

    /// Expire due review items; reject-policy expiries become rejected
    /// feedback here (auto-approvals flow through the released channel).
    async fn expire_reviews(&self) {
        let before: Vec<ReviewItem> = self.review.pending();
        let expired = self.review.expire_due_items(chrono::Utc::now()).await;
        if expired == 0 {
            return;
        }
        if self.config.review_timeout_policy == TimeoutPolicy::Reject {
            for item in before {
                if let Some(current) = self.review.get(&item.review_id) {
                    if current.status == crate::review::ReviewStatus::TimedOut {
                        self.finish_review(&item.review_id, &current, FeedbackOutcome::Rejected)
                            .await;
                    }
                }
            }
        }
    }

    /// Record the terminal outcome for a review item that will not be
    /// dispatched (rejected or reject-policy timeout).
    async fn finish_review(&self, review_id: &str, item: &ReviewItem, outcome: FeedbackOutcome) {
        let Some(pending) = self.pending.lock().remove(review_id) else {
            return;
        };
        self.stages.exit(PipelineStage::Review);
        self.record_terminal(
            &pending.prepared,
            &pending.classify,
            &item.decision,
            outcome,
            item.note.clone(),
            pending.started,
        )
        .await;
    }

    async fn record_terminal(
        &self,
        prepared: &PreparedSignal,
        classify: &ClassifyOutcome,
        decision: &Decision,
        outcome: FeedbackOutcome,
        note: Option<String>,
        started: Instant,
    ) {
        let record = FeedbackRecord::new(
            prepared,
            &classify.classification,
            decision,
            outcome,
            started.elapsed().as_millis() as u64,
        );
        let record = match note {
            Some(note) => record.with_note(note),
            None => record,
        };
        self.commit_feedback(record, classify, decision).await;
    }

    async fn commit_feedback(
        &self,
        record: FeedbackRecord,
        classify: &ClassifyOutcome,
        decision: &Decision,
    ) {
        let outcome_label = record.outcome.to_string();
        let success = record.is_success();
        let processing_ms = record.processing_ms;

        if let Err(error) = self.tracker.record(record).await {
            tracing::warn!(error = %error, "Failed to append feedback record");
        }
        if classify.template_version > 0 {
            self.selector.record_outcome(
                classify.template_version,
                success,
                classify.classification.confidence,
                processing_ms,
            );
        }
        self.aggregator
            .record_outcome(&decision.decision_id, &outcome_label);
        self.emit(
            events::SIGNAL_COMPLETED,
            serde_json::json!({
                "signal_id": decision.signal_id,
                "decision_id": decision.decision_id,
                "outcome": outcome_label,
            }),
            EventPriority::Low,
        );
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value, priority: EventPriority) {
        let event = HubEvent::new(event_type, payload).with_priority(priority);
        if let Err(error) = self.bus.emit(event) {
            tracing::debug!(error = %error, event_type, "Bus emit skipped");
        }
    }
}

fn bus_priority(priority: SignalPriority) -> EventPriority {
    match priority {
        SignalPriority::High => EventPriority::High,
        SignalPriority::Normal => EventPriority::Normal,
        SignalPriority::Low => EventPriority::Low,
    }
}

/// Dashboard error-kind label for a failed execution result.
fn error_kind_label(result: &ExecutionResult) -> String {
    if let Some(data) = &result.data {
        if data.get("missing_fields").is_some() {
            return "validation".to_string();
        }
    }
    match &result.error {
        Some(error) if error.contains("timeout") => "timeout".to_string(),
        Some(error) if error.contains("rate_limited") => "rate_limit".to_string(),
        Some(_) => "executor".to_string(),
        None => "unknown".to_string(),
    }
}

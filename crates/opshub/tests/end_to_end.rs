// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end flows through the assembled pipeline.

use opshub::duplicates::InMemoryTitleStore;
use opshub::payload::BuilderConfig;
use pretty_assertions::assert_eq;
use opshub::{
    ActionKind, Category, CoreConfig, Disposition, DuplicateIndex, Pipeline, Signal,
    SignalSource, TargetPlatform, Urgency,
};
use opshub_testing::{MockExecutor, MockOracle};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn builder_config() -> BuilderConfig {
    BuilderConfig::default()
        .with_board_id("board-1")
        .with_default_channel("#ops")
        .with_document_root("Shared/")
        .with_calendar_id("cal-1")
}

struct Executors {
    tracker: Arc<MockExecutor>,
    chat: Arc<MockExecutor>,
    filesystem: Arc<MockExecutor>,
}

fn pipeline_with(oracle: Arc<MockOracle>) -> (Arc<Pipeline>, Executors) {
    let pipeline = Pipeline::new(oracle, CoreConfig::default(), builder_config());
    let executors = Executors {
        tracker: Arc::new(MockExecutor::new(TargetPlatform::TaskTracker)),
        chat: Arc::new(MockExecutor::new(TargetPlatform::Chat)),
        filesystem: Arc::new(MockExecutor::new(TargetPlatform::Filesystem)),
    };
    pipeline.register_executor(Arc::clone(&executors.tracker) as Arc<dyn opshub::Executor>);
    pipeline.register_executor(Arc::clone(&executors.chat) as Arc<dyn opshub::Executor>);
    pipeline.register_executor(Arc::clone(&executors.filesystem) as Arc<dyn opshub::Executor>);
    (pipeline, executors)
}

/// Scenario 1: a production outage email becomes a P1 task with no
/// approval detour, and the task executor runs.
#[tokio::test]
async fn test_critical_incident_creates_p1_task() {
    let (pipeline, executors) = pipeline_with(MockOracle::incident());

    let signal = Signal::new(
        SignalSource::Email,
        "URGENT: Production database is down",
        "All reads are failing across the primary region.",
        "alerts@x.com",
    );
    let outcome = pipeline
        .process(signal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.classification.urgency, Urgency::Critical);
    assert_eq!(outcome.classification.category, Category::Incident);
    assert!(outcome.classification.confidence >= 0.90);
    assert_eq!(outcome.decision.action, ActionKind::CreateTask);
    assert_eq!(outcome.decision.target_platform, TargetPlatform::TaskTracker);
    assert_eq!(outcome.decision.priority, 1);
    assert!(!outcome.decision.requires_approval);

    match outcome.disposition {
        Disposition::Executed(result) => assert!(result.success),
        other => panic!("expected execution, got {other:?}"),
    }
    assert_eq!(executors.tracker.calls(), 1);
    assert_eq!(executors.chat.calls(), 0);
}

/// Scenario 2: an invoice with an attachment is filed under Invoices/
/// and waits for approval.
#[tokio::test]
async fn test_invoice_attachment_enters_review() {
    let oracle = MockOracle::request(0.85);
    let (pipeline, executors) = pipeline_with(oracle);

    let signal = Signal::new(
        SignalSource::Email,
        "Invoice #12345",
        "Please find attached the invoice for March services.",
        "billing@vendor.com",
    )
    .with_attachment(
        opshub::Attachment::new("invoice-12345.pdf").with_file_id("file-9"),
    );

    let outcome = pipeline
        .process(signal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.decision.action, ActionKind::UpdateDocument);
    assert_eq!(outcome.decision.target_platform, TargetPlatform::Filesystem);
    assert!(outcome.decision.requires_approval);
    assert_eq!(outcome.decision.parameters["folder"], "Invoices/");
    assert!(matches!(
        outcome.disposition,
        Disposition::QueuedForReview { .. }
    ));

    // Nothing executed while the item waits.
    assert_eq!(executors.filesystem.calls(), 0);
    assert_eq!(pipeline.review_queue().pending_count(), 1);
}

/// Scenario 3: spam is ignored with no executor call.
#[tokio::test]
async fn test_spam_is_ignored() {
    let (pipeline, executors) = pipeline_with(MockOracle::spam());

    let signal = Signal::new(
        SignalSource::Email,
        "LIMITED TIME OFFER!",
        "Click here now. Reply unsubscribe to stop.",
        "promo@blast.example",
    );
    let outcome = pipeline
        .process(signal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.classification.category, Category::Spam);
    assert!(outcome.classification.confidence >= 0.90);
    assert_eq!(outcome.decision.action, ActionKind::Ignore);
    assert!(matches!(outcome.disposition, Disposition::Ignored { .. }));
    assert_eq!(executors.tracker.calls(), 0);
    assert_eq!(executors.chat.calls(), 0);
    // The ignore is still a terminal outcome for the tracker.
    assert_eq!(pipeline.tracker().len(), 1);
}

/// Scenario 4: two signals with one fingerprint share one oracle call
/// and produce identical classifications.
#[tokio::test]
async fn test_identical_fingerprints_share_oracle_call() {
    let oracle = MockOracle::incident();
    let (pipeline, _executors) = pipeline_with(Arc::clone(&oracle));

    let make = || {
        Signal::new(
            SignalSource::Email,
            "URGENT: Production database is down",
            "All reads are failing.",
            "alerts@x.com",
        )
    };

    let first = pipeline
        .process(make(), &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = pipeline
        .process(make(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(oracle.calls(), 1);
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(first.classification, second.classification);
}

/// Scenario 5, engine path: a near-duplicate title is suppressed
/// before dispatch and nothing reaches the executor.
#[tokio::test]
async fn test_duplicate_title_suppressed() {
    let (pipeline, executors) = pipeline_with(MockOracle::request(0.85));

    pipeline
        .duplicate_index()
        .record("Fix the login bug", "TASK-100")
        .await;

    let signal = Signal::new(
        SignalSource::Email,
        "Fix login bug",
        "Users report login failures after the deploy.",
        "qa@x.com",
    );
    let outcome = pipeline
        .process(signal, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.decision.action, ActionKind::Ignore);
    assert_eq!(
        outcome.decision.validation.rules_applied,
        vec!["duplicate_suppression"]
    );
    assert_eq!(outcome.decision.parameters["existing_reference"], "TASK-100");
    assert!(outcome.decision.parameters["similarity"].as_f64().unwrap() >= 0.85);
    assert_eq!(executors.tracker.calls(), 0);
}

/// Scenario 5, dispatcher path: a duplicate that appears after the
/// decision still produces a skipped success with the existing
/// reference.
#[tokio::test]
async fn test_post_decision_duplicate_skips_at_dispatch() {
    use opshub::dispatcher::{ActionDispatcher, DispatcherConfig};
    use opshub::payload::ParameterBuilder;
    use opshub::Decision;

    let duplicates = Arc::new(DuplicateIndex::new(Arc::new(InMemoryTitleStore::new())));
    let dispatcher = ActionDispatcher::new(
        DispatcherConfig::default(),
        ParameterBuilder::new(builder_config()),
        Arc::clone(&duplicates),
    );
    let executor = Arc::new(MockExecutor::new(TargetPlatform::TaskTracker));
    dispatcher.register(Arc::clone(&executor) as Arc<dyn opshub::Executor>);

    let decision = Decision::new("sig-1", ActionKind::CreateTask, TargetPlatform::TaskTracker)
        .with_parameters(serde_json::json!({"title": "Fix login bug", "description": "d"}));

    // The duplicate lands after the decision was made.
    duplicates.record("Fix the login bug", "TASK-100").await;

    let prepared = opshub::preprocess(Signal::new(
        SignalSource::Email,
        "Fix login bug",
        "body",
        "qa@x.com",
    ));
    let result = dispatcher
        .dispatch(&decision, &prepared, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.is_skipped());
    let data = result.data.unwrap();
    assert_eq!(data["reason"], "duplicate_detected");
    assert_eq!(data["existing_reference"], "TASK-100");
    assert_eq!(executor.calls(), 0);
}

/// Scenario 6: fifteen successful incident outcomes from one sender
/// teach a pattern that lifts that sender's next signal.
#[tokio::test]
async fn test_sender_pattern_lifts_classification() {
    let oracle = MockOracle::returning(
        serde_json::json!({
            "urgency": "high",
            "importance": "high",
            "category": "incident",
            "confidence": 0.9,
            "reasoning": "alert stream",
        })
        .to_string(),
    );
    let (pipeline, _executors) = pipeline_with(Arc::clone(&oracle));

    for i in 0..15 {
        let signal = Signal::new(
            SignalSource::Email,
            format!("Server alert {i}"),
            format!("Latency threshold exceeded on shard {i}."),
            "alerts@x.com",
        );
        let outcome = pipeline
            .process(signal, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.classification.category, Category::Incident);
    }

    // Mine the corpus into patterns.
    assert!(pipeline.refresh_patterns() > 0);

    // The next signal from the same sender initially classifies as a
    // routine request at medium urgency.
    oracle.push_response(
        serde_json::json!({
            "urgency": "medium",
            "importance": "medium",
            "category": "request",
            "confidence": 0.70,
            "reasoning": "looks routine",
        })
        .to_string(),
    );
    let signal = Signal::new(
        SignalSource::Email,
        "Please check disk usage",
        "Can someone take a look at the storage graphs?",
        "alerts@x.com",
    );
    let outcome = pipeline
        .process(signal, &CancellationToken::new())
        .await
        .unwrap();

    // The sender pattern overrides the category and lifts urgency one
    // step; confidence rises by at most 0.1.
    assert_eq!(outcome.classification.category, Category::Incident);
    assert_eq!(outcome.classification.urgency, Urgency::High);
    assert!(outcome.classification.confidence > 0.70);
    assert!(outcome.classification.confidence <= 0.80 + 1e-9);
}

/// The assembled pipeline drains its queue through the background
/// workers: ingest → process → feedback, then a clean shutdown.
#[tokio::test]
async fn test_background_workers_drain_queue() {
    let (pipeline, executors) = pipeline_with(MockOracle::incident());
    pipeline.start();

    pipeline.ingest(Signal::new(
        SignalSource::Email,
        "URGENT: Production database is down",
        "All reads are failing.",
        "alerts@x.com",
    ));

    // Wait for the worker to pick the signal up.
    for _ in 0..100 {
        if !pipeline.tracker().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(pipeline.tracker().len(), 1);
    assert_eq!(executors.tracker.calls(), 1);

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.queue_depth, 0);
    assert!(snapshot.rolling_success_rate > 0.99);
    assert_eq!(snapshot.recent_decisions.len(), 1);

    pipeline.shutdown().await;
}

/// Dashboard snapshots reflect cache behavior and error counts.
#[tokio::test]
async fn test_snapshot_reports_cache_hit_rate() {
    let (pipeline, _executors) = pipeline_with(MockOracle::incident());

    let make = || {
        Signal::new(
            SignalSource::Email,
            "URGENT: DB down",
            "details",
            "alerts@x.com",
        )
    };
    pipeline
        .process(make(), &CancellationToken::new())
        .await
        .unwrap();
    pipeline
        .process(make(), &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = pipeline.snapshot();
    assert!(snapshot.cache_hit_rate > 0.0);
    assert!(snapshot.error_counts.is_empty());
    assert_eq!(snapshot.throughput_per_minute, 2);
}

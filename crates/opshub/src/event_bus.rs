// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process event bus with priority dispatch
//!
//! A single broker routes [`HubEvent`]s from sources to subscribers.
//! Emission places the event into one of three priority FIFOs; one
//! worker drains strictly high before normal before low, preserving
//! FIFO order within a class. Subscribers of an event type are invoked
//! sequentially; a subscriber error is logged and does not affect its
//! siblings, and the bus never retries delivery. Retries are a
//! subscriber concern.
//!
//! Subscribers wrapping an external transport can report errors as
//! fatal; the worker then attempts exponential-backoff reconnection up
//! to a bounded number of times and re-delivers the deferred event on
//! success. An accepted event is never dropped because a subscriber
//! failed.
//!
//! The bus is owned as an `Arc` by its owner and handed to publishers
//! as a [`BusPublisher`] holding only a `Weak` reference, so
//! subscriber-owned transports that publish back into the bus cannot
//! form a reference cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::constants::{
    DEFAULT_BUS_HISTORY, DEFAULT_BUS_RECONNECT_ATTEMPTS, DEFAULT_BUS_RECONNECT_BASE,
    DEFAULT_BUS_RECONNECT_CAP,
};
use crate::error::{Error, Result};
use crate::metrics;

/// Priority class of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Drained first
    High,
    /// Default class
    #[default]
    Normal,
    /// Drained last
    Low,
}

impl EventPriority {
    fn queue_index(self) -> usize {
        match self {
            EventPriority::High => 0,
            EventPriority::Normal => 1,
            EventPriority::Low => 2,
        }
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPriority::High => write!(f, "high"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::Low => write!(f, "low"),
        }
    }
}

/// One event routed through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    /// Unique event id
    pub id: String,
    /// Routing key; subscribers register per event type
    pub event_type: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Priority class
    pub priority: EventPriority,
    /// When the event was emitted
    pub emitted_at: DateTime<Utc>,
}

impl HubEvent {
    /// Create a normal-priority event.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            priority: EventPriority::Normal,
            emitted_at: Utc::now(),
        }
    }

    /// Set the priority class.
    #[must_use]
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A subscriber callback registered on the bus
///
/// `handle` is invoked sequentially per event. `is_fatal` lets
/// transport-wrapping subscribers mark errors that warrant a
/// reconnection attempt; plain in-process subscribers keep the default.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Process one event.
    async fn handle(&self, event: &HubEvent) -> Result<()>;

    /// Whether an error from `handle` is a fatal transport error.
    fn is_fatal(&self, _error: &Error) -> bool {
        false
    }

    /// Re-establish the underlying transport after a fatal error.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Name for logs and stats.
    fn name(&self) -> &str {
        "subscriber"
    }
}

struct SubscriberEntry {
    id: u64,
    subscriber: Arc<dyn Subscriber>,
}

/// Counters exposed by [`EventBus::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events accepted by `emit`
    pub emitted: u64,
    /// Successful subscriber deliveries
    pub delivered: u64,
    /// Subscriber callback errors
    pub subscriber_errors: u64,
    /// Reconnection attempts made
    pub reconnect_attempts: u64,
    /// Reconnections that succeeded
    pub reconnects_succeeded: u64,
    /// Current depth of each priority queue (high, normal, low)
    pub queue_depths: [usize; 3],
}

/// Tunables for the bus
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-event-type history ring size
    pub history_size: usize,
    /// Reconnection attempts per fatal subscriber error
    pub reconnect_attempts: u32,
    /// Base backoff delay between reconnection attempts
    pub reconnect_base: Duration,
    /// Backoff cap
    pub reconnect_cap: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_size: DEFAULT_BUS_HISTORY,
            reconnect_attempts: DEFAULT_BUS_RECONNECT_ATTEMPTS,
            reconnect_base: DEFAULT_BUS_RECONNECT_BASE,
            reconnect_cap: DEFAULT_BUS_RECONNECT_CAP,
        }
    }
}

/// The in-process broker
pub struct EventBus {
    config: BusConfig,
    subscribers: RwLock<HashMap<String, Vec<SubscriberEntry>>>,
    queues: Mutex<[VecDeque<HubEvent>; 3]>,
    history: RwLock<HashMap<String, VecDeque<HubEvent>>>,
    wakeup: Notify,
    closed: AtomicBool,
    next_subscriber_id: AtomicU64,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,

    emitted: AtomicU64,
    delivered: AtomicU64,
    subscriber_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects_succeeded: AtomicU64,
}

impl EventBus {
    /// Create a bus with default tunables.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with explicit tunables.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            history: RwLock::new(HashMap::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            next_subscriber_id: AtomicU64::new(1),
            worker: Mutex::new(None),
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            subscriber_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnects_succeeded: AtomicU64::new(0),
        })
    }

    /// Spawn the dispatch worker. Idempotent; the second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let bus = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            bus.run_worker().await;
        }));
    }

    /// Register a subscriber for an event type.
    pub fn subscribe(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriberHandle {
        let event_type = event_type.into();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(event_type.clone())
            .or_default()
            .push(SubscriberEntry { id, subscriber });

        SubscriberHandle {
            bus: Arc::downgrade(self),
            event_type,
            id,
        }
    }

    /// Hand out a weak publisher for subscribers that publish back.
    #[must_use]
    pub fn publisher(self: &Arc<Self>) -> BusPublisher {
        BusPublisher {
            bus: Arc::downgrade(self),
        }
    }

    /// Accept an event for dispatch.
    ///
    /// Once accepted the event is never dropped; dispatch may be
    /// deferred while a fatal subscriber reconnects.
    pub fn emit(&self, event: HubEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Channel("event bus is shut down".to_string()));
        }

        self.record_history(&event);
        metrics::BUS_EVENTS
            .with_label_values(&[&event.priority.to_string()])
            .inc();
        self.emitted.fetch_add(1, Ordering::Relaxed);

        self.queues.lock()[event.priority.queue_index()].push_back(event);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Most recent events of a type, newest first.
    #[must_use]
    pub fn history(&self, event_type: &str, limit: usize) -> Vec<HubEvent> {
        self.history
            .read()
            .get(event_type)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let queues = self.queues.lock();
        BusStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            subscriber_errors: self.subscriber_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects_succeeded: self.reconnects_succeeded.load(Ordering::Relaxed),
            queue_depths: [queues[0].len(), queues[1].len(), queues[2].len()],
        }
    }

    /// Stop accepting events, drain what was accepted, stop the worker.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.wakeup.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Event bus worker exited abnormally");
            }
        }
    }

    fn record_history(&self, event: &HubEvent) {
        let mut history = self.history.write();
        let ring = history.entry(event.event_type.clone()).or_default();
        if ring.len() >= self.config.history_size {
            ring.pop_front();
        }
        ring.push_back(event.clone());
    }

    fn pop_next(&self) -> Option<HubEvent> {
        let mut queues = self.queues.lock();
        for queue in queues.iter_mut() {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
        }
        None
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            match self.pop_next() {
                Some(event) => self.dispatch(&event).await,
                None => {
                    if self.closed.load(Ordering::Acquire) {
                        break;
                    }
                    self.wakeup.notified().await;
                }
            }
        }
    }

    async fn dispatch(&self, event: &HubEvent) {
        let subscribers: Vec<Arc<dyn Subscriber>> = self
            .subscribers
            .read()
            .get(&event.event_type)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.subscriber)).collect())
            .unwrap_or_default();

        for subscriber in subscribers {
            match subscriber.handle(event).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::BUS_SUBSCRIBER_ERRORS.inc();
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        event_type = %event.event_type,
                        error = %error,
                        "Subscriber failed to handle event"
                    );
                    if subscriber.is_fatal(&error) {
                        self.reconnect_and_redeliver(subscriber.as_ref(), event).await;
                    }
                }
            }
        }
    }

    /// Exponential-backoff reconnection for a fatally-failed subscriber.
    /// On success the deferred event is delivered once more; on
    /// exhaustion the event moves on (it was still offered to siblings).
    async fn reconnect_and_redeliver(&self, subscriber: &dyn Subscriber, event: &HubEvent) {
        let mut delay = self.config.reconnect_base;
        for attempt in 1..=self.config.reconnect_attempts {
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            metrics::BUS_RECONNECT_ATTEMPTS.inc();
            tokio::time::sleep(delay).await;

            match subscriber.reconnect().await {
                Ok(()) => {
                    self.reconnects_succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        subscriber = subscriber.name(),
                        attempt,
                        "Subscriber transport reconnected"
                    );
                    match subscriber.handle(event).await {
                        Ok(()) => {
                            self.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                subscriber = subscriber.name(),
                                error = %error,
                                "Deferred delivery failed after reconnect"
                            );
                        }
                    }
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        attempt,
                        error = %error,
                        "Subscriber reconnect attempt failed"
                    );
                    delay = (delay * 2).min(self.config.reconnect_cap);
                }
            }
        }
        tracing::error!(
            subscriber = subscriber.name(),
            attempts = self.config.reconnect_attempts,
            event_type = %event.event_type,
            "Subscriber reconnection exhausted; deferring no further"
        );
    }

    fn unsubscribe(&self, event_type: &str, id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(entries) = subscribers.get_mut(event_type) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                subscribers.remove(event_type);
            }
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
///
/// Unsubscribing is explicit; dropping the handle leaves the
/// subscription in place.
pub struct SubscriberHandle {
    bus: Weak<EventBus>,
    event_type: String,
    id: u64,
}

impl SubscriberHandle {
    /// Remove the subscription from the bus.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.event_type, self.id);
        }
    }
}

/// Weak publishing handle for subscribers that emit back into the bus
#[derive(Clone)]
pub struct BusPublisher {
    bus: Weak<EventBus>,
}

impl BusPublisher {
    /// Publish an event; fails if the bus is gone or shut down.
    pub fn publish(&self, event: HubEvent) -> Result<()> {
        match self.bus.upgrade() {
            Some(bus) => bus.emit(event),
            None => Err(Error::Channel("event bus dropped".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(label: &str) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_on: Some(label.to_string()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, event: &HubEvent) -> Result<()> {
            let label = event.payload["label"].as_str().unwrap_or_default().to_string();
            if self.fail_on.as_deref() == Some(label.as_str()) {
                return Err(Error::Channel("boom".to_string()));
            }
            self.seen.lock().push(label);
            Ok(())
        }
    }

    struct FlakyTransport {
        seen: Mutex<Vec<String>>,
        failures_left: AtomicU64,
        reconnects: AtomicU64,
    }

    #[async_trait]
    impl Subscriber for FlakyTransport {
        async fn handle(&self, event: &HubEvent) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Channel("socket closed".to_string()));
            }
            let label = event.payload["label"].as_str().unwrap_or_default().to_string();
            self.seen.lock().push(label);
            Ok(())
        }

        fn is_fatal(&self, _error: &Error) -> bool {
            true
        }

        async fn reconnect(&self) -> Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "flaky-transport"
        }
    }

    fn labeled(event_type: &str, label: &str, priority: EventPriority) -> HubEvent {
        HubEvent::new(event_type, serde_json::json!({ "label": label })).with_priority(priority)
    }

    async fn settle(bus: &Arc<EventBus>) {
        // Wait until the queues are drained.
        for _ in 0..200 {
            let depths = bus.stats().queue_depths;
            if depths == [0, 0, 0] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_priority_drain_order() {
        let bus = EventBus::new();
        let recorder = Recorder::new();
        let _handle = bus.subscribe("signal", Arc::clone(&recorder) as Arc<dyn Subscriber>);

        // All present before the worker starts: strict high, normal, low.
        bus.emit(labeled("signal", "low-1", EventPriority::Low)).unwrap();
        bus.emit(labeled("signal", "normal-1", EventPriority::Normal)).unwrap();
        bus.emit(labeled("signal", "high-1", EventPriority::High)).unwrap();
        bus.emit(labeled("signal", "high-2", EventPriority::High)).unwrap();
        bus.emit(labeled("signal", "normal-2", EventPriority::Normal)).unwrap();

        bus.start();
        settle(&bus).await;

        assert_eq!(
            recorder.seen(),
            vec!["high-1", "high-2", "normal-1", "normal-2", "low-1"]
        );
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscriber_error_does_not_affect_siblings() {
        let bus = EventBus::new();
        let failing = Recorder::failing_on("x");
        let healthy = Recorder::new();
        let _h1 = bus.subscribe("signal", Arc::clone(&failing) as Arc<dyn Subscriber>);
        let _h2 = bus.subscribe("signal", Arc::clone(&healthy) as Arc<dyn Subscriber>);

        bus.start();
        bus.emit(labeled("signal", "x", EventPriority::Normal)).unwrap();
        settle(&bus).await;

        assert_eq!(healthy.seen(), vec!["x"]);
        assert_eq!(bus.stats().subscriber_errors, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let recorder = Recorder::new();
        let handle = bus.subscribe("signal", Arc::clone(&recorder) as Arc<dyn Subscriber>);

        bus.start();
        bus.emit(labeled("signal", "first", EventPriority::Normal)).unwrap();
        settle(&bus).await;

        handle.unsubscribe();
        bus.emit(labeled("signal", "second", EventPriority::Normal)).unwrap();
        settle(&bus).await;

        assert_eq!(recorder.seen(), vec!["first"]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_ring_bounded_newest_first() {
        let bus = EventBus::with_config(BusConfig {
            history_size: 3,
            ..BusConfig::default()
        });

        for i in 0..5 {
            bus.emit(labeled("signal", &format!("e{i}"), EventPriority::Normal))
                .unwrap();
        }

        let history = bus.history("signal", 10);
        let labels: Vec<_> = history
            .iter()
            .map(|e| e.payload["label"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(labels, vec!["e4", "e3", "e2"]);
        assert!(bus.history("other", 10).is_empty());
    }

    #[tokio::test]
    async fn test_fatal_error_triggers_reconnect_and_redelivery() {
        let bus = EventBus::with_config(BusConfig {
            reconnect_base: Duration::from_millis(1),
            ..BusConfig::default()
        });
        let transport = Arc::new(FlakyTransport {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU64::new(1),
            reconnects: AtomicU64::new(0),
        });
        let _handle = bus.subscribe("signal", Arc::clone(&transport) as Arc<dyn Subscriber>);

        bus.start();
        bus.emit(labeled("signal", "deferred", EventPriority::Normal)).unwrap();
        settle(&bus).await;

        // One reconnect attempt, then the deferred event landed.
        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(transport.seen.lock().clone(), vec!["deferred"]);
        let stats = bus.stats();
        assert_eq!(stats.reconnect_attempts, 1);
        assert_eq!(stats.reconnects_succeeded, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_fails() {
        let bus = EventBus::new();
        bus.start();
        bus.shutdown().await;
        let err = bus
            .emit(labeled("signal", "late", EventPriority::Normal))
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_events() {
        let bus = EventBus::new();
        let recorder = Recorder::new();
        let _handle = bus.subscribe("signal", Arc::clone(&recorder) as Arc<dyn Subscriber>);

        for i in 0..10 {
            bus.emit(labeled("signal", &format!("e{i}"), EventPriority::Normal))
                .unwrap();
        }
        bus.start();
        bus.shutdown().await;

        assert_eq!(recorder.seen().len(), 10);
    }

    #[tokio::test]
    async fn test_weak_publisher() {
        let bus = EventBus::new();
        let publisher = bus.publisher();
        let recorder = Recorder::new();
        let _handle = bus.subscribe("signal", Arc::clone(&recorder) as Arc<dyn Subscriber>);
        bus.start();

        publisher
            .publish(labeled("signal", "from-publisher", EventPriority::High))
            .unwrap();
        settle(&bus).await;
        assert_eq!(recorder.seen(), vec!["from-publisher"]);

        bus.shutdown().await;
        drop(bus);
        let err = publisher
            .publish(labeled("signal", "too-late", EventPriority::High))
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Ingress rate limiting and the signal queue
//!
//! A bounded priority queue caps the core's intake. At capacity, the
//! lowest-priority queued signal is dropped to make room; if the
//! newcomer is itself the lowest priority present, the newcomer is
//! rejected instead. A rolling window admits at most `R` signals per
//! `W`; signals beyond that are rejected with a counter increment and
//! may be re-submitted by the caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::constants::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RATE_LIMIT_N, DEFAULT_RATE_LIMIT_WINDOW,
};
use crate::metrics;
use crate::signal::{Signal, SignalPriority};

/// What happened to a signal offered to the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// Admitted with room to spare
    Accepted,
    /// Admitted; the named lowest-priority signal was dropped for room
    AcceptedDropped {
        /// Id of the signal evicted by the overflow policy
        dropped_signal_id: String,
    },
    /// Rejected: the queue was full and the newcomer was lowest priority
    RejectedQueueFull,
    /// Rejected by the rolling-window rate limit
    RejectedRateLimited,
}

impl EnqueueOutcome {
    /// True when the signal entered the queue.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            EnqueueOutcome::Accepted | EnqueueOutcome::AcceptedDropped { .. }
        )
    }

    /// Convert a rejection into the matching error for callers that
    /// want `?` semantics at the ingress seam.
    pub fn into_result(self) -> crate::error::Result<Self> {
        match self {
            EnqueueOutcome::RejectedRateLimited => Err(crate::error::Error::RateLimited(
                "ingress window exhausted; re-submit later".to_string(),
            )),
            EnqueueOutcome::RejectedQueueFull => Err(crate::error::Error::QueueFull(
                "queue at capacity and signal was lowest priority".to_string(),
            )),
            accepted => Ok(accepted),
        }
    }
}

/// Counters exposed by [`SignalQueue::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Signals admitted
    pub enqueued: u64,
    /// Signals handed to consumers
    pub dequeued: u64,
    /// Queued signals evicted by the overflow policy
    pub dropped_overflow: u64,
    /// Newcomers rejected because they were lowest priority at capacity
    pub rejected_queue_full: u64,
    /// Signals rejected by the rate limiter
    pub rate_limited: u64,
}

struct QueueInner {
    /// One FIFO per priority class, index 0 = high.
    lanes: [VecDeque<Signal>; 3],
    /// Admission timestamps inside the rolling window.
    admissions: VecDeque<Instant>,
    stats: QueueStats,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

fn lane_index(priority: SignalPriority) -> usize {
    match priority {
        SignalPriority::High => 0,
        SignalPriority::Normal => 1,
        SignalPriority::Low => 2,
    }
}

/// Bounded priority queue with rolling-window admission control
pub struct SignalQueue {
    capacity: usize,
    rate_limit_n: usize,
    rate_limit_window: Duration,
    inner: Mutex<QueueInner>,
    available: Notify,
    closed: AtomicBool,
}

impl SignalQueue {
    /// Create a queue with the default capacity and rate limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_QUEUE_CAPACITY,
            DEFAULT_RATE_LIMIT_N,
            DEFAULT_RATE_LIMIT_WINDOW,
        )
    }

    /// Create a queue with explicit capacity and rate limit.
    #[must_use]
    pub fn with_limits(capacity: usize, rate_limit_n: usize, rate_limit_window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            rate_limit_n,
            rate_limit_window,
            inner: Mutex::new(QueueInner {
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                admissions: VecDeque::new(),
                stats: QueueStats::default(),
            }),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Offer a signal to the queue.
    ///
    /// The signal's timestamp is clamped to the ingress clock so it
    /// never lies in the future.
    pub fn enqueue(&self, mut signal: Signal) -> EnqueueOutcome {
        let now_wall = chrono::Utc::now();
        if signal.timestamp > now_wall {
            tracing::warn!(
                signal_id = %signal.id,
                "Signal timestamp is in the future; clamping to ingress time"
            );
            signal.timestamp = now_wall;
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();

        // Rolling window: purge expired admissions, then check headroom.
        while let Some(&front) = inner.admissions.front() {
            if now.duration_since(front) >= self.rate_limit_window {
                inner.admissions.pop_front();
            } else {
                break;
            }
        }
        if inner.admissions.len() >= self.rate_limit_n {
            inner.stats.rate_limited += 1;
            metrics::SIGNALS_RATE_LIMITED.inc();
            return EnqueueOutcome::RejectedRateLimited;
        }

        // Overflow policy: evict the lowest-priority queued signal, or
        // reject the newcomer if nothing queued is lower.
        let mut dropped_id = None;
        if inner.len() >= self.capacity {
            let newcomer_lane = lane_index(signal.priority);
            let victim_lane = (newcomer_lane + 1..3).rev().find(|&lane| !inner.lanes[lane].is_empty());
            match victim_lane {
                Some(lane) => {
                    // Youngest of the lowest class goes first.
                    if let Some(victim) = inner.lanes[lane].pop_back() {
                        inner.stats.dropped_overflow += 1;
                        metrics::SIGNALS_DROPPED.inc();
                        tracing::warn!(
                            dropped_signal_id = %victim.id,
                            "Queue at capacity; dropped lowest-priority signal"
                        );
                        dropped_id = Some(victim.id);
                    }
                }
                None => {
                    inner.stats.rejected_queue_full += 1;
                    metrics::SIGNALS_DROPPED.inc();
                    return EnqueueOutcome::RejectedQueueFull;
                }
            }
        }

        inner.admissions.push_back(now);
        inner.stats.enqueued += 1;
        metrics::SIGNALS_INGESTED.inc();
        let lane = lane_index(signal.priority);
        inner.lanes[lane].push_back(signal);
        drop(inner);

        self.available.notify_one();
        match dropped_id {
            Some(dropped_signal_id) => EnqueueOutcome::AcceptedDropped { dropped_signal_id },
            None => EnqueueOutcome::Accepted,
        }
    }

    /// Take the highest-priority signal, waiting until one is
    /// available. Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<Signal> {
        loop {
            if let Some(signal) = self.try_dequeue() {
                return Some(signal);
            }
            if self.closed.load(Ordering::Acquire) {
                // Chain the wakeup so sibling consumers also drain out.
                self.available.notify_one();
                return None;
            }
            self.available.notified().await;
        }
    }

    /// Take the highest-priority signal without waiting.
    pub fn try_dequeue(&self) -> Option<Signal> {
        let mut inner = self.inner.lock();
        for lane in 0..3 {
            if let Some(signal) = inner.lanes[lane].pop_front() {
                inner.stats.dequeued += 1;
                return Some(signal);
            }
        }
        None
    }

    /// Queued signal count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued. Admission history is kept: clearing the
    /// queue does not reopen the rate-limit window.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for lane in inner.lanes.iter_mut() {
            lane.clear();
        }
    }

    /// Stop the queue: waiting consumers drain what remains, then get
    /// `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
        // A stored permit covers the consumer that checked `closed`
        // just before parking.
        self.available.notify_one();
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

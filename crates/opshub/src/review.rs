// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Human-in-the-loop review queue
//!
//! Decisions flagged `requires_approval` wait here as [`ReviewItem`]s:
//!
//! ```text
//! pending ──approve──→ approved   (→ dispatcher)
//!    │
//!    ├──reject──→ rejected
//!    │
//!    └──timeout_at elapses──→ timed_out  (policy: reject or
//!                                         auto-approve)
//! ```
//!
//! Transitions are idempotent: resolving an already-terminal item is a
//! no-op that reports the current state. A background scanner wakes on
//! a fixed tick and times out expired items. Approval clears the
//! decision's `requires_approval` flag and hands it to the dispatcher
//! through an mpsc channel.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::classification::Urgency;
use crate::constants::{DEFAULT_MPSC_CHANNEL_CAPACITY, DEFAULT_REVIEW_TICK, DEFAULT_REVIEW_TTL};
use crate::decision::Decision;
use crate::error::{Error, Result};
use crate::metrics;

/// What happens when a review item's timeout elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Expired items count as rejections
    #[default]
    Reject,
    /// Expired items proceed to the dispatcher
    AutoApprove,
}

/// Review item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a human
    Pending,
    /// Approved; handed to the dispatcher
    Approved,
    /// Rejected by a human
    Rejected,
    /// Timeout elapsed before a human resolved it
    TimedOut,
}

impl ReviewStatus {
    /// True for terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != ReviewStatus::Pending
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Pending => write!(f, "pending"),
            ReviewStatus::Approved => write!(f, "approved"),
            ReviewStatus::Rejected => write!(f, "rejected"),
            ReviewStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Human resolution of a pending item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Let the decision proceed
    Approve,
    /// Stop the decision
    Reject,
}

/// One decision awaiting approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Unique review id
    pub review_id: String,
    /// Signal the decision is about
    pub signal_id: String,
    /// The decision under review
    pub decision: Decision,
    /// Why approval is required
    pub reason: String,
    /// When the item entered the queue
    pub queued_at: DateTime<Utc>,
    /// When the item times out
    pub timeout_at: DateTime<Utc>,
    /// Current state
    pub status: ReviewStatus,
    /// Urgency inherited from the classification
    pub urgency: Urgency,
    /// Resolution note, if one was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Queue tunables
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Default item TTL when enqueue gives none
    pub default_ttl: Duration,
    /// Scanner wake interval
    pub tick: Duration,
    /// Expiry policy
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_REVIEW_TTL,
            tick: DEFAULT_REVIEW_TICK,
            timeout_policy: TimeoutPolicy::Reject,
        }
    }
}

/// The pending-approval state store
pub struct ReviewQueue {
    config: ReviewConfig,
    items: Mutex<HashMap<String, ReviewItem>>,
    released_tx: mpsc::Sender<ReviewItem>,
    scanner: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ReviewQueue {
    /// Create a queue; the receiver yields approved (or auto-approved)
    /// items with `requires_approval` cleared, ready for dispatch.
    #[must_use]
    pub fn new(config: ReviewConfig) -> (Arc<Self>, mpsc::Receiver<ReviewItem>) {
        let (released_tx, released_rx) = mpsc::channel(DEFAULT_MPSC_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                config,
                items: Mutex::new(HashMap::new()),
                released_tx,
                scanner: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            released_rx,
        )
    }

    /// Spawn the timeout scanner. Idempotent.
    pub fn start_scanner(self: &Arc<Self>) {
        let mut scanner = self.scanner.lock();
        if scanner.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        let tick = self.config.tick;
        *scanner = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if queue.closed.load(Ordering::Acquire) {
                    break;
                }
                queue.expire_due_items(Utc::now()).await;
            }
        }));
    }

    /// Stop the scanner.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let handle = self.scanner.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Queue a decision for approval.
    pub fn enqueue(
        &self,
        decision: Decision,
        reason: impl Into<String>,
        urgency: Urgency,
        ttl: Option<Duration>,
    ) -> ReviewItem {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let item = ReviewItem {
            review_id: uuid::Uuid::new_v4().to_string(),
            signal_id: decision.signal_id.clone(),
            decision,
            reason: reason.into(),
            queued_at: now,
            timeout_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
            status: ReviewStatus::Pending,
            urgency,
            note: None,
        };
        self.items.lock().insert(item.review_id.clone(), item.clone());
        tracing::info!(
            review_id = %item.review_id,
            signal_id = %item.signal_id,
            reason = %item.reason,
            "Decision queued for review"
        );
        item
    }

    /// All items, sorted by `queued_at` ascending.
    #[must_use]
    pub fn list(&self) -> Vec<ReviewItem> {
        let mut items: Vec<ReviewItem> = self.items.lock().values().cloned().collect();
        items.sort_by_key(|item| item.queued_at);
        items
    }

    /// Pending items, sorted by `queued_at` ascending.
    #[must_use]
    pub fn pending(&self) -> Vec<ReviewItem> {
        let mut items: Vec<ReviewItem> = self
            .items
            .lock()
            .values()
            .filter(|item| item.status == ReviewStatus::Pending)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.queued_at);
        items
    }

    /// Pending item count.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.items
            .lock()
            .values()
            .filter(|item| item.status == ReviewStatus::Pending)
            .count()
    }

    /// One item by id.
    #[must_use]
    pub fn get(&self, review_id: &str) -> Option<ReviewItem> {
        self.items.lock().get(review_id).cloned()
    }

    /// Resolve a pending item. Idempotent: a terminal item is returned
    /// unchanged regardless of the requested outcome.
    pub async fn resolve(
        &self,
        review_id: &str,
        outcome: ReviewOutcome,
        note: Option<String>,
    ) -> Result<ReviewItem> {
        let released = {
            let mut items = self.items.lock();
            let item = items
                .get_mut(review_id)
                .ok_or_else(|| Error::NotFound(format!("review item {review_id}")))?;

            if item.status.is_terminal() {
                return Ok(item.clone());
            }

            item.note = note;
            match outcome {
                ReviewOutcome::Approve => {
                    item.status = ReviewStatus::Approved;
                    item.decision.requires_approval = false;
                    Some(item.clone())
                }
                ReviewOutcome::Reject => {
                    item.status = ReviewStatus::Rejected;
                    None
                }
            }
        };

        match released {
            Some(item) => {
                self.release(item.clone()).await;
                Ok(item)
            }
            None => self
                .get(review_id)
                .ok_or_else(|| Error::NotFound(format!("review item {review_id}"))),
        }
    }

    /// Time out every pending item whose deadline passed. Under the
    /// auto-approve policy expired decisions are still released to the
    /// dispatcher.
    pub async fn expire_due_items(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<ReviewItem> = {
            let mut items = self.items.lock();
            let mut expired = Vec::new();
            for item in items.values_mut() {
                if item.status == ReviewStatus::Pending && item.timeout_at <= now {
                    item.status = ReviewStatus::TimedOut;
                    expired.push(item.clone());
                }
            }
            expired
        };

        for mut item in expired.clone() {
            metrics::REVIEW_TIMEOUTS.inc();
            tracing::warn!(
                review_id = %item.review_id,
                policy = ?self.config.timeout_policy,
                "Review item timed out"
            );
            if self.config.timeout_policy == TimeoutPolicy::AutoApprove {
                item.decision.requires_approval = false;
                self.release(item).await;
            }
        }
        expired.len()
    }

    async fn release(&self, item: ReviewItem) {
        if let Err(error) = self.released_tx.send(item).await {
            tracing::error!(error = %error, "Approved-decision channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{ActionKind, TargetPlatform};

    fn decision() -> Decision {
        Decision::new("sig-1", ActionKind::UpdateDocument, TargetPlatform::Filesystem)
            .with_approval_required(true)
    }

    fn queue(policy: TimeoutPolicy) -> (Arc<ReviewQueue>, mpsc::Receiver<ReviewItem>) {
        ReviewQueue::new(ReviewConfig {
            default_ttl: Duration::from_secs(3600),
            tick: Duration::from_millis(20),
            timeout_policy: policy,
        })
    }

    #[tokio::test]
    async fn test_enqueue_and_list_sorted() {
        let (queue, _rx) = queue(TimeoutPolicy::Reject);
        let first = queue.enqueue(decision(), "financial document", Urgency::Medium, None);
        let second = queue.enqueue(decision(), "low confidence", Urgency::High, None);

        let listed = queue.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].review_id, first.review_id);
        assert_eq!(listed[1].review_id, second.review_id);
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_approve_releases_cleared_decision() {
        let (queue, mut rx) = queue(TimeoutPolicy::Reject);
        let item = queue.enqueue(decision(), "needs sign-off", Urgency::Medium, None);

        let resolved = queue
            .resolve(&item.review_id, ReviewOutcome::Approve, Some("lgtm".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.status, ReviewStatus::Approved);
        assert_eq!(resolved.note.as_deref(), Some("lgtm"));

        let released = rx.recv().await.unwrap();
        assert_eq!(released.review_id, item.review_id);
        assert!(!released.decision.requires_approval);
    }

    #[tokio::test]
    async fn test_reject_releases_nothing() {
        let (queue, mut rx) = queue(TimeoutPolicy::Reject);
        let item = queue.enqueue(decision(), "needs sign-off", Urgency::Medium, None);

        let resolved = queue
            .resolve(&item.review_id, ReviewOutcome::Reject, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, ReviewStatus::Rejected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (queue, mut rx) = queue(TimeoutPolicy::Reject);
        let item = queue.enqueue(decision(), "reason", Urgency::Medium, None);

        queue
            .resolve(&item.review_id, ReviewOutcome::Approve, None)
            .await
            .unwrap();
        // A second approve is a no-op, and a conflicting reject does
        // not overwrite the terminal state.
        let again = queue
            .resolve(&item.review_id, ReviewOutcome::Approve, None)
            .await
            .unwrap();
        assert_eq!(again.status, ReviewStatus::Approved);
        let conflicting = queue
            .resolve(&item.review_id, ReviewOutcome::Reject, None)
            .await
            .unwrap();
        assert_eq!(conflicting.status, ReviewStatus::Approved);

        // Only one release happened.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_item() {
        let (queue, _rx) = queue(TimeoutPolicy::Reject);
        let err = queue
            .resolve("missing", ReviewOutcome::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_reject_policy() {
        let (queue, mut rx) = queue(TimeoutPolicy::Reject);
        let item = queue.enqueue(
            decision(),
            "reason",
            Urgency::Medium,
            Some(Duration::from_millis(0)),
        );

        let expired = queue.expire_due_items(Utc::now()).await;
        assert_eq!(expired, 1);
        assert_eq!(queue.get(&item.review_id).unwrap().status, ReviewStatus::TimedOut);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_auto_approve_policy_releases() {
        let (queue, mut rx) = queue(TimeoutPolicy::AutoApprove);
        let item = queue.enqueue(
            decision(),
            "reason",
            Urgency::Medium,
            Some(Duration::from_millis(0)),
        );

        queue.expire_due_items(Utc::now()).await;
        assert_eq!(queue.get(&item.review_id).unwrap().status, ReviewStatus::TimedOut);
        let released = rx.recv().await.unwrap();
        assert!(!released.decision.requires_approval);
    }

    #[tokio::test]
    async fn test_timeout_does_not_touch_unexpired() {
        let (queue, _rx) = queue(TimeoutPolicy::Reject);
        queue.enqueue(decision(), "reason", Urgency::Medium, Some(Duration::from_secs(600)));
        let expired = queue.expire_due_items(Utc::now()).await;
        assert_eq!(expired, 0);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_background_scanner_expires() {
        let (queue, _rx) = queue(TimeoutPolicy::Reject);
        queue.start_scanner();
        let item = queue.enqueue(
            decision(),
            "reason",
            Urgency::Medium,
            Some(Duration::from_millis(1)),
        );

        // Give the scanner a few ticks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.get(&item.review_id).unwrap().status, ReviewStatus::TimedOut);
        queue.shutdown().await;
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Duplicate detection over recent task titles
//!
//! An in-memory index of the N most recent task titles. Lookups
//! normalize the candidate (lowercase, punctuation stripped, stopwords
//! removed), compute edit-distance similarity against every stored
//! title, and return the best match. Similarity is
//! `1 − distance / max(len(a), len(b))`; two empty strings score 1.0.
//!
//! Lookups **fail open**: a failure in the backing store is logged and
//! treated as no-duplicate, never blocking task creation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::constants::{DEFAULT_DUPLICATE_CORPUS, DEFAULT_DUPLICATE_THRESHOLD};
use crate::error::Result;
use crate::metrics;
use crate::preprocess::is_stopword;

/// Normalize a title for comparison.
///
/// Lowercases, maps punctuation to spaces, removes stopwords, and
/// collapses whitespace. Idempotent: normalizing a normalized title is
/// a no-op.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty() && !is_stopword(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character-level Levenshtein distance, two-row dynamic program.
#[must_use]
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Similarity of two already-normalized titles in [0, 1].
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - (edit_distance(a, b) as f64) / (longest as f64)
}

/// One stored title with its platform reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleEntry {
    /// Original title as created
    pub title: String,
    /// Normalized form used for comparison
    pub normalized: String,
    /// Platform reference (task id or URL)
    pub reference: String,
    /// When the title entered the index
    pub added_at: DateTime<Utc>,
}

impl TitleEntry {
    /// Build an entry, normalizing the title.
    pub fn new(title: impl Into<String>, reference: impl Into<String>) -> Self {
        let title = title.into();
        let normalized = normalize_title(&title);
        Self {
            title,
            normalized,
            reference: reference.into(),
            added_at: Utc::now(),
        }
    }
}

/// Best match found for a candidate title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    /// Existing title
    pub title: String,
    /// Existing platform reference
    pub reference: String,
    /// Similarity score in [0, 1]
    pub similarity: f64,
}

/// Backing store seam for the title corpus
///
/// The production wrapper may sit on external storage; the index
/// treats any error as "no titles" and fails open.
#[async_trait]
pub trait TitleStore: Send + Sync {
    /// All stored entries, most recent last.
    async fn entries(&self) -> Result<Vec<TitleEntry>>;

    /// Append an entry, evicting the oldest beyond the bound.
    async fn add(&self, entry: TitleEntry) -> Result<()>;
}

/// Bounded in-memory title store
pub struct InMemoryTitleStore {
    max_entries: usize,
    entries: Mutex<VecDeque<TitleEntry>>,
}

impl InMemoryTitleStore {
    /// Create a store bounded to the default corpus size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DUPLICATE_CORPUS)
    }

    /// Create a store bounded to `max_entries`.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for InMemoryTitleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TitleStore for InMemoryTitleStore {
    async fn entries(&self) -> Result<Vec<TitleEntry>> {
        Ok(self.entries.lock().iter().cloned().collect())
    }

    async fn add(&self, entry: TitleEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }
}

/// Fuzzy duplicate index over recent task titles
pub struct DuplicateIndex {
    store: std::sync::Arc<dyn TitleStore>,
    threshold: f64,
}

impl DuplicateIndex {
    /// Create an index over the given store with the default threshold.
    pub fn new(store: std::sync::Arc<dyn TitleStore>) -> Self {
        Self::with_threshold(store, DEFAULT_DUPLICATE_THRESHOLD)
    }

    /// Create an index with an explicit duplicate threshold.
    pub fn with_threshold(store: std::sync::Arc<dyn TitleStore>, threshold: f64) -> Self {
        Self {
            store,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// The configured duplicate threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Best match for a candidate title, regardless of threshold.
    ///
    /// Fails open: a store error is logged and counted, and the lookup
    /// reports no match.
    pub async fn best_match(&self, title: &str) -> Option<DuplicateMatch> {
        let normalized = normalize_title(title);
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(error) => {
                metrics::DUPLICATE_LOOKUP_FAILURES.inc();
                tracing::warn!(
                    error = %error,
                    "Duplicate index lookup failed; failing open as no-duplicate"
                );
                return None;
            }
        };

        entries
            .iter()
            .map(|entry| DuplicateMatch {
                title: entry.title.clone(),
                reference: entry.reference.clone(),
                similarity: similarity(&normalized, &entry.normalized),
            })
            .max_by(|a, b| {
                a.similarity
                    .partial_cmp(&b.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Best match at or above the duplicate threshold.
    pub async fn find_duplicate(&self, title: &str) -> Option<DuplicateMatch> {
        self.best_match(title)
            .await
            .filter(|m| m.similarity >= self.threshold)
    }

    /// Record a created task title. Failures are logged and ignored;
    /// a missed record can only cause a future duplicate to slip
    /// through, which the tracker-side idempotency still catches.
    pub async fn record(&self, title: &str, reference: &str) {
        let entry = TitleEntry::new(title, reference);
        if let Err(error) = self.store.add(entry).await {
            tracing::warn!(error = %error, "Failed to record title in duplicate index");
        }
    }
}

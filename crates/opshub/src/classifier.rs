// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Classification with a fingerprint-keyed cache
//!
//! `classify` produces exactly one [`Classification`] per non-cancelled
//! signal and never throws into the pipeline: oracle transport
//! failures and unparseable responses degrade to a low-confidence
//! fallback.
//!
//! The cache is an LRU keyed by the signal fingerprint with a TTL;
//! within the TTL, classifying the same fingerprint twice yields
//! bitwise identical results. Concurrent callers for one fingerprint
//! share a single in-flight oracle invocation (singleflight).
//!
//! Before a fresh classification is cached, the pattern store applies
//! its bounded adjustments: urgency up at most one step, confidence up
//! at most +0.1, category overridable to the sender's dominant one.

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::classification::Classification;
use crate::constants::{DEFAULT_CACHE_MAX_SIZE, DEFAULT_CACHE_TTL, OVERSIZE_BODY_CHARS};
use crate::error::{Error, Result};
use crate::metrics;
use crate::oracle::{CharEstimator, Oracle, OracleOptions, OracleUsage, TokenEstimator};
use crate::optimizer::AbSelector;
use crate::patterns::PatternStore;
use crate::preprocess::PreparedSignal;

/// Stricter instruction appended after an unparseable response.
const STRICT_RETRY_INSTRUCTION: &str =
    "That response was not a valid JSON object. Reply again with ONLY the JSON object \
     described in the instructions: no markdown fences, no commentary, nothing before \
     or after the JSON.";

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that went to the oracle
    pub misses: u64,
    /// Entries dropped because their TTL elapsed
    pub ttl_evictions: u64,
}

impl CacheStats {
    /// Hit fraction over all lookups.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Result of classifying one signal
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyOutcome {
    /// The (pattern-adjusted) classification
    pub classification: Classification,
    /// Template version that produced it; 0 for boundary fallbacks
    pub template_version: u32,
    /// True when the result came from the cache
    pub from_cache: bool,
    /// Reported or estimated token usage for the call (zero on hits)
    pub usage: OracleUsage,
}

#[derive(Clone)]
struct CachedEntry {
    classification: Classification,
    template_version: u32,
    inserted_at: Instant,
}

type InflightCell = Arc<tokio::sync::OnceCell<(Classification, u32, OracleUsage)>>;

/// The classifier: oracle + cache + singleflight + pattern adjustment
pub struct Classifier {
    oracle: Arc<dyn Oracle>,
    selector: Arc<AbSelector>,
    patterns: Arc<PatternStore>,
    estimator: Arc<dyn TokenEstimator>,
    cache: Mutex<LruCache<String, CachedEntry>>,
    ttl: Duration,
    oracle_timeout: Duration,
    inflight: DashMap<String, InflightCell>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl_evictions: AtomicU64,
}

impl Classifier {
    /// Create a classifier with default cache capacity and TTL.
    pub fn new(
        oracle: Arc<dyn Oracle>,
        selector: Arc<AbSelector>,
        patterns: Arc<PatternStore>,
    ) -> Self {
        Self::with_cache(
            oracle,
            selector,
            patterns,
            DEFAULT_CACHE_MAX_SIZE,
            DEFAULT_CACHE_TTL,
        )
    }

    /// Create a classifier with explicit cache tunables.
    pub fn with_cache(
        oracle: Arc<dyn Oracle>,
        selector: Arc<AbSelector>,
        patterns: Arc<PatternStore>,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            oracle,
            selector,
            patterns,
            estimator: Arc::new(CharEstimator),
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            oracle_timeout: crate::constants::DEFAULT_ORACLE_TIMEOUT,
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl_evictions: AtomicU64::new(0),
        }
    }

    /// Replace the token estimator (e.g. with a real tokenizer).
    #[must_use]
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Override the oracle call deadline.
    #[must_use]
    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_evictions: self.ttl_evictions.load(Ordering::Relaxed),
        }
    }

    /// Entries currently cached.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Classify one prepared signal.
    ///
    /// Cancellation aborts the oracle call and surfaces
    /// [`Error::Cancelled`]; every other failure degrades to a
    /// low-confidence classification.
    pub async fn classify(
        &self,
        prepared: &PreparedSignal,
        cancel: &CancellationToken,
    ) -> Result<ClassifyOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Boundary behaviors bypass the oracle entirely.
        if prepared.normalized_body.is_empty() {
            return Ok(self.boundary(prepared, Classification::empty_body_fallback()));
        }
        if prepared.signal.body.chars().count() > OVERSIZE_BODY_CHARS {
            return Ok(self.boundary(prepared, Classification::oversize_body_fallback()));
        }

        if let Some(entry) = self.cache_lookup(&prepared.fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_HITS.inc();
            return Ok(ClassifyOutcome {
                classification: entry.classification,
                template_version: entry.template_version,
                from_cache: true,
                usage: OracleUsage::default(),
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_MISSES.inc();

        // Singleflight: concurrent callers for one fingerprint share
        // the in-flight oracle invocation.
        let cell = Arc::clone(
            &self
                .inflight
                .entry(prepared.fingerprint.clone())
                .or_default(),
        );
        let result = cell
            .get_or_try_init(|| self.classify_uncached(prepared, cancel))
            .await
            .cloned();
        self.inflight.remove(&prepared.fingerprint);

        let (classification, template_version, usage) = result?;
        Ok(ClassifyOutcome {
            classification,
            template_version,
            from_cache: false,
            usage,
        })
    }

    fn boundary(&self, prepared: &PreparedSignal, fallback: Classification) -> ClassifyOutcome {
        // Boundary fallbacks cache too: one classification per
        // fingerprint holds for degenerate signals as well.
        let adjusted = self.patterns.snapshot().adjust(prepared, &fallback);
        self.cache_insert(&prepared.fingerprint, adjusted.clone(), 0);
        ClassifyOutcome {
            classification: adjusted,
            template_version: 0,
            from_cache: false,
            usage: OracleUsage::default(),
        }
    }

    async fn classify_uncached(
        &self,
        prepared: &PreparedSignal,
        cancel: &CancellationToken,
    ) -> Result<(Classification, u32, OracleUsage)> {
        // Double-check under the singleflight cell: a racing caller may
        // have filled the cache between our lookup and the cell init.
        if let Some(entry) = self.cache_lookup(&prepared.fingerprint) {
            return Ok((
                entry.classification,
                entry.template_version,
                OracleUsage::default(),
            ));
        }

        let template = self.selector.select();
        let template_version = template.version;
        let signal_block = render_signal_block(prepared);
        let options = OracleOptions::classification(self.oracle_timeout);

        let mut messages = template.to_messages(&signal_block);
        let mut usage = OracleUsage::default();
        let mut classification: Option<Classification> = None;

        // One strict retry on a parse failure, then the fallback.
        for attempt in 0..2 {
            let response = match self.call_oracle(&messages, &options, cancel).await {
                Ok(response) => response,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => {
                    metrics::ORACLE_CALLS.with_label_values(&["error"]).inc();
                    tracing::warn!(
                        fingerprint = %prepared.fingerprint,
                        error = %error,
                        "Oracle call failed; serving fallback classification"
                    );
                    break;
                }
            };

            usage.input_tokens = usage.input_tokens.saturating_add(
                if response.usage.total() > 0 {
                    response.usage.input_tokens
                } else {
                    self.estimate_messages(&messages)
                },
            );
            usage.output_tokens = usage.output_tokens.saturating_add(
                if response.usage.total() > 0 {
                    response.usage.output_tokens
                } else {
                    self.estimator.estimate(&response.content)
                },
            );

            match parse_classification(&response.content) {
                Ok(parsed) => {
                    metrics::ORACLE_CALLS.with_label_values(&["ok"]).inc();
                    classification = Some(parsed);
                    break;
                }
                Err(error) => {
                    metrics::ORACLE_CALLS
                        .with_label_values(&["parse_retry"])
                        .inc();
                    tracing::warn!(
                        fingerprint = %prepared.fingerprint,
                        attempt,
                        error = %error,
                        "Oracle returned unparseable classification"
                    );
                    messages.push(crate::oracle::OracleMessage::assistant(&response.content));
                    messages.push(crate::oracle::OracleMessage::user(STRICT_RETRY_INSTRUCTION));
                }
            }
        }

        let classification = classification.unwrap_or_else(|| {
            metrics::ORACLE_CALLS.with_label_values(&["fallback"]).inc();
            Classification::parse_failure_fallback()
        });

        let adjusted = self.patterns.snapshot().adjust(prepared, &classification);
        self.cache_insert(&prepared.fingerprint, adjusted.clone(), template_version);
        Ok((adjusted, template_version, usage))
    }

    async fn call_oracle(
        &self,
        messages: &[crate::oracle::OracleMessage],
        options: &OracleOptions,
        cancel: &CancellationToken,
    ) -> Result<crate::oracle::OracleResponse> {
        let call = self.oracle.chat(messages, options);
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.oracle_timeout, call) => match result {
                Ok(response) => response,
                Err(_) => Err(Error::Timeout(self.oracle_timeout)),
            },
        }
    }

    fn estimate_messages(&self, messages: &[crate::oracle::OracleMessage]) -> u32 {
        messages
            .iter()
            .map(|m| self.estimator.estimate(&m.content))
            .fold(0u32, u32::saturating_add)
    }

    fn cache_lookup(&self, fingerprint: &str) -> Option<CachedEntry> {
        let mut cache = self.cache.lock();
        match cache.get(fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.clone()),
            Some(_) => {
                cache.pop(fingerprint);
                self.ttl_evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    fn cache_insert(&self, fingerprint: &str, classification: Classification, version: u32) {
        self.cache.lock().put(
            fingerprint.to_string(),
            CachedEntry {
                classification,
                template_version: version,
                inserted_at: Instant::now(),
            },
        );
    }
}

/// Render the user-visible block describing one signal.
fn render_signal_block(prepared: &PreparedSignal) -> String {
    let signal = &prepared.signal;
    let mut block = format!(
        "Source: {}\nFrom: {}\nSubject: {}\nBody: {}",
        signal.source, signal.sender, signal.subject, signal.body
    );
    if !signal.attachments.is_empty() {
        let names: Vec<&str> = signal
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();
        block.push_str(&format!("\nAttachments: {}", names.join(", ")));
    }
    block
}

/// Parse the oracle's JSON into a classification.
///
/// Tolerates text around the object (markdown fences, prose) by
/// falling back to the outermost brace span.
fn parse_classification(content: &str) -> Result<Classification> {
    if let Ok(classification) = serde_json::from_str::<Classification>(content) {
        return Ok(classification);
    }

    let start = content.find('{');
    let end = content.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            let inner = &content[start..=end];
            return serde_json::from_str::<Classification>(inner)
                .map_err(|e| Error::Schema(format!("unparseable classification: {e}")));
        }
    }
    Err(Error::Schema("no JSON object in oracle response".to_string()))
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Signal preprocessing
//!
//! A pure, deterministic pass over one signal: lowercases text, strips
//! stopwords for keyword extraction, pulls out email addresses and date
//! mentions, and computes the cache fingerprint. No I/O, no clock.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::constants::FINGERPRINT_BODY_PREFIX;
use crate::signal::Signal;

/// Stopwords removed during keyword extraction and title normalization.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "i",
    "in", "is", "it", "its", "of", "on", "or", "our", "so", "that", "the", "their", "they",
    "this", "to", "was", "we", "were", "will", "with", "you", "your",
];

static STOPWORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS.iter().copied().collect());

/// Shared stopword check for keyword extraction and title
/// normalization in the duplicate index.
pub(crate) fn is_stopword(word: &str) -> bool {
    STOPWORD_SET.contains(word)
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
        .expect("valid email regex");
    re
});

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(
        r"(?ix)
        \b\d{4}-\d{2}-\d{2}\b            # 2026-03-14
        | \b\d{1,2}/\d{1,2}/\d{2,4}\b    # 3/14/2026
        | \b(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b
        | \b(?:today|tomorrow|tonight|eod|eow)\b
        ",
    )
    .expect("valid date regex");
    re
});

/// Entities extracted from a signal's text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    /// Email addresses found in subject or body
    pub emails: Vec<String>,
    /// Date mentions (ISO dates, slash dates, weekday words)
    pub dates: Vec<String>,
}

/// A signal plus everything preprocessing derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedSignal {
    /// The original signal, untouched
    pub signal: Signal,
    /// Lowercased, whitespace-collapsed subject
    pub normalized_subject: String,
    /// Lowercased, whitespace-collapsed body
    pub normalized_body: String,
    /// Stopword-free keywords in first-seen order
    pub keywords: Vec<String>,
    /// Extracted entities
    pub entities: ExtractedEntities,
    /// Deterministic cache key
    pub fingerprint: String,
}

impl PreparedSignal {
    /// True when both subject and body are effectively empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.normalized_subject.is_empty() && self.normalized_body.is_empty()
    }
}

/// Run the full preprocessing pass over one signal.
#[must_use]
pub fn preprocess(signal: Signal) -> PreparedSignal {
    let normalized_subject = normalize_text(&signal.subject);
    let normalized_body = normalize_text(&signal.body);
    let keywords = extract_keywords(&normalized_subject, &normalized_body);
    let entities = extract_entities(&signal.subject, &signal.body);
    let fingerprint = fingerprint(&signal);

    PreparedSignal {
        signal,
        normalized_subject,
        normalized_body,
        keywords,
        entities,
        fingerprint,
    }
}

/// Lowercase and collapse runs of whitespace. Idempotent.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stopword-free keywords from subject then body, first-seen order,
/// alphanumeric tokens of length >= 3.
#[must_use]
pub fn extract_keywords(normalized_subject: &str, normalized_body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for text in [normalized_subject, normalized_body] {
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 3 || STOPWORD_SET.contains(token) {
                continue;
            }
            if seen.insert(token.to_string()) {
                keywords.push(token.to_string());
            }
        }
    }

    keywords
}

/// Pull email addresses and date mentions out of the raw text.
#[must_use]
pub fn extract_entities(subject: &str, body: &str) -> ExtractedEntities {
    let mut emails = Vec::new();
    let mut dates = Vec::new();
    let mut seen_emails = HashSet::new();
    let mut seen_dates = HashSet::new();

    for text in [subject, body] {
        for m in EMAIL_RE.find_iter(text) {
            let email = m.as_str().to_lowercase();
            if seen_emails.insert(email.clone()) {
                emails.push(email);
            }
        }
        for m in DATE_RE.find_iter(text) {
            let date = m.as_str().to_lowercase();
            if seen_dates.insert(date.clone()) {
                dates.push(date);
            }
        }
    }

    ExtractedEntities { emails, dates }
}

/// Deterministic fingerprint over the normalized identifying fields.
///
/// Two signals with the same source, subject, body prefix, and sender
/// share a fingerprint and therefore a cached classification. The body
/// is truncated so trailing quoted history does not defeat caching.
#[must_use]
pub fn fingerprint(signal: &Signal) -> String {
    let subject = normalize_text(&signal.subject);
    let body = normalize_text(&signal.body);
    let body_prefix: String = body.chars().take(FINGERPRINT_BODY_PREFIX).collect();
    let sender = signal.sender.trim().to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(signal.source.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(subject.as_bytes());
    hasher.update(b"\n");
    hasher.update(body_prefix.as_bytes());
    hasher.update(b"\n");
    hasher.update(sender.as_bytes());
    hex::encode(hasher.finalize())
}

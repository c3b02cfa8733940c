// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Classification model
//!
//! The oracle's verdict on one signal. Enum serde names match the JSON
//! the oracle is instructed to produce, so a parsed response maps
//! straight onto [`Classification`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// How quickly a signal needs attention
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Can wait indefinitely
    Low = 1,
    /// Normal turnaround
    #[default]
    Medium = 2,
    /// Needs attention today
    High = 3,
    /// Drop everything
    Critical = 4,
}

impl Urgency {
    /// One step up, saturating at critical. Pattern adjustments are
    /// bounded to a single step.
    #[must_use]
    pub fn raised(self) -> Self {
        match self {
            Urgency::Low => Urgency::Medium,
            Urgency::Medium => Urgency::High,
            Urgency::High | Urgency::Critical => Urgency::Critical,
        }
    }

    /// Encoded 1..4 for averaging in the pattern store.
    #[must_use]
    pub fn encode(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Urgency::encode`], clamping out-of-range values.
    #[must_use]
    pub fn decode(value: f64) -> Self {
        match value.round() as i64 {
            i64::MIN..=1 => Urgency::Low,
            2 => Urgency::Medium,
            3 => Urgency::High,
            _ => Urgency::Critical,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

/// How much the signal matters to the business
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Routine
    Low = 1,
    /// Notable
    #[default]
    Medium = 2,
    /// Business-critical
    High = 3,
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Importance::Low => write!(f, "low"),
            Importance::Medium => write!(f, "medium"),
            Importance::High => write!(f, "high"),
        }
    }
}

/// What kind of signal this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Something is broken
    Incident,
    /// Someone wants something done
    Request,
    /// A problem report that is not an outage
    Issue,
    /// A question expecting an answer
    Question,
    /// FYI traffic
    #[default]
    Information,
    /// Ongoing conversation
    Discussion,
    /// Unsolicited junk
    Spam,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Incident => write!(f, "incident"),
            Category::Request => write!(f, "request"),
            Category::Issue => write!(f, "issue"),
            Category::Question => write!(f, "question"),
            Category::Information => write!(f, "information"),
            Category::Discussion => write!(f, "discussion"),
            Category::Spam => write!(f, "spam"),
        }
    }
}

/// The oracle's verdict on one signal
///
/// Produced exactly once per signal and cached under the signal's
/// fingerprint; cache hits hand out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// How quickly this needs attention
    pub urgency: Urgency,
    /// How much it matters
    pub importance: Importance,
    /// What kind of signal it is
    pub category: Category,
    /// Oracle confidence in [0, 1]
    pub confidence: f64,
    /// Human-readable reasoning
    pub reasoning: String,
    /// Action hints from the oracle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_actions: Vec<String>,
    /// True when the signal should bypass normal queueing downstream
    #[serde(default)]
    pub requires_immediate: bool,
}

impl Classification {
    /// Create a classification with the given verdict and confidence.
    pub fn new(
        urgency: Urgency,
        importance: Importance,
        category: Category,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            urgency,
            importance,
            category,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            suggested_actions: Vec::new(),
            requires_immediate: false,
        }
    }

    /// The fallback served when the oracle's output cannot be parsed.
    /// Never an error: the pipeline continues on low confidence.
    #[must_use]
    pub fn parse_failure_fallback() -> Self {
        Self::new(
            Urgency::Medium,
            Importance::Medium,
            Category::Information,
            0.30,
            "parse_failure",
        )
    }

    /// Served for empty-body signals without consulting the oracle.
    #[must_use]
    pub fn empty_body_fallback() -> Self {
        Self::new(
            Urgency::Low,
            Importance::Low,
            Category::Information,
            0.30,
            "empty_body",
        )
    }

    /// Served for oversized bodies without consulting the oracle.
    #[must_use]
    pub fn oversize_body_fallback() -> Self {
        Self::new(
            Urgency::Medium,
            Importance::Medium,
            Category::Information,
            0.50,
            "oversize_body",
        )
    }

    /// Add a suggested action.
    #[must_use]
    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_actions.push(action.into());
        self
    }

    /// Mark the signal as requiring immediate handling.
    #[must_use]
    pub fn with_requires_immediate(mut self, immediate: bool) -> Self {
        self.requires_immediate = immediate;
        self
    }
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Oracle seam
//!
//! The classifier talks to the external language model through the
//! [`Oracle`] trait; providers implement it outside the core. The core
//! requires JSON-mode support for structured responses.
//!
//! Token usage on the streaming path is estimated rather than counted;
//! the estimate lives behind [`TokenEstimator`] so a real tokenizer can
//! replace the character heuristic without touching call sites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::DEFAULT_ORACLE_TIMEOUT;
use crate::error::Result;

/// Role of one message in an oracle conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleRole {
    /// Instructions and few-shot examples
    System,
    /// The signal under classification
    User,
    /// A prior oracle turn (few-shot answers)
    Assistant,
}

/// One message in an oracle conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleMessage {
    /// Speaker role
    pub role: OracleRole,
    /// Message text
    pub content: String,
}

impl OracleMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: OracleRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: OracleRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: OracleRole::Assistant,
            content: content.into(),
        }
    }
}

/// Options for one oracle call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleOptions {
    /// Request structured JSON output
    pub json_mode: bool,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Call deadline
    pub timeout: Duration,
}

impl Default for OracleOptions {
    fn default() -> Self {
        Self {
            json_mode: true,
            temperature: None,
            timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }
}

impl OracleOptions {
    /// Options for classification calls: JSON mode, low temperature.
    #[must_use]
    pub fn classification(timeout: Duration) -> Self {
        Self {
            json_mode: true,
            temperature: Some(0.1),
            timeout,
        }
    }
}

/// Token usage reported (or estimated) for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleUsage {
    /// Tokens in the prompt
    pub input_tokens: u32,
    /// Tokens in the completion
    pub output_tokens: u32,
}

impl OracleUsage {
    /// Total tokens across prompt and completion.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Why the oracle stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response
    #[default]
    Stop,
    /// Output token limit reached
    Length,
    /// Provider filtered the content
    ContentFilter,
    /// Anything the provider reports that the core does not model
    Other,
}

/// Response from one oracle call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    /// Completion text (JSON when `json_mode` was set)
    pub content: String,
    /// Reported or estimated usage
    pub usage: OracleUsage,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Wall-clock latency of the call
    pub latency: Duration,
}

/// The external language model consulted by the classifier
///
/// Implementations live outside the core (one per provider) and are
/// selected through a configured registry. They must support JSON mode.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Run one chat completion.
    async fn chat(
        &self,
        messages: &[OracleMessage],
        options: &OracleOptions,
    ) -> Result<OracleResponse>;

    /// Provider name for logs and stats.
    fn name(&self) -> &str;
}

/// Estimates token counts where the provider does not report them
pub trait TokenEstimator: Send + Sync {
    /// Estimated token count for a piece of text.
    fn estimate(&self, text: &str) -> u32;
}

/// Character-count heuristic: one token per four characters.
///
/// Imprecise by design; kept for parity with the streaming path it
/// replaces. Swap in a tokenizer-backed implementation for exact
/// counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> u32 {
        u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
    }
}

//! A scripted oracle for deterministic classification tests

use async_trait::async_trait;
use opshub::error::{Error, Result};
use opshub::oracle::{FinishReason, Oracle, OracleMessage, OracleOptions, OracleResponse, OracleUsage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the mock returns for one call
#[derive(Clone)]
enum Scripted {
    /// Return this content
    Content(String),
    /// Fail with an oracle error
    Fail(String),
}

/// A scripted [`Oracle`]: responses pop front-to-back; once the script
/// is exhausted the default response repeats. Calls are counted and the
/// last conversation is recorded for assertions.
pub struct MockOracle {
    script: Mutex<Vec<Scripted>>,
    default_content: String,
    delay: Mutex<Duration>,
    calls: AtomicU64,
    last_messages: Mutex<Vec<OracleMessage>>,
}

impl MockOracle {
    /// An oracle whose default response is the given JSON content.
    pub fn returning(content: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Vec::new()),
            default_content: content.into(),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
            last_messages: Mutex::new(Vec::new()),
        })
    }

    /// An oracle that classifies everything as a critical incident.
    pub fn incident() -> Arc<Self> {
        Self::returning(classification_json(
            "critical", "high", "incident", 0.95, "production outage",
        ))
    }

    /// An oracle that classifies everything as spam.
    pub fn spam() -> Arc<Self> {
        Self::returning(classification_json(
            "low", "low", "spam", 0.95, "unsolicited bulk mail",
        ))
    }

    /// An oracle that classifies everything as a routine request.
    pub fn request(confidence: f64) -> Arc<Self> {
        Self::returning(classification_json(
            "medium",
            "medium",
            "request",
            confidence,
            "routine request",
        ))
    }

    /// Queue a scripted response served before the default.
    pub fn push_response(&self, content: impl Into<String>) {
        self.script.lock().push(Scripted::Content(content.into()));
    }

    /// Queue a scripted failure served before the default.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.script.lock().push(Scripted::Fail(message.into()));
    }

    /// Delay every call (for cancellation and singleflight tests).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of chat calls made.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent call.
    pub fn last_messages(&self) -> Vec<OracleMessage> {
        self.last_messages.lock().clone()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn chat(
        &self,
        messages: &[OracleMessage],
        _options: &OracleOptions,
    ) -> Result<OracleResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock() = messages.to_vec();

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut script = self.script.lock();
            if script.is_empty() {
                Scripted::Content(self.default_content.clone())
            } else {
                script.remove(0)
            }
        };

        match next {
            Scripted::Content(content) => Ok(OracleResponse {
                content,
                usage: OracleUsage {
                    input_tokens: 100,
                    output_tokens: 40,
                },
                finish_reason: FinishReason::Stop,
                latency: Duration::from_millis(1),
            }),
            Scripted::Fail(message) => Err(Error::Oracle(message)),
        }
    }

    fn name(&self) -> &str {
        "mock-oracle"
    }
}

/// Classification JSON in the oracle wire format.
pub fn classification_json(
    urgency: &str,
    importance: &str,
    category: &str,
    confidence: f64,
    reasoning: &str,
) -> String {
    serde_json::json!({
        "urgency": urgency,
        "importance": importance,
        "category": category,
        "confidence": confidence,
        "reasoning": reasoning,
        "suggested_actions": [],
        "requires_immediate": urgency == "critical",
    })
    .to_string()
}

//! LLM client contract
//!
//! The provider wire format is out of scope; the core depends only on
//! this narrow trait. Streaming is modeled as a pair of channels, both
//! closed by the producer when finished; consumers are required to drain
//! both.

use crate::error::{NerdError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiver pair for a streaming completion: content chunks and errors.
/// The producer closes both channels when the stream ends.
pub type StreamingReceivers = (mpsc::Receiver<String>, mpsc::Receiver<NerdError>);

/// The outbound LLM interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One-shot completion
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Completion with a system prompt
    async fn complete_with_system(&self, system: &str, user: &str) -> Result<String>;

    /// Streaming completion. `None` when the client does not stream.
    async fn complete_with_streaming(
        &self,
        _system: &str,
        _user: &str,
        _thinking: bool,
    ) -> Option<StreamingReceivers> {
        None
    }

    /// Ask the client to bypass any internal throttling; scheduling is
    /// the core's job.
    fn disable_semaphore(&self) {}

    /// Tracing hook: subsequent calls belong to this shard
    fn set_shard_context(&self, _shard_id: &str) {}

    /// Tracing hook: clear the shard attribution
    fn clear_shard_context(&self) {}
}

/// A deterministic in-process client for tests and dry runs: returns a
/// fixed response after an optional delay and counts calls.
pub struct StaticLlmClient {
    response: String,
    delay: Duration,
    calls: AtomicU64,
    fail_with: Option<String>,
}

impl StaticLlmClient {
    /// Client that answers every prompt with `response`
    pub fn new(response: impl Into<String>) -> Self {
        StaticLlmClient {
            response: response.into(),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
            fail_with: None,
        }
    }

    /// Add a simulated latency per call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every call fail with this message
    pub fn failing(message: impl Into<String>) -> Self {
        StaticLlmClient {
            response: String::new(),
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
            fail_with: Some(message.into()),
        }
    }

    /// How many completions have been requested
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.fail_with {
            Some(message) => Err(NerdError::Llm(message.clone())),
            None => Ok(self.response.clone()),
        }
    }
}

#[async_trait]
impl LlmClient for StaticLlmClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.respond().await
    }

    async fn complete_with_system(&self, _system: &str, _user: &str) -> Result<String> {
        self.respond().await
    }

    async fn complete_with_streaming(
        &self,
        _system: &str,
        _user: &str,
        _thinking: bool,
    ) -> Option<StreamingReceivers> {
        let (content_tx, content_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(1);
        let outcome = self.respond().await;
        tokio::spawn(async move {
            match outcome {
                Ok(text) => {
                    for chunk in text.split_inclusive(' ') {
                        if content_tx.send(chunk.to_string()).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = error_tx.send(e).await;
                }
            }
            // both channels close when the task drops the senders
        });
        Some((content_rx, error_rx))
    }
}

//! Completion Client
//!
//! Wraps the text-completion capability behind a narrow prompt-in/text-out
//! trait so any inference backend can be substituted without touching the
//! validator. The production client talks to a llama.cpp server over HTTP
//! and serializes access through a bounded FIFO semaphore, because a single
//! loaded model is not safely reentrant.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Synchronous from the caller's perspective. No retries here; retry
    /// policy belongs to the orchestrator.
    async fn complete(&self, prompt: &str, max_tokens: u32, stop: &[String]) -> Result<String>;
}

pub struct LlamaServerClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
struct LlamaCompletionResponse {
    content: String,
}

impl LlamaServerClient {
    pub fn new(
        base_url: String,
        model: String,
        temperature: f32,
        request_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature,
            request_timeout,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl CompletionBackend for LlamaServerClient {
    async fn complete(&self, prompt: &str, max_tokens: u32, stop: &[String]) -> Result<String> {
        let started = Instant::now();

        // Queued FIFO behind the inference contexts. A request that cannot
        // be dispatched within the deadline fails rather than waiting
        // indefinitely.
        let permit = tokio::time::timeout(self.request_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                warn!("completion request timed out waiting for an inference slot");
                NlqError::CompletionTimeout(self.request_timeout)
            })?
            .map_err(|_| NlqError::CompletionEngineError("inference pool closed".into()))?;
        let _permit = permit;

        let remaining = self
            .request_timeout
            .checked_sub(started.elapsed())
            .ok_or(NlqError::CompletionTimeout(self.request_timeout))?;

        let body = serde_json::json!({
            "prompt": prompt,
            "n_predict": max_tokens,
            "temperature": self.temperature,
            "stop": stop,
            "model": self.model,
        });

        debug!(
            prompt_chars = prompt.len(),
            max_tokens, "dispatching completion request"
        );

        let response = self
            .http
            .post(format!("{}/completion", self.base_url))
            .timeout(remaining)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NlqError::CompletionTimeout(self.request_timeout)
                } else {
                    NlqError::CompletionEngineError(format!("completion request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(NlqError::CompletionEngineError(format!(
                "completion server returned {}",
                response.status()
            )));
        }

        let parsed: LlamaCompletionResponse = response
            .json()
            .await
            .map_err(|e| NlqError::CompletionEngineError(format!("bad completion payload: {}", e)))?;

        Ok(parsed.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records concurrency to verify FIFO admission wiring in
    /// the engine tests; kept here so other modules can reuse it.
    pub struct CountingBackend {
        pub calls: AtomicUsize,
        pub response: String,
    }

    #[async_trait]
    impl CompletionBackend for CountingBackend {
        async fn complete(&self, _prompt: &str, _max_tokens: u32, _stop: &[String]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let backend: Arc<dyn CompletionBackend> = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            response: "SELECT 1".into(),
        });
        let out = backend.complete("prompt", 64, &[]).await.unwrap();
        assert_eq!(out, "SELECT 1");
    }
}

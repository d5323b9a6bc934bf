use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::llm::types::Usage;

/// Client for an OpenAI-compatible chat-completions endpoint.
///
/// One client may serve many concurrent runs; all per-run mutable state lives
/// in the loop, the client only carries connection config and token counters.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
    /// Tracks total tokens used by this client across runs.
    pub tokens_used: Arc<AtomicU32>,
    /// Tracks prompt tokens used by this client.
    pub prompt_tokens_used: Arc<AtomicU32>,
    /// Model family accepts `reasoning_effort` and rejects a non-default
    /// sampling temperature.
    pub reason_enable: bool,
}

impl OpenAIClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let url = base_url.into();
        // openai reasoning families take effort/verbosity, not temperature
        let reason_enable = url.contains("api.openai.com");
        let inner = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: url,
            api_key: api_key.into(),
            inner,
            llm_cfg: LlmConfig::default(),
            tokens_used: Arc::new(AtomicU32::new(0)),
            prompt_tokens_used: Arc::new(AtomicU32::new(0)),
            reason_enable,
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        // Rebuild reqwest client with timeouts from cfg so the network layer
        // honors them in tests and prod.
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .read_timeout(Duration::from_millis(cfg.timeout_ms));
        // If building fails, keep the existing client to avoid panicking.
        if let Ok(c) = builder.build() {
            self.inner = c;
        }
        self.llm_cfg = cfg;
        self
    }

    /// Override the model-family detection, e.g. for gateways that front a
    /// reasoning model under a custom host.
    pub fn with_reasoning(mut self, enable: bool) -> Self {
        self.reason_enable = enable;
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(pos) = base.rfind("/v1") {
            base.truncate(pos);
            base = base.trim_end_matches('/').to_string();
        }
        format!("{base}/v1/chat/completions")
    }

    /// Get the total number of tokens used by this client
    pub fn get_tokens_used(&self) -> u32 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn get_prompt_tokens_used(&self) -> u32 {
        self.prompt_tokens_used.load(Ordering::Relaxed)
    }

    pub fn record_usage(&self, usage: &Usage) {
        self.tokens_used
            .fetch_add(usage.total_tokens, Ordering::Relaxed);
        self.prompt_tokens_used
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
    }

    pub(crate) fn backoff_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        if self.llm_cfg.respect_retry_after
            && let Some(secs) = retry_after_secs
        {
            return Duration::from_secs(secs);
        }
        let base = self.llm_cfg.retry_base_ms;
        let exp = base.saturating_mul(1u64 << (attempt as u32 - 1)).min(60_000);
        let jitter = self.llm_cfg.retry_jitter_ms as i64;
        let half = jitter / 2;
        let rnd = fastrand::i64(-half..=half).max(0) as u64;
        Duration::from_millis(exp.saturating_add(rnd))
    }
}

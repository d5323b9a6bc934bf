use serde::Deserialize;
use std::collections::HashMap;

/// Network and retry knobs for the chat-completions client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            max_retries: 30,
            retry_base_ms: 1000,
            retry_jitter_ms: 5000,
            respect_retry_after: true,
            timeout_ms: 600_000, // 10 minutes
        }
    }
}

/// Per-run limits and policy tunables. Injected by the caller; the loop never
/// reads ambient global state.
///
/// The defaults mirror the values the production system shipped with. None of
/// them are contractual; override per run as needed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RunLimits {
    /// Absolute cap on request/response iterations.
    pub max_iterations: usize,
    /// Iteration after which tool definitions are withdrawn so the model is
    /// forced to emit schema-conforming text (only when a schema is set).
    pub forced_completion_after: usize,
    /// Consecutive iterations without a valid structured output before the
    /// run is terminated as a safety measure.
    pub stagnation_cap: usize,
    /// Rolling screenshot history size. Also bounds image parts retained in
    /// the transcript.
    pub screenshot_history: usize,
    /// Consecutive identical frames before the duplicate-frame diagnostic
    /// fires.
    pub duplicate_alert_threshold: u32,
    /// Images are attached to the conversation on the first
    /// `image_attach_initial` iterations and every `image_attach_every`-th
    /// iteration after that.
    pub image_attach_initial: usize,
    pub image_attach_every: usize,
    /// Structured-output reminders start after this iteration and repeat
    /// every `reminder_every` iterations.
    pub reminder_after: usize,
    pub reminder_every: usize,
    /// Sampling temperature for model families that accept one. Reasoning
    /// families get `reasoning_effort` instead, never both.
    pub temperature: Option<f32>,
    pub reasoning_effort: String,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            forced_completion_after: 15,
            stagnation_cap: 30,
            screenshot_history: 5,
            duplicate_alert_threshold: 3,
            image_attach_initial: 3,
            image_attach_every: 3,
            reminder_after: 8,
            reminder_every: 2,
            temperature: Some(0.2),
            reasoning_effort: "high".to_string(),
        }
    }
}

impl RunLimits {
    /// Defaults overlaid with `AGENT_ENGINE_*` environment variables.
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        let vars: HashMap<String, String> = std::env::vars().collect();
        let get_usize = |key: &str| vars.get(key).and_then(|v| v.parse::<usize>().ok());
        if let Some(v) = get_usize("AGENT_ENGINE_MAX_ITERATIONS") {
            limits.max_iterations = v;
        }
        if let Some(v) = get_usize("AGENT_ENGINE_FORCED_COMPLETION_AFTER") {
            limits.forced_completion_after = v;
        }
        if let Some(v) = get_usize("AGENT_ENGINE_STAGNATION_CAP") {
            limits.stagnation_cap = v;
        }
        if let Some(v) = get_usize("AGENT_ENGINE_SCREENSHOT_HISTORY") {
            limits.screenshot_history = v;
        }
        if let Some(v) = vars
            .get("AGENT_ENGINE_TEMPERATURE")
            .and_then(|v| v.parse::<f32>().ok())
        {
            limits.temperature = Some(v);
        }
        if let Some(v) = vars.get("AGENT_ENGINE_REASONING_EFFORT") {
            limits.reasoning_effort = v.clone();
        }
        limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_shipped_values() {
        let limits = RunLimits::default();
        assert_eq!(limits.forced_completion_after, 15);
        assert_eq!(limits.stagnation_cap, 30);
        assert_eq!(limits.screenshot_history, 5);
        assert_eq!(limits.duplicate_alert_threshold, 3);
        assert!(limits.forced_completion_after <= limits.max_iterations);
    }

    #[test]
    fn llm_config_default_retries_bounded() {
        let cfg = LlmConfig::default();
        assert!(cfg.max_retries > 0);
        assert!(cfg.retry_base_ms > 0);
    }
}

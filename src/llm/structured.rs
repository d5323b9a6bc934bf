use jsonschema::{Draft, JSONSchema};
use tracing::debug;

use crate::config::RunLimits;
use crate::llm::types::ResponseFormat;

/// Reconciles free-form tool use with an optional requirement that the final
/// answer conform to a caller-supplied JSON schema.
///
/// Tracks consecutive iterations without a valid structured output
/// (stagnation) and drives the forced-completion policy: past
/// `forced_completion_after`, tool definitions are withdrawn from requests so
/// the model has no choice but to emit schema-conforming text.
pub struct StructuredOutputController {
    schema: Option<serde_json::Value>,
    schema_name: String,
    stagnation: usize,
    ever_valid: bool,
    forced_after: usize,
    stagnation_cap: usize,
    reminder_after: usize,
    reminder_every: usize,
}

impl StructuredOutputController {
    pub fn new(schema: Option<serde_json::Value>, limits: &RunLimits) -> Self {
        Self {
            schema,
            schema_name: "final_output".to_string(),
            stagnation: 0,
            ever_valid: false,
            forced_after: limits.forced_completion_after,
            stagnation_cap: limits.stagnation_cap,
            reminder_after: limits.reminder_after,
            reminder_every: limits.reminder_every.max(1),
        }
    }

    pub fn enabled(&self) -> bool {
        self.schema.is_some()
    }

    pub fn stagnation(&self) -> usize {
        self.stagnation
    }

    /// Feed one iteration's assistant text. Returns the validated value on
    /// success and resets stagnation; otherwise increments it.
    pub fn record(&mut self, text: Option<&str>) -> Option<serde_json::Value> {
        let Some(schema) = &self.schema else {
            return None;
        };
        if let Some(candidate) = text.and_then(extract_json_candidate)
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate)
        {
            match validate_against(schema, &value) {
                Ok(()) => {
                    self.stagnation = 0;
                    self.ever_valid = true;
                    return Some(value);
                }
                Err(reason) => {
                    debug!(%reason, "assistant output failed schema validation");
                }
            }
        }
        self.stagnation += 1;
        None
    }

    /// Past the forced-completion threshold, tool definitions must be left
    /// out of the request entirely: the API rejects schema-enforced output
    /// and tools in one call.
    pub fn tools_withdrawn(&self, iteration: usize) -> bool {
        self.enabled() && iteration > self.forced_after
    }

    /// Schema directive for requests made while tools are withdrawn.
    pub fn response_format(&self) -> Option<ResponseFormat> {
        self.schema
            .as_ref()
            .map(|s| ResponseFormat::json_schema(&self.schema_name, s.clone()))
    }

    /// Hard safety stop: too many consecutive iterations without a single
    /// valid structured output.
    pub fn should_stop(&self) -> bool {
        self.enabled() && !self.ever_valid && self.stagnation >= self.stagnation_cap
    }

    /// Advisory nudge, appended as a short user turn on a fixed cadence once
    /// the run is past an early threshold. Never mandatory for correctness.
    pub fn reminder(&self, iteration: usize) -> Option<String> {
        if !self.enabled() || self.ever_valid {
            return None;
        }
        if iteration <= self.reminder_after {
            return None;
        }
        if (iteration - self.reminder_after) % self.reminder_every != 0 {
            return None;
        }
        Some(
            "Reminder: once your current step is done, reply with a single JSON object \
             matching the required output schema, with no surrounding prose."
                .to_string(),
        )
    }
}

fn validate_against(schema: &serde_json::Value, value: &serde_json::Value) -> Result<(), String> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| format!("invalid schema: {e}"))?;
    if let Err(errors) = compiled.validate(value) {
        let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(msgs.join("; "));
    }
    Ok(())
}

/// Pull a JSON object out of assistant text: bare object, fenced block, or
/// the outermost brace span.
fn extract_json_candidate(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    if let Some(idx) = trimmed.find("```") {
        let rest = &trimmed[idx + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if !inner.is_empty() {
                return Some(inner.to_string());
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| trimmed[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "verdict": {"type": "string"},
                "score": {"type": "number"}
            },
            "required": ["verdict"]
        })
    }

    fn controller() -> StructuredOutputController {
        StructuredOutputController::new(Some(schema()), &RunLimits::default())
    }

    #[test]
    fn disabled_without_schema() {
        let mut c = StructuredOutputController::new(None, &RunLimits::default());
        assert!(!c.enabled());
        assert!(c.record(Some("{\"verdict\":\"ok\"}")).is_none());
        assert_eq!(c.stagnation(), 0);
        assert!(!c.should_stop());
    }

    #[test]
    fn valid_output_resets_stagnation() {
        let mut c = controller();
        assert!(c.record(Some("not json")).is_none());
        assert!(c.record(None).is_none());
        assert_eq!(c.stagnation(), 2);
        let value = c.record(Some("{\"verdict\":\"pass\",\"score\":0.9}")).unwrap();
        assert_eq!(value["verdict"], "pass");
        assert_eq!(c.stagnation(), 0);
    }

    #[test]
    fn schema_violation_counts_as_stagnation() {
        let mut c = controller();
        // parses but misses the required field
        assert!(c.record(Some("{\"score\": 1.0}")).is_none());
        assert_eq!(c.stagnation(), 1);
    }

    #[test]
    fn accepts_fenced_json() {
        let mut c = controller();
        let text = "Here is the result:\n```json\n{\"verdict\":\"pass\"}\n```\nDone.";
        assert!(c.record(Some(text)).is_some());
    }

    #[test]
    fn accepts_embedded_object() {
        let mut c = controller();
        let text = "Final answer: {\"verdict\":\"pass\"} and that is all.";
        assert!(c.record(Some(text)).is_some());
    }

    #[test]
    fn tools_withdrawn_past_threshold() {
        let limits = RunLimits {
            forced_completion_after: 15,
            ..RunLimits::default()
        };
        let c = StructuredOutputController::new(Some(schema()), &limits);
        assert!(!c.tools_withdrawn(15));
        assert!(c.tools_withdrawn(16));
        assert!(c.tools_withdrawn(17));

        let no_schema = StructuredOutputController::new(None, &limits);
        assert!(!no_schema.tools_withdrawn(16));
    }

    #[test]
    fn safety_stop_at_stagnation_cap() {
        let limits = RunLimits {
            stagnation_cap: 30,
            ..RunLimits::default()
        };
        let mut c = StructuredOutputController::new(Some(schema()), &limits);
        for _ in 0..29 {
            c.record(Some("nope"));
        }
        assert!(!c.should_stop());
        c.record(Some("still nope"));
        assert_eq!(c.stagnation(), 30);
        assert!(c.should_stop());
    }

    #[test]
    fn no_safety_stop_once_valid_output_seen() {
        let limits = RunLimits {
            stagnation_cap: 3,
            ..RunLimits::default()
        };
        let mut c = StructuredOutputController::new(Some(schema()), &limits);
        assert!(c.record(Some("{\"verdict\":\"ok\"}")).is_some());
        for _ in 0..5 {
            c.record(Some("nope"));
        }
        assert!(!c.should_stop());
    }

    #[test]
    fn reminder_cadence() {
        let limits = RunLimits {
            reminder_after: 8,
            reminder_every: 2,
            ..RunLimits::default()
        };
        let c = StructuredOutputController::new(Some(schema()), &limits);
        assert!(c.reminder(8).is_none());
        assert!(c.reminder(9).is_none());
        assert!(c.reminder(10).is_some());
        assert!(c.reminder(11).is_none());
        assert!(c.reminder(12).is_some());
    }

    #[test]
    fn response_format_carries_schema() {
        let c = controller();
        let fmt = c.response_format().unwrap();
        let v = serde_json::to_value(&fmt).unwrap();
        assert_eq!(v["type"], "json_schema");
        assert_eq!(v["json_schema"]["schema"]["required"][0], "verdict");
    }
}

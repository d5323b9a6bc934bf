use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::llm::image_transport::{ImageRef, extract_image};
use crate::llm::observer::ToolResultSummary;
use crate::llm::registry::ToolRegistry;
use crate::llm::types::{ChatMessage, ToolCall};

/// Longest locally-honored wait; anything larger is clamped.
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Outcome of one tool call. `cleaned` has image payloads replaced with a
/// placeholder; the extracted image travels separately.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub cleaned: serde_json::Value,
    pub image: Option<ImageRef>,
    pub is_error: bool,
    pub error: Option<String>,
}

impl ToolResult {
    fn success(
        call_id: String,
        tool_name: String,
        cleaned: serde_json::Value,
        image: Option<ImageRef>,
    ) -> Self {
        Self {
            call_id,
            tool_name,
            cleaned,
            image,
            is_error: false,
            error: None,
        }
    }

    fn failure(call_id: String, tool_name: String, message: String) -> Self {
        Self {
            call_id,
            tool_name,
            cleaned: json!({"ok": false, "error": message}),
            image: None,
            is_error: true,
            error: Some(message),
        }
    }

    pub fn summary(&self) -> ToolResultSummary {
        ToolResultSummary {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            is_error: self.is_error,
            error: self.error.clone(),
            had_image: self.image.is_some(),
        }
    }
}

fn effective_call_id(call: &ToolCall) -> String {
    call.id.clone().unwrap_or_else(|| {
        let id = format!("call-{}", Uuid::new_v4());
        warn!(tool = %call.function.name, %id, "model omitted tool call id; synthesized one");
        id
    })
}

/// Execute every call the model issued, in order, producing exactly one
/// result per call. Nothing here propagates an error to the caller: unknown
/// tools, malformed arguments, and handler failures all become error results
/// fed back to the model.
pub async fn dispatch_tool_calls(registry: &ToolRegistry, calls: &[ToolCall]) -> Vec<ToolResult> {
    // Decode every argument payload up front. One malformed payload poisons
    // the whole batch: no handler runs, every call gets an error response.
    let decoded: Vec<Result<serde_json::Value, String>> = calls
        .iter()
        .map(|c| {
            serde_json::from_str::<serde_json::Value>(&c.function.arguments)
                .map_err(|e| format!("invalid tool args: {e}"))
        })
        .collect();

    if decoded.iter().any(|d| d.is_err()) {
        return calls
            .iter()
            .zip(decoded)
            .map(|(call, dec)| {
                let message = dec.err().unwrap_or_else(|| {
                    "skipped: another call in this batch had malformed arguments".to_string()
                });
                warn!(tool = %call.function.name, %message, "tool call skipped");
                ToolResult::failure(effective_call_id(call), call.function.name.clone(), message)
            })
            .collect();
    }

    let mut results = Vec::with_capacity(calls.len());
    for (call, args) in calls.iter().zip(decoded.into_iter().flatten()) {
        results.push(dispatch_one(registry, call, args).await);
    }
    results
}

async fn dispatch_one(
    registry: &ToolRegistry,
    call: &ToolCall,
    args: serde_json::Value,
) -> ToolResult {
    let call_id = effective_call_id(call);
    let name = call.function.name.clone();
    debug!(target: "llm", tool = %name, %call_id, "dispatching tool call");

    if call.r#type != "function" {
        return ToolResult::failure(call_id, name, format!("unsupported tool type: {}", call.r#type));
    }

    let Some(descriptor) = registry.resolve(&name) else {
        return ToolResult::failure(call_id, name.clone(), format!("unknown tool: {name}"));
    };

    // Waiting needs no tool round-trip; honor it locally. The model cannot
    // tell the difference.
    if name == "wait" {
        let waited = local_wait(&args).await;
        return ToolResult::success(
            call_id,
            name,
            json!({"ok": true, "waited_ms": waited.as_millis() as u64}),
            None,
        );
    }

    match descriptor.handler.execute(args).await {
        Ok(raw) => {
            let (cleaned, image) = extract_image(raw);
            ToolResult::success(call_id, name, cleaned, image)
        }
        Err(e) => {
            error!(tool = %name, error = %e, "tool execution failed");
            ToolResult::failure(call_id, name, format!("tool execution failed: {e}"))
        }
    }
}

async fn local_wait(args: &serde_json::Value) -> Duration {
    let requested = args
        .get("seconds")
        .and_then(|v| v.as_f64())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .or_else(|| {
            args.get("ms")
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
        })
        .unwrap_or(Duration::from_secs(1));
    let clamped = requested.min(MAX_WAIT);
    tokio::time::sleep(clamped).await;
    clamped
}

/// Defensive post-dispatch check: every call id issued by the model must have
/// a `tool` response in the transcript, or the next model call is rejected.
/// Missing ids get an emergency error response. Returns how many were healed.
pub fn verify_tool_responses(transcript: &mut Vec<ChatMessage>, calls: &[ToolCall]) -> usize {
    let mut healed = 0;
    for call in calls {
        let Some(id) = call.id.as_deref() else {
            continue;
        };
        let answered = transcript
            .iter()
            .any(|m| m.role == "tool" && m.tool_call_id.as_deref() == Some(id));
        if !answered {
            error!(call_id = %id, tool = %call.function.name, "missing tool response; synthesizing");
            transcript.push(ChatMessage::tool(
                id,
                call.function.name.clone(),
                json!({"ok": false, "error": "internal error: tool response was lost"}).to_string(),
            ));
            healed += 1;
        }
    }
    healed
}

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::RunLimits;
use crate::llm::LlmErrorKind;
use crate::llm::client_core::OpenAIClient;
use crate::llm::image_transport::{
    ScreenshotHistory, append_tool_responses, inject_collected_images, prune_transcript_images,
    should_attach_images,
};
use crate::llm::observer::{StepObserver, StepRecord, StepSink};
use crate::llm::registry::ToolRegistry;
use crate::llm::structured::StructuredOutputController;
use crate::llm::tool_execution::dispatch::{dispatch_tool_calls, verify_tool_responses};
use crate::llm::tool_execution::requests::chat_tools_once;
use crate::llm::types::{ChatMessage, ChatRequestWithTools, Usage};

/// Caller-supplied inputs for one run. Everything the loop needs arrives
/// here; the core reads no ambient state.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    /// Convenience for single-prompt runs; appended after `messages`.
    pub prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// When set, the final answer must validate against this JSON schema.
    pub output_schema: Option<serde_json::Value>,
    pub limits: RunLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Model finished with text and no pending tool calls.
    NaturalStop,
    /// A schema was configured and a valid structured output was obtained.
    StructuredOutput,
    /// Iteration cap reached with work still pending.
    MaxIterations,
    /// Too many consecutive iterations without a valid structured output.
    StagnationCap,
    /// Provider rejected the request on content-policy grounds.
    ContentPolicy,
    /// The model call failed after exhausting retries.
    ProviderError,
}

/// Everything a run produced. Immutable once returned.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub transcript: Vec<ChatMessage>,
    pub steps: Vec<StepRecord>,
    pub final_text: String,
    pub structured: Option<serde_json::Value>,
    pub usage: Usage,
    pub stop_reason: StopReason,
    /// False when the run stopped with tool calls still pending; callers may
    /// resume by feeding `transcript` back as the next run's `messages`.
    pub is_done: bool,
}

fn policy_failure_output() -> serde_json::Value {
    json!({"status": "failed", "reason": "provider content policy rejection"})
}

/// Drive the agent to completion: BUILD_REQUEST → CALL_MODEL →
/// PROCESS_RESPONSE → DISPATCH_TOOLS → DECIDE, until a stop condition holds.
///
/// Every failure mode except caller cancellation resolves to a well-formed
/// [`ExecutionResult`]; cancellation surfaces as an error carrying
/// [`LlmErrorKind::Cancelled`].
pub async fn run_agent_loop(
    client: &OpenAIClient,
    registry: &ToolRegistry,
    request: RunRequest,
    observer: Option<Arc<dyn StepObserver>>,
    cancel: Option<CancellationToken>,
) -> Result<ExecutionResult> {
    let run_id = Uuid::new_v4();
    let limits = request.limits.clone();
    let mut controller = StructuredOutputController::new(request.output_schema.clone(), &limits);
    let mut history =
        ScreenshotHistory::new(limits.screenshot_history, limits.duplicate_alert_threshold);
    let cancel_token = cancel.unwrap_or_default();

    let mut transcript: Vec<ChatMessage> = Vec::new();
    if let Some(sys) = &request.system_prompt {
        transcript.push(ChatMessage::system(sys.clone()));
    }
    transcript.extend(request.messages.clone());
    if let Some(prompt) = &request.prompt {
        transcript.push(ChatMessage::user(prompt.clone()));
    }

    let mut steps: Vec<StepRecord> = Vec::new();
    let mut usage_total = Usage::default();
    let mut final_text = String::new();
    let mut structured_value: Option<serde_json::Value> = None;

    // One explicit check decides between streaming and single-shot observer
    // usage for the whole run.
    let stream_handle = observer
        .as_deref()
        .and_then(|o| o.streaming())
        .map(|s| s.on_start());

    let mut iteration = 0usize;
    let (stop_reason, is_done) = loop {
        iteration += 1;
        debug!(target: "llm", %run_id, iteration, "agent loop iteration");

        // BUILD_REQUEST
        prune_transcript_images(&mut transcript, limits.screenshot_history);
        let withdrawn = controller.tools_withdrawn(iteration);
        if !withdrawn && let Some(reminder) = controller.reminder(iteration) {
            transcript.push(ChatMessage::user(reminder));
        }
        let tools = (!withdrawn && !registry.is_empty()).then(|| registry.to_defs());
        let response_format = if withdrawn {
            controller.response_format()
        } else {
            None
        };
        // reasoning families reject a sampling temperature; send effort instead
        let (temperature, reasoning_effort) = if client.reason_enable {
            (None, Some(limits.reasoning_effort.clone()))
        } else {
            (limits.temperature, None)
        };
        let req = ChatRequestWithTools {
            model: request.model.clone(),
            messages: transcript.clone(),
            temperature,
            reasoning_effort,
            tools,
            tool_choice: None,
            response_format,
        };

        // CALL_MODEL
        let turn = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                warn!(%run_id, "run cancelled before model call");
                return Err(anyhow!(LlmErrorKind::Cancelled));
            }
            res = chat_tools_once(client, &req, Some(cancel_token.clone())) => res,
        };
        let turn = match turn {
            Ok(turn) => turn,
            Err(e) => match crate::llm::classify_error(None, &e) {
                LlmErrorKind::Cancelled => return Err(e),
                LlmErrorKind::ContentPolicy => {
                    warn!(%run_id, "provider content-policy rejection; terminating run");
                    if controller.enabled() {
                        structured_value = Some(policy_failure_output());
                    }
                    final_text.clear();
                    break (StopReason::ContentPolicy, true);
                }
                kind => {
                    error!(%run_id, ?kind, error = %e, "model call failed; returning partial result");
                    break (StopReason::ProviderError, false);
                }
            },
        };

        if let Some(usage) = &turn.usage {
            usage_total.add(usage);
            client.record_usage(usage);
        }

        // PROCESS_RESPONSE
        let msg = turn.message;
        transcript.push(ChatMessage::assistant(msg.content.clone(), msg.tool_calls.clone()));
        if let Some(text) = &msg.content
            && !text.is_empty()
        {
            final_text = text.clone();
        }
        let structured_now = controller.record(msg.content.as_deref());
        if let Some(value) = &structured_now {
            structured_value = Some(value.clone());
        }

        let policy_rejected = turn.finish_reason.as_deref() == Some("content_filter");
        let had_tool_calls = !msg.tool_calls.is_empty();

        // DISPATCH_TOOLS
        let mut duplicate_frame_alert = false;
        let mut tool_results = Vec::new();
        if had_tool_calls && !policy_rejected {
            let results = dispatch_tool_calls(registry, &msg.tool_calls).await;
            append_tool_responses(&mut transcript, &results);
            verify_tool_responses(&mut transcript, &msg.tool_calls);

            let mut extracted_any = false;
            for result in &results {
                if let Some(image) = &result.image {
                    extracted_any = true;
                    if history.push(image.clone()) {
                        duplicate_frame_alert = true;
                    }
                }
            }
            if extracted_any && should_attach_images(iteration, &limits) {
                inject_collected_images(&mut transcript, &history);
            }
            tool_results = results.iter().map(|r| r.summary()).collect();
        }

        // finalize the step and notify the observer before deciding
        let step = StepRecord {
            index: iteration,
            assistant_text: msg.content.clone(),
            tool_calls: msg.tool_calls.clone(),
            tool_results,
            usage: turn.usage.unwrap_or_default(),
            structured: structured_now.clone(),
            duplicate_frame_alert,
            created_at: Utc::now(),
        };
        if let Some(obs) = observer.as_deref() {
            match (obs.streaming(), &stream_handle) {
                (Some(streaming), Some(handle)) => {
                    if let Some(text) = &step.assistant_text
                        && !text.is_empty()
                    {
                        streaming.on_chunk(handle, text);
                    }
                    obs.on_step(&step, &StepSink::Stream(handle.clone()));
                }
                _ => obs.on_step(&step, &StepSink::New),
            }
        }
        steps.push(step);

        // DECIDE
        if policy_rejected {
            warn!(%run_id, "finish_reason content_filter; terminating run");
            if controller.enabled() {
                structured_value = Some(policy_failure_output());
            }
            final_text.clear();
            break (StopReason::ContentPolicy, true);
        }
        if structured_now.is_some() {
            break (StopReason::StructuredOutput, true);
        }
        if !had_tool_calls {
            break (StopReason::NaturalStop, true);
        }
        if controller.should_stop() {
            warn!(%run_id, stagnation = controller.stagnation(), "stagnation safety stop");
            break (StopReason::StagnationCap, false);
        }
        if iteration >= limits.max_iterations {
            warn!(%run_id, iteration, "max iterations reached with work pending");
            break (StopReason::MaxIterations, false);
        }
    };

    Ok(ExecutionResult {
        transcript,
        steps,
        final_text,
        structured: structured_value,
        usage: usage_total,
        stop_reason,
        is_done,
    })
}

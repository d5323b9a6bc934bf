//! Orchestration loop for tool-calling LLM agents.
//!
//! Drives a conversation against an OpenAI-compatible chat-completions API:
//! sends the transcript, executes the tools the model requests, feeds the
//! results back, and decides when the agent is done. Handles the protocol's
//! awkward corners: every tool call needs exactly one response, tool-role
//! turns cannot carry images, and tool definitions are mutually exclusive
//! with schema-enforced output.
//!
//! Each run owns its transcript, screenshot history, and counters; tools and
//! configuration are injected per run, so independent runs can execute
//! concurrently on one client.

pub mod config;
pub mod llm;
pub mod logging;

pub use config::{LlmConfig, RunLimits};
pub use llm::{
    CanonicalSchema, ChatMessage, ContentPart, ExecutionResult, ImageRef, LlmErrorKind,
    MessageContent, OpenAIClient, RunRequest, ScreenshotHistory, StepObserver, StepRecord,
    StepSink, StopReason, StreamHandle, StreamingObserver, ToolDescriptor, ToolHandler,
    ToolParameters, ToolRegistry, ToolResult, ToolResultSummary, Usage, run_agent_loop,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::llm::types::{ToolCall, Usage};

/// Summary of one executed tool call kept on the step record after the full
/// result has been fed back into the transcript and discarded.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResultSummary {
    pub call_id: String,
    pub tool_name: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub had_image: bool,
}

/// One finalized iteration. Immutable once emitted to the observer.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub assistant_text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResultSummary>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    /// Set when the duplicate-frame diagnostic tripped during this step.
    pub duplicate_frame_alert: bool,
    pub created_at: DateTime<Utc>,
}

/// Opaque handle for a streaming log entry opened by the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle(pub String);

/// Optional capability: observers that keep one progressively-updated log
/// entry per run instead of one entry per step.
pub trait StreamingObserver: Send + Sync {
    fn on_start(&self) -> StreamHandle;
    fn on_chunk(&self, handle: &StreamHandle, text: &str);
}

/// Whether a step opens a new log entry or updates the stream opened at run
/// start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSink {
    New,
    Stream(StreamHandle),
}

/// Receives each finalized step. The core never persists logs itself.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, step: &StepRecord, sink: &StepSink);

    /// Present when the observer supports progressive updates; the loop makes
    /// one explicit check and branches on it.
    fn streaming(&self) -> Option<&dyn StreamingObserver> {
        None
    }
}

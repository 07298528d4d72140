use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event emitted to the external broadcaster while a flow executes.
/// Emission is fire-and-forget: a full or closed channel never blocks or
/// fails the run.
#[derive(Debug, Clone, Serialize)]
pub struct FlowEvent {
    pub flow_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub block_id: Option<String>,
    pub kind: FlowEventKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    FlowStarted,
    FlowPaused,
    FlowStopped,
    FlowCompleted,
    BlockExecuted,
    VariableUpdated,
    ErrorOccurred,
    StateChanged,
}

impl FlowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowEventKind::FlowStarted => "flow_started",
            FlowEventKind::FlowPaused => "flow_paused",
            FlowEventKind::FlowStopped => "flow_stopped",
            FlowEventKind::FlowCompleted => "flow_completed",
            FlowEventKind::BlockExecuted => "block_executed",
            FlowEventKind::VariableUpdated => "variable_updated",
            FlowEventKind::ErrorOccurred => "error_occurred",
            FlowEventKind::StateChanged => "state_changed",
        }
    }
}

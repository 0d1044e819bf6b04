//! Progress events broadcast to transports.

use serde::Serialize;

use crate::core::{RequestId, TaskId, TaskStatus};
use crate::orchestration::aggregator::Response;

/// Events emitted by the orchestrator.
///
/// These let a transport show progress (reactions, typing indicators)
/// and deliver the final answer without polling.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A request was decomposed and registered.
    RequestAccepted {
        request_id: RequestId,
        /// Number of tasks in the request's graph.
        steps: usize,
    },
    /// A task moved through its state machine.
    TaskStatusChanged {
        request_id: RequestId,
        task_id: TaskId,
        step: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Every task of the request is terminal. Sent exactly once per request.
    RequestTerminal {
        request_id: RequestId,
        response: Response,
    },
}

impl OrchestratorEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            OrchestratorEvent::RequestAccepted { request_id, .. }
            | OrchestratorEvent::TaskStatusChanged { request_id, .. }
            | OrchestratorEvent::RequestTerminal { request_id, .. } => *request_id,
        }
    }
}

//! Workers: capability-addressed units that perform one kind of task.
//!
//! The orchestrator never looks inside a worker. It hands over an owned
//! [`TaskInvocation`] and gets back either a JSON result or a classified
//! [`WorkerFailure`] that decides whether the task is retried.

pub mod builtin;
pub mod registry;

use crate::core::{Capability, RequestId, RequesterContext, Task, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use registry::{Registration, WorkerRegistry};

/// Failure reported by a worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// Worth retrying: rate limits, flaky upstreams, dropped connections.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help: bad input, missing resource, bug.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl WorkerFailure {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerFailure::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            WorkerFailure::Transient(msg) | WorkerFailure::Permanent(msg) => msg,
        }
    }
}

/// Everything a worker needs for one attempt at a task.
///
/// An owned snapshot: workers never see the graph or other tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub step: String,
    pub capability: Capability,
    pub payload: Map<String, Value>,
    /// Results of the task's dependencies, keyed by step.
    pub inputs: Map<String, Value>,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub requester: RequesterContext,
}

impl TaskInvocation {
    /// Snapshot a task that has just been dispatched.
    pub fn from_task(task: &Task, inputs: Map<String, Value>) -> Self {
        Self {
            task_id: task.id,
            request_id: task.request_id,
            step: task.step.clone(),
            capability: task.capability.clone(),
            payload: task.payload.clone(),
            inputs,
            attempt: task.attempts,
            requester: task.requester.clone(),
        }
    }

    /// The `query` payload field, if present and a string.
    pub fn query(&self) -> Option<&str> {
        self.payload.get("query").and_then(Value::as_str)
    }
}

/// A unit that performs tasks of one capability.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Perform one attempt at a task.
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure>;

    /// Human-readable description, shown by `switchboard capabilities`.
    fn description(&self) -> &str;
}

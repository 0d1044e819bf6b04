//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work routed to workers. Each task tracks
//! its capability, payload, status history, attempts and result.

use crate::core::request::{RequestId, RequesterContext};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Names of the built-in capabilities.
pub mod capabilities {
    pub const SEARCH: &str = "search";
    pub const RETRIEVAL: &str = "retrieval";
    pub const REPORT: &str = "report";
    pub const ANALYSIS: &str = "analysis";
    pub const LLM: &str = "llm";

    /// All built-in capabilities in classification priority order.
    pub const BUILTIN: [&str; 5] = [SEARCH, RETRIEVAL, REPORT, ANALYSIS, LLM];
}

/// The category of work a task requires.
///
/// Capability names are normalized to trimmed lowercase so that
/// `"Search"` and `"search"` address the same worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl Borrow<str> for Capability {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    /// The worker reported an unrecoverable failure.
    Permanent { message: String },
    /// The worker kept failing transiently until the retry budget ran out.
    Transient { message: String },
    /// The last attempt exceeded its deadline and no retries were left.
    TimedOut { timeout_ms: u64 },
    /// No worker is registered for the task's capability.
    NoWorkerForCapability { capability: Capability },
    /// A dependency failed, so this task was never dispatched.
    UpstreamFailure { upstream: TaskId, step: String },
    /// The originating request was cancelled.
    Cancelled,
}

impl FailureReason {
    /// Root causes are failures that did not merely inherit another
    /// task's failure.
    pub fn is_root_cause(&self) -> bool {
        !matches!(
            self,
            FailureReason::UpstreamFailure { .. } | FailureReason::Cancelled
        )
    }

    /// Whether this reason may be assigned to a task that never ran.
    fn applies_without_attempt(&self) -> bool {
        matches!(
            self,
            FailureReason::UpstreamFailure { .. }
                | FailureReason::NoWorkerForCapability { .. }
                | FailureReason::Cancelled
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Permanent { message } => write!(f, "{}", message),
            FailureReason::Transient { message } => {
                write!(f, "transient failure, retry budget exhausted: {}", message)
            }
            FailureReason::TimedOut { timeout_ms } => {
                write!(f, "timed out after {}ms", timeout_ms)
            }
            FailureReason::NoWorkerForCapability { capability } => {
                write!(f, "no worker available for '{}'", capability)
            }
            FailureReason::UpstreamFailure { step, .. } => {
                write!(f, "skipped because step '{}' failed", step)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// Pending -> Ready -> Dispatched -> Succeeded
///                         |  \---> Failed
///                         \------> TimedOut
/// Failed(transient) | TimedOut -> Retrying -> Dispatched
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied.
    Pending,
    /// Dependencies succeeded; waiting for a worker slot.
    Ready,
    /// Handed to a worker.
    Dispatched,
    /// Waiting out a backoff before the next attempt.
    Retrying,
    /// Worker returned a result.
    Succeeded,
    /// Task failed.
    Failed { reason: FailureReason },
    /// The current attempt missed its deadline.
    TimedOut,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Short lowercase name without payload, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }

    /// Terminal statuses never change again.
    ///
    /// `Failed` is terminal because the retry decision is taken in the same
    /// critical section that records the failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed { .. })
    }

    /// Check the transition table.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, target) {
            (Pending, Ready) | (Ready, Dispatched) | (Retrying, Dispatched) => true,
            (Dispatched, Succeeded) | (Dispatched, TimedOut) | (Dispatched, Failed { .. }) => true,
            (Pending | Ready | Retrying, Failed { reason }) => reason.applies_without_attempt(),
            (Failed { reason: FailureReason::Transient { .. } }, Retrying) => true,
            (TimedOut, Retrying) => true,
            (TimedOut, Failed { reason }) => matches!(
                reason,
                FailureReason::TimedOut { .. } | FailureReason::Cancelled
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// One entry of a task's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// A single task in a request's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// The request this task belongs to.
    pub request_id: RequestId,
    /// Key of this task within its graph, e.g. `retrieval`.
    pub step: String,
    /// Which kind of worker must run the task.
    pub capability: Capability,
    /// Opaque arguments handed to the worker.
    pub payload: Map<String, Value>,
    /// Tasks that must succeed before this one may run.
    pub dependencies: Vec<TaskId>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Worker result once succeeded.
    pub result: Option<Value>,
    /// Number of times the task has been dispatched.
    pub attempts: u32,
    /// Per-attempt deadline override.
    pub timeout: Option<Duration>,
    /// Who asked for this work.
    pub requester: RequesterContext,
    /// Every status the task went through, oldest first.
    pub history: Vec<StatusChange>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
    /// Earliest instant of the next attempt while `Retrying`.
    #[serde(skip)]
    pub retry_at: Option<tokio::time::Instant>,
}

impl Task {
    /// Create a new pending task for a step of a request.
    pub fn new(request_id: RequestId, step: &str, capability: impl Into<Capability>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            request_id,
            step: step.to_string(),
            capability: capability.into(),
            payload: Map::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            attempts: 0,
            timeout: None,
            requester: RequesterContext::default(),
            history: vec![StatusChange {
                status: TaskStatus::Pending,
                at: now,
            }],
            created_at: now,
            updated_at: now,
            retry_at: None,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_requester(mut self, requester: RequesterContext) -> Self {
        self.requester = requester;
        self
    }

    /// Declare a dependency on another task.
    pub fn depends_on(mut self, id: TaskId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Move to `target`, enforcing the transition table.
    ///
    /// Records the change in the history and bumps `updated_at`.
    /// Entering `Dispatched` counts a new attempt.
    pub fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(&target) {
            return Err(Error::InvalidStateTransition {
                task: self.id,
                from: self.status.name().to_string(),
                to: target.name().to_string(),
            });
        }

        if target == TaskStatus::Dispatched {
            self.attempts += 1;
            self.retry_at = None;
        }

        let now = Utc::now();
        self.history.push(StatusChange {
            status: target.clone(),
            at: now,
        });
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Failure reason when the task has failed.
    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the task ever passed through the given status.
    pub fn visited(&self, status_name: &str) -> bool {
        self.history.iter().any(|c| c.status.name() == status_name)
    }
}

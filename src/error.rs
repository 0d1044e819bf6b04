use thiserror::Error;

use crate::core::{RequestId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Request already registered: {0}")]
    DuplicateRequest(RequestId),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("Malformed task graph: {0}")]
    MalformedGraph(String),

    #[error("Adding dependency from {from} to {to} would create a cycle")]
    CycleDetected { from: TaskId, to: TaskId },

    #[error("Invalid state transition for task {task} from {from} to {to}")]
    InvalidStateTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Request {0} is not terminal yet")]
    RequestNotTerminal(RequestId),

    #[error("Request {0} was cancelled")]
    RequestCancelled(RequestId),

    #[error("No worker registered for capability: {0}")]
    UnregisteredCapability(String),

    #[error("Dispatcher is not running")]
    DispatcherStopped,
}

/// Reasons a raw request cannot be turned into a task graph.
///
/// These are fatal to the request and reported to the caller immediately;
/// nothing has been registered or dispatched when one is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecompositionError {
    #[error("could not work out what you are asking for: {0}")]
    AmbiguousIntent(String),

    #[error("no worker is available for capability '{0}'")]
    UnsupportedCapability(String),

    #[error("steps depend on each other in a cycle (at step '{0}')")]
    CyclicDependency(String),

    #[error("step '{0}' is declared more than once")]
    DuplicateStep(String),

    #[error("step '{step}' depends on undeclared step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("plan is not valid: {0}")]
    InvalidPlan(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
pub mod core;
pub mod decompose;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod worker;

pub use crate::config::Config;
pub use crate::core::{
    Capability, CompositionRule, FailureReason, Request, RequestId, RequestStatus,
    RequesterContext, Task, TaskGraph, TaskId, TaskStatus,
};
pub use decompose::Decomposer;
pub use error::{DecompositionError, Error, Result};
pub use orchestration::{Orchestrator, OrchestratorEvent, Response};
pub use worker::{TaskInvocation, Worker, WorkerFailure, WorkerRegistry};

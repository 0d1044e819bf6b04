//! Core domain models for request orchestration.
//!
//! Requests, the tasks they decompose into, and the dependency graph that
//! ties a request's tasks together.

pub mod graph;
pub mod request;
pub mod task;

pub use graph::{CompositionRule, TaskGraph};
pub use request::{Request, RequestId, RequestStatus, RequesterContext};
pub use task::{capabilities, Capability, FailureReason, StatusChange, Task, TaskId, TaskStatus};

//! Orchestration of task graphs.
//!
//! The tracker owns every request's graph and enforces the task state
//! machine. The dispatcher routes ready tasks to workers, and the
//! aggregator composes the final response. [`Orchestrator`] ties them
//! together for transports.

pub mod aggregator;
pub mod coordinator;
pub mod dispatcher;
pub mod events;
pub mod retry;
pub mod tracker;

pub use aggregator::{compose, Response, StepFailure, StepResult};
pub use coordinator::Orchestrator;
pub use dispatcher::{DispatchCommand, Dispatcher, DispatcherHandle};
pub use events::OrchestratorEvent;
pub use retry::RetryPolicy;
pub use tracker::{Admission, AttemptReport, Completion, Outcome, TaskTracker};

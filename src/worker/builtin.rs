//! Built-in workers for the standard capabilities.
//!
//! These are placeholders: each reports what it would have done so the
//! whole pipeline can run end to end without external services.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::capabilities;
use crate::worker::{TaskInvocation, Worker, WorkerFailure, WorkerRegistry};

/// A worker that acknowledges the task without doing real work.
pub struct StubWorker {
    name: &'static str,
    description: &'static str,
}

impl StubWorker {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self { name, description }
    }

    pub fn search() -> Self {
        Self::new(
            "WebSearchWorker",
            "Handles web search queries and returns summarized results.",
        )
    }

    pub fn retrieval() -> Self {
        Self::new(
            "DataRetrievalWorker",
            "Retrieves data from databases, APIs or files and returns structured rows.",
        )
    }

    pub fn report() -> Self {
        Self::new(
            "ReportGenerationWorker",
            "Generates reports from provided data or queries.",
        )
    }

    pub fn analysis() -> Self {
        Self::new(
            "AnalysisDashboardWorker",
            "Analyses structured data and summarizes patterns as a dashboard.",
        )
    }
}

#[async_trait]
impl Worker for StubWorker {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        let upstream: Vec<&String> = task.inputs.keys().collect();
        Ok(json!({
            "report": format!("{} is a stub. Implement your logic here.", self.name),
            "query": task.query(),
            "inputs": upstream,
            "data": [],
        }))
    }

    fn description(&self) -> &str {
        self.description
    }
}

/// Answers directly with a language model. No model is wired in, so it
/// says so instead of failing the request.
pub struct LlmFallbackWorker;

#[async_trait]
impl Worker for LlmFallbackWorker {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        let report = match task.query().map(str::trim) {
            None | Some("") => "No input provided.",
            Some(_) => "LLM is not available.",
        };
        Ok(json!({ "report": report, "data": [] }))
    }

    fn description(&self) -> &str {
        "Answers conversational or general-purpose queries with a language model."
    }
}

/// Register a worker for every built-in capability.
pub fn register_builtins(registry: &WorkerRegistry) {
    registry.register(capabilities::SEARCH, Arc::new(StubWorker::search()));
    registry.register(capabilities::RETRIEVAL, Arc::new(StubWorker::retrieval()));
    registry.register(capabilities::REPORT, Arc::new(StubWorker::report()));
    registry.register(capabilities::ANALYSIS, Arc::new(StubWorker::analysis()));
    registry.register(capabilities::LLM, Arc::new(LlmFallbackWorker));
}

impl WorkerRegistry {
    /// A registry with every built-in capability registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }
}

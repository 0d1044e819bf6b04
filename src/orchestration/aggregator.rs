//! Composition of task results into the response for a request.
//!
//! The aggregator runs once every task of a request is terminal. A fully
//! successful graph yields the composed output of its sink tasks; any
//! failure yields the first root-cause failure plus whatever succeeded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{
    Capability, CompositionRule, FailureReason, Request, RequestId, RequestStatus, Task,
    TaskGraph, TaskId, TaskStatus,
};

/// The failure reported back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub task_id: TaskId,
    pub step: String,
    pub capability: Capability,
    pub reason: FailureReason,
}

/// Output of a task that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub capability: Capability,
    pub output: Value,
}

/// The single answer for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub status: RequestStatus,
    /// One line for the user, e.g. "1 of 2 steps completed; ...".
    pub summary: String,
    /// Composed result. Present only when every step succeeded.
    pub output: Option<Value>,
    pub failure: Option<StepFailure>,
    /// Successful steps in graph order.
    pub completed: Vec<StepResult>,
    pub total_steps: usize,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Succeeded
    }

    /// Plain text for chat-style transports.
    ///
    /// Prefers `report` fields of worker results; falls back to JSON.
    pub fn text(&self) -> String {
        match (&self.output, self.status) {
            (Some(output), RequestStatus::Succeeded) if self.total_steps == 1 => {
                report_text(output)
            }
            (Some(output), RequestStatus::Succeeded) => match output {
                Value::Object(map) if self.completed.iter().all(|r| map.contains_key(&r.step)) => {
                    map.iter()
                        .map(|(step, value)| format!("{}: {}", step, report_text(value)))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                }
                other => report_text(other),
            },
            _ => {
                let mut lines = vec![self.summary.clone()];
                for result in &self.completed {
                    lines.push(format!("{}: {}", result.step, report_text(&result.output)));
                }
                lines.join("\n")
            }
        }
    }
}

fn report_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("report").and_then(Value::as_str) {
            Some(report) => report.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Compose the response for a request whose tasks are all terminal.
///
/// `cancelled` marks requests stopped by their originator.
pub fn compose(request: &Request, graph: &TaskGraph, cancelled: bool) -> Response {
    let tasks: Vec<&Task> = graph.tasks().collect();
    let total_steps = tasks.len();

    let completed: Vec<StepResult> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .map(|t| StepResult {
            step: t.step.clone(),
            capability: t.capability.clone(),
            output: t.result.clone().unwrap_or(Value::Null),
        })
        .collect();

    let failure = first_failure(&tasks);

    let status = if cancelled {
        RequestStatus::Cancelled
    } else if completed.len() == total_steps {
        RequestStatus::Succeeded
    } else if completed.is_empty() {
        RequestStatus::Failed
    } else {
        RequestStatus::Partial
    };

    let output = if status == RequestStatus::Succeeded {
        Some(compose_output(graph))
    } else {
        None
    };

    let summary = summarize(status, completed.len(), total_steps, failure.as_ref());

    Response {
        request_id: request.id,
        status,
        summary,
        output,
        failure,
        completed,
        total_steps,
    }
}

/// First root cause in graph order, else the first inherited failure.
fn first_failure(tasks: &[&Task]) -> Option<StepFailure> {
    let failed = || tasks.iter().filter_map(|t| t.failure().map(|r| (*t, r)));
    failed()
        .find(|(_, reason)| reason.is_root_cause())
        .or_else(|| failed().next())
        .map(|(task, reason)| StepFailure {
            task_id: task.id,
            step: task.step.clone(),
            capability: task.capability.clone(),
            reason: reason.clone(),
        })
}

fn compose_output(graph: &TaskGraph) -> Value {
    fn result_of(task: &Task) -> Value {
        task.result.clone().unwrap_or(Value::Null)
    }

    let sinks = graph.sinks();

    if let [only] = sinks.as_slice() {
        return result_of(only);
    }

    match graph.composition() {
        CompositionRule::Merge => {
            let mut merged = Map::new();
            for sink in &sinks {
                merged.insert(sink.step.clone(), result_of(sink));
            }
            Value::Object(merged)
        }
        CompositionRule::Concatenate => {
            let text = sinks
                .iter()
                .map(|t| report_text(&result_of(t)))
                .collect::<Vec<_>>()
                .join("\n\n");
            Value::String(text)
        }
        CompositionRule::Last => sinks.last().map(|t| result_of(t)).unwrap_or(Value::Null),
    }
}

fn summarize(
    status: RequestStatus,
    succeeded: usize,
    total: usize,
    failure: Option<&StepFailure>,
) -> String {
    let progress = format!(
        "{} of {} step{} completed",
        succeeded,
        total,
        if total == 1 { "" } else { "s" }
    );
    match (status, failure) {
        (RequestStatus::Succeeded, _) => format!("Done: {}.", progress),
        (RequestStatus::Cancelled, _) => format!("Request cancelled; {}.", progress),
        (_, Some(f)) => format!(
            "{}; step '{}' ({}) failed: {}.",
            progress, f.step, f.capability, f.reason
        ),
        (_, None) => format!("{}.", progress),
    }
}

//! Task registry and lifecycle tracker.
//!
//! The tracker owns every in-flight request and its task graph. All status
//! transitions go through it under one lock, so two executors can never
//! apply conflicting transitions to the same task, and every transition is
//! broadcast as an [`OrchestratorEvent`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use crate::config::DEFAULT_RETAINED_RESPONSES;
use crate::core::{
    Capability, FailureReason, Request, RequestId, Task, TaskGraph, TaskId, TaskStatus,
};
use crate::error::{Error, Result};
use crate::orchestration::aggregator::{self, Response};
use crate::orchestration::events::OrchestratorEvent;
use crate::orchestration::retry::RetryPolicy;
use crate::worker::{TaskInvocation, WorkerFailure};

/// What a worker call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(Value),
    Failed(WorkerFailure),
    /// The attempt exceeded its deadline.
    TimedOut(Duration),
}

/// Result of one attempt, as reported back to the tracker.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub capability: Capability,
    pub attempt: u32,
    pub outcome: Outcome,
}

/// Answer to a dispatch request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The task is now `Dispatched`; run this invocation.
    Admitted(TaskInvocation),
    /// The capability has no free slot. The task keeps its status.
    AtCapacity,
    /// The task is not `Ready`, nor `Retrying` with its backoff elapsed.
    NotRunnable,
}

/// How a completion was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The task moved to this status.
    Recorded(TaskStatus),
    /// The result arrived for a task that no longer waits for it
    /// (cancelled or archived request). The slot was still released.
    Discarded,
}

struct RequestEntry {
    request: Request,
    /// `None` once archived.
    graph: Option<TaskGraph>,
    /// Task ids in topological order.
    order: Vec<TaskId>,
    response: Option<Response>,
    delivered: bool,
    cancelled: bool,
}

impl RequestEntry {
    fn is_terminal(&self) -> bool {
        match &self.graph {
            Some(graph) => graph.is_terminal(),
            None => true,
        }
    }

    fn graph(&self) -> Result<&TaskGraph> {
        self.graph
            .as_ref()
            .ok_or(Error::RequestNotFound(self.request.id))
    }

    fn graph_mut(&mut self) -> Result<&mut TaskGraph> {
        let id = self.request.id;
        self.graph.as_mut().ok_or(Error::RequestNotFound(id))
    }
}

#[derive(Default)]
struct TrackerState {
    requests: HashMap<RequestId, RequestEntry>,
    /// Which request each live task belongs to.
    task_index: HashMap<TaskId, RequestId>,
    /// Dispatched invocations per capability whose completion has not
    /// been recorded yet.
    in_flight: HashMap<Capability, usize>,
    /// Requests whose response has been announced, oldest first.
    delivered: VecDeque<RequestId>,
}

impl TrackerState {
    fn entry(&self, request_id: &RequestId) -> Result<&RequestEntry> {
        self.requests
            .get(request_id)
            .ok_or(Error::RequestNotFound(*request_id))
    }

    fn entry_mut(&mut self, request_id: &RequestId) -> Result<&mut RequestEntry> {
        self.requests
            .get_mut(request_id)
            .ok_or(Error::RequestNotFound(*request_id))
    }

    fn owner(&self, task_id: &TaskId) -> Result<RequestId> {
        self.task_index
            .get(task_id)
            .copied()
            .ok_or(Error::TaskNotFound(*task_id))
    }

    /// Drop a request entirely, including any graph it still holds.
    fn remove(&mut self, request_id: &RequestId) -> Option<RequestEntry> {
        let entry = self.requests.remove(request_id)?;
        for id in &entry.order {
            self.task_index.remove(id);
        }
        Some(entry)
    }

    fn release_slot(&mut self, capability: &Capability) {
        if let Some(count) = self.in_flight.get_mut(capability) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(capability);
            }
        }
    }
}

/// Registry of requests and tasks with atomic lifecycle transitions.
pub struct TaskTracker {
    state: RwLock<TrackerState>,
    events: broadcast::Sender<OrchestratorEvent>,
    retry: RetryPolicy,
    /// Delivered requests kept around for late `aggregate` calls.
    retained: usize,
}

impl TaskTracker {
    pub fn new(retry: RetryPolicy, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: RwLock::new(TrackerState::default()),
            events,
            retry,
            retained: DEFAULT_RETAINED_RESPONSES,
        }
    }

    /// Keep at most `limit` delivered requests; older ones are forgotten.
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retained = limit.max(1);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Admit a request and its whole graph, or nothing.
    ///
    /// # Errors
    /// Rejects duplicate request or task ids, empty or malformed graphs
    /// and graphs that belong to another request.
    pub async fn register(&self, request: Request, graph: TaskGraph) -> Result<()> {
        if graph.request_id() != request.id {
            return Err(Error::MalformedGraph(format!(
                "graph belongs to request {}, not {}",
                graph.request_id(),
                request.id
            )));
        }
        if graph.is_empty() {
            return Err(Error::MalformedGraph("graph has no tasks".to_string()));
        }
        graph.validate()?;
        if let Some(task) = graph.tasks().find(|t| t.status != TaskStatus::Pending) {
            return Err(Error::MalformedGraph(format!(
                "step '{}' is already {}",
                task.step,
                task.status.name()
            )));
        }
        let order = graph.topological_order()?;

        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(Error::DuplicateRequest(request.id));
        }
        if let Some(id) = order.iter().find(|id| state.task_index.contains_key(*id)) {
            return Err(Error::DuplicateTask(*id));
        }

        let request_id = request.id;
        for id in &order {
            state.task_index.insert(*id, request_id);
        }
        let steps = order.len();
        state.requests.insert(
            request_id,
            RequestEntry {
                request,
                graph: Some(graph),
                order,
                response: None,
                delivered: false,
                cancelled: false,
            },
        );
        tracing::info!(request = %request_id.short(), steps, "Request registered");
        let _ = self
            .events
            .send(OrchestratorEvent::RequestAccepted { request_id, steps });
        Ok(())
    }

    /// Move a pending task whose dependencies all succeeded to `Ready`.
    pub async fn mark_ready(&self, task_id: &TaskId) -> Result<()> {
        let mut state = self.state.write().await;
        let request_id = state.owner(task_id)?;
        let entry = state.entry_mut(&request_id)?;
        if entry.cancelled {
            return Err(Error::RequestCancelled(request_id));
        }
        let graph = entry.graph_mut()?;
        let waiting_on = graph
            .dependencies(task_id)
            .iter()
            .find(|dep| dep.status != TaskStatus::Succeeded)
            .map(|dep| dep.step.clone());
        if let Some(step) = waiting_on {
            return Err(Error::Validation(format!(
                "task {} still waits for step '{}'",
                task_id, step
            )));
        }
        let task = graph
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        apply(&self.events, task, TaskStatus::Ready)
    }

    /// Resolve every pending task of a request in one pass.
    ///
    /// Walking in topological order, a pending task with a failed
    /// dependency fails with `UpstreamFailure` and one whose dependencies
    /// all succeeded becomes `Ready`. Failures cascade within the pass.
    /// Returns whether anything changed.
    pub async fn resolve_pending(&self, request_id: &RequestId) -> Result<bool> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(request_id)?;
        if entry.cancelled || entry.graph.is_none() {
            return Ok(false);
        }
        let order = entry.order.clone();
        let graph = entry.graph_mut()?;

        let mut changed = false;
        for id in order {
            let Some(task) = graph.get_task(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let deps = graph.dependencies(&id);
            let failed = deps
                .iter()
                .find(|d| matches!(d.status, TaskStatus::Failed { .. }))
                .map(|d| (d.id, d.step.clone()));
            let all_succeeded = deps.iter().all(|d| d.status == TaskStatus::Succeeded);

            let target = match failed {
                Some((upstream, step)) => TaskStatus::Failed {
                    reason: FailureReason::UpstreamFailure { upstream, step },
                },
                None if all_succeeded => TaskStatus::Ready,
                None => continue,
            };
            if let Some(task) = graph.get_task_mut(&id) {
                apply(&self.events, task, target)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Tasks that may be dispatched now: `Ready`, or `Retrying` with the
    /// backoff elapsed. In topological order.
    pub async fn runnable(&self, request_id: &RequestId, now: Instant) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let entry = state.entry(request_id)?;
        if entry.cancelled {
            return Ok(Vec::new());
        }
        let Some(graph) = entry.graph.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(entry
            .order
            .iter()
            .filter_map(|id| graph.get_task(id))
            .filter(|t| is_due(t, now))
            .cloned()
            .collect())
    }

    /// Try to hand a task to a worker.
    ///
    /// Admission fails softly when `ceiling` invocations of the task's
    /// capability are already in flight. On admission the task becomes
    /// `Dispatched`, the attempt counter advances, and a slot is taken
    /// until [`mark_done`](Self::mark_done) records the completion.
    pub async fn mark_dispatched(&self, task_id: &TaskId, ceiling: usize) -> Result<Admission> {
        let mut state = self.state.write().await;
        let request_id = state.owner(task_id)?;
        let TrackerState {
            requests,
            in_flight,
            ..
        } = &mut *state;
        let entry = requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        if entry.cancelled {
            return Ok(Admission::NotRunnable);
        }
        let graph = entry.graph_mut()?;

        let task = graph.get_task(task_id).ok_or(Error::TaskNotFound(*task_id))?;
        if !is_due(task, Instant::now()) {
            return Ok(Admission::NotRunnable);
        }
        let capability = task.capability.clone();
        let used = in_flight.get(&capability).copied().unwrap_or(0);
        if used >= ceiling {
            tracing::trace!(
                capability = %capability,
                used,
                ceiling,
                "No free slot for task {}",
                task_id.short()
            );
            return Ok(Admission::AtCapacity);
        }

        let mut inputs = Map::new();
        for dep in graph.dependencies(task_id) {
            inputs.insert(dep.step.clone(), dep.result.clone().unwrap_or(Value::Null));
        }

        let task = graph
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        apply(&self.events, task, TaskStatus::Dispatched)?;
        *in_flight.entry(capability).or_insert(0) += 1;

        Ok(Admission::Admitted(TaskInvocation::from_task(task, inputs)))
    }

    /// Record the outcome of an attempt.
    ///
    /// The capability slot is always released. A transient failure or a
    /// timeout is retried while the budget lasts: the task passes through
    /// `Failed`/`TimedOut` into `Retrying` within this one call, so no
    /// observer sees a retryable failure at rest.
    pub async fn mark_done(&self, report: &AttemptReport) -> Result<Completion> {
        let mut state = self.state.write().await;
        state.release_slot(&report.capability);

        let TrackerState {
            requests,
            task_index,
            ..
        } = &mut *state;
        let live = task_index
            .get(&report.task_id)
            .and_then(|rid| requests.get_mut(rid))
            .and_then(|entry| entry.graph.as_mut())
            .and_then(|graph| graph.get_task_mut(&report.task_id))
            .filter(|task| {
                task.status == TaskStatus::Dispatched && task.attempts == report.attempt
            });
        let Some(task) = live else {
            tracing::debug!(
                "Discarding result of attempt {} for task {}",
                report.attempt,
                report.task_id.short()
            );
            return Ok(Completion::Discarded);
        };

        match &report.outcome {
            Outcome::Succeeded(value) => {
                task.result = Some(value.clone());
                apply(&self.events, task, TaskStatus::Succeeded)?;
            }
            Outcome::Failed(WorkerFailure::Permanent(message)) => {
                let reason = FailureReason::Permanent {
                    message: message.clone(),
                };
                apply(&self.events, task, TaskStatus::Failed { reason })?;
            }
            Outcome::Failed(WorkerFailure::Transient(message)) => {
                let reason = FailureReason::Transient {
                    message: message.clone(),
                };
                apply(&self.events, task, TaskStatus::Failed { reason })?;
                self.schedule_retry(task)?;
            }
            Outcome::TimedOut(deadline) => {
                apply(&self.events, task, TaskStatus::TimedOut)?;
                if !self.schedule_retry(task)? {
                    let reason = FailureReason::TimedOut {
                        timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    };
                    apply(&self.events, task, TaskStatus::Failed { reason })?;
                }
            }
        }
        Ok(Completion::Recorded(task.status.clone()))
    }

    fn schedule_retry(&self, task: &mut Task) -> Result<bool> {
        if !self.retry.should_retry(task.attempts) {
            tracing::debug!(
                step = %task.step,
                attempts = task.attempts,
                "Retry budget exhausted for task {}",
                task.id.short()
            );
            return Ok(false);
        }
        let delay = self.retry.backoff(task.attempts);
        apply(&self.events, task, TaskStatus::Retrying)?;
        task.retry_at = Some(Instant::now() + delay);
        tracing::debug!(
            step = %task.step,
            attempt = task.attempts,
            delay_ms = delay.as_millis() as u64,
            "Retrying task {}",
            task.id.short()
        );
        Ok(true)
    }

    /// Fail a task that never ran, e.g. for lack of a worker.
    pub async fn fail(&self, task_id: &TaskId, reason: FailureReason) -> Result<()> {
        let mut state = self.state.write().await;
        let request_id = state.owner(task_id)?;
        let entry = state.entry_mut(&request_id)?;
        if entry.cancelled {
            return Err(Error::RequestCancelled(request_id));
        }
        let task = entry
            .graph_mut()?
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound(*task_id))?;
        apply(&self.events, task, TaskStatus::Failed { reason })
    }

    /// Cancel a request: every non-terminal task fails with `Cancelled`.
    ///
    /// In-flight calls keep running; their results are discarded.
    /// Returns the number of tasks cancelled. A terminal request is left
    /// untouched.
    pub async fn cancel(&self, request_id: &RequestId) -> Result<usize> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(request_id)?;
        if entry.cancelled || entry.is_terminal() {
            return Ok(0);
        }
        entry.cancelled = true;
        let order = entry.order.clone();
        let graph = entry.graph_mut()?;

        let mut cancelled = 0;
        for id in order {
            if let Some(task) = graph.get_task_mut(&id) {
                if !task.is_finished() {
                    apply(
                        &self.events,
                        task,
                        TaskStatus::Failed {
                            reason: FailureReason::Cancelled,
                        },
                    )?;
                    cancelled += 1;
                }
            }
        }
        tracing::info!(request = %request_id.short(), cancelled, "Request cancelled");
        Ok(cancelled)
    }

    /// True iff every task of the request is terminal.
    pub async fn is_request_terminal(&self, request_id: &RequestId) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.entry(request_id)?.is_terminal())
    }

    /// The response for a terminal request, composed on first use and
    /// returned unchanged afterwards.
    pub async fn aggregate(&self, request_id: &RequestId) -> Result<Response> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(request_id)?;
        compose_once(entry)
    }

    /// Produce the response and announce it, once.
    ///
    /// Returns `Some` only on the call that emitted `RequestTerminal`.
    pub async fn finish(&self, request_id: &RequestId) -> Result<Option<Response>> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(request_id)?;
        if entry.delivered || !entry.is_terminal() {
            return Ok(None);
        }
        let response = compose_once(entry)?;
        entry.delivered = true;
        tracing::info!(
            request = %request_id.short(),
            status = %response.status,
            "Request finished"
        );
        let _ = self.events.send(OrchestratorEvent::RequestTerminal {
            request_id: *request_id,
            response: response.clone(),
        });

        state.delivered.push_back(*request_id);
        while state.delivered.len() > self.retained {
            let Some(oldest) = state.delivered.pop_front() else {
                break;
            };
            state.remove(&oldest);
            tracing::debug!(request = %oldest.short(), "Request evicted");
        }
        Ok(Some(response))
    }

    /// Drop a delivered request and its response.
    ///
    /// # Errors
    /// `RequestNotTerminal` while the response has not been announced.
    pub async fn forget(&self, request_id: &RequestId) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.entry(request_id)?.delivered {
            return Err(Error::RequestNotTerminal(*request_id));
        }
        state.delivered.retain(|id| id != request_id);
        state.remove(request_id);
        tracing::debug!(request = %request_id.short(), "Request forgotten");
        Ok(())
    }

    /// Number of requests the tracker still holds, delivered or not.
    pub async fn request_count(&self) -> usize {
        self.state.read().await.requests.len()
    }

    /// The response once it has been announced.
    pub async fn delivered_response(&self, request_id: &RequestId) -> Result<Option<Response>> {
        let state = self.state.read().await;
        let entry = state.entry(request_id)?;
        Ok(if entry.delivered {
            entry.response.clone()
        } else {
            None
        })
    }

    /// Drop the graph of a finished request, keeping its response.
    pub async fn archive(&self, request_id: &RequestId) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.entry_mut(request_id)?;
        if entry.response.is_none() {
            return Err(Error::RequestNotTerminal(*request_id));
        }
        let order = std::mem::take(&mut entry.order);
        entry.graph = None;
        for id in &order {
            state.task_index.remove(id);
        }
        tracing::debug!(request = %request_id.short(), "Request archived");
        Ok(())
    }

    /// Snapshot of a task.
    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        let state = self.state.read().await;
        let request_id = state.owner(task_id).ok()?;
        state
            .requests
            .get(&request_id)?
            .graph
            .as_ref()?
            .get_task(task_id)
            .cloned()
    }

    /// Snapshot of a request's tasks in graph order. Empty once archived.
    pub async fn tasks(&self, request_id: &RequestId) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let entry = state.entry(request_id)?;
        Ok(match &entry.graph {
            Some(graph) => graph.tasks().cloned().collect(),
            None => Vec::new(),
        })
    }

    pub async fn request(&self, request_id: &RequestId) -> Option<Request> {
        let state = self.state.read().await;
        state.requests.get(request_id).map(|e| e.request.clone())
    }

    /// Invocations of a capability currently holding a slot.
    pub async fn in_flight(&self, capability: &Capability) -> usize {
        let state = self.state.read().await;
        state.in_flight.get(capability).copied().unwrap_or(0)
    }

    /// Requests that still have work to do.
    pub async fn active_requests(&self) -> Vec<RequestId> {
        let state = self.state.read().await;
        let mut ids: Vec<RequestId> = state
            .requests
            .iter()
            .filter(|(_, e)| !e.delivered)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Earliest retry whose backoff ends after `after`.
    ///
    /// Retries that came due at or before `after` have already been offered
    /// a slot. If they are still waiting, their capability is full and they
    /// are picked up when an attempt completes.
    pub async fn next_retry_after(&self, after: Instant) -> Option<Instant> {
        let state = self.state.read().await;
        retrying_tasks(&state)
            .filter_map(|(_, t)| t.retry_at)
            .filter(|at| *at > after)
            .min()
    }

    /// Requests with a retry that came due in `(since, now]`.
    pub async fn due_retries(&self, since: Instant, now: Instant) -> Vec<RequestId> {
        let state = self.state.read().await;
        let mut ids: Vec<RequestId> = retrying_tasks(&state)
            .filter(|(_, t)| matches!(t.retry_at, Some(at) if at > since && at <= now))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

fn retrying_tasks(state: &TrackerState) -> impl Iterator<Item = (RequestId, &Task)> {
    state
        .requests
        .iter()
        .filter(|(_, e)| !e.cancelled)
        .filter_map(|(id, e)| e.graph.as_ref().map(|g| (*id, g)))
        .flat_map(|(id, g)| {
            g.tasks()
                .filter(|t| t.status == TaskStatus::Retrying)
                .map(move |t| (id, t))
        })
}

fn is_due(task: &Task, now: Instant) -> bool {
    match task.status {
        TaskStatus::Ready => true,
        TaskStatus::Retrying => task.retry_at.map_or(true, |at| at <= now),
        _ => false,
    }
}

fn compose_once(entry: &mut RequestEntry) -> Result<Response> {
    if let Some(response) = &entry.response {
        return Ok(response.clone());
    }
    if !entry.is_terminal() {
        return Err(Error::RequestNotTerminal(entry.request.id));
    }
    let response = aggregator::compose(&entry.request, entry.graph()?, entry.cancelled);
    entry.request.finish(response.status);
    entry.response = Some(response.clone());
    Ok(response)
}

/// Apply a transition and broadcast it. Rejected transitions are logged
/// and returned, never applied.
fn apply(
    events: &broadcast::Sender<OrchestratorEvent>,
    task: &mut Task,
    to: TaskStatus,
) -> Result<()> {
    let from = task.status.clone();
    if let Err(err) = task.transition(to.clone()) {
        tracing::warn!(step = %task.step, "{}", err);
        return Err(err);
    }
    tracing::debug!(
        step = %task.step,
        capability = %task.capability,
        "Task {} {} -> {}",
        task.id.short(),
        from.name(),
        to.name()
    );
    let _ = events.send(OrchestratorEvent::TaskStatusChanged {
        request_id: task.request_id,
        task_id: task.id,
        step: task.step.clone(),
        from,
        to,
    });
    Ok(())
}

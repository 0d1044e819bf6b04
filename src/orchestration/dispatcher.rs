//! Router and dispatcher for ready tasks.
//!
//! The dispatcher is a single scheduler loop. It admits ready tasks onto
//! workers under per-capability ceilings, runs each attempt on its own
//! tokio task with a deadline, and advances the graph every time an
//! attempt completes or a retry backoff elapses.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Capability, FailureReason, RequestId, Task};
use crate::error::{Error, Result};
use crate::orchestration::tracker::{Admission, AttemptReport, Completion, Outcome, TaskTracker};
use crate::worker::{Registration, TaskInvocation, Worker, WorkerFailure, WorkerRegistry};

/// How long the loop sleeps when no retry is pending.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Commands accepted by the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchCommand {
    /// Advance a request: promote, dispatch, finish.
    Dispatch(RequestId),
}

/// Handle to a running dispatcher loop.
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<DispatchCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Ask the loop to advance a request.
    pub fn dispatch(&self, request_id: RequestId) -> Result<()> {
        self.commands
            .send(DispatchCommand::Dispatch(request_id))
            .map_err(|_| Error::DispatcherStopped)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed() && !self.task.is_finished()
    }

    /// Stop the loop. In-flight worker calls are aborted.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            tracing::warn!("Dispatcher loop ended abnormally: {}", err);
        }
    }
}

/// Scheduler that routes tasks to workers.
pub struct Dispatcher {
    tracker: Arc<TaskTracker>,
    registry: Arc<WorkerRegistry>,
    config: Arc<Config>,
    /// Attempts currently running.
    running: JoinSet<AttemptReport>,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<TaskTracker>,
        registry: Arc<WorkerRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            tracker,
            registry,
            config,
            running: JoinSet::new(),
        }
    }

    /// Start the scheduler loop on the current runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(command_rx, cancel.clone()));
        DispatcherHandle {
            commands,
            cancel,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
        cancel: CancellationToken,
    ) {
        tracing::debug!("Dispatcher started");
        // Retries due at or before this instant have been offered a slot.
        let mut swept = Instant::now();
        loop {
            let next_retry = self.tracker.next_retry_after(swept).await;
            let wake = next_retry.unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Dispatcher cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(DispatchCommand::Dispatch(request_id)) => {
                        self.advance(&request_id).await;
                    }
                    None => {
                        tracing::debug!("Dispatcher: command channel closed");
                        break;
                    }
                },
                Some(joined) = self.running.join_next() => {
                    self.on_completion(joined).await;
                }
                _ = tokio::time::sleep_until(wake), if next_retry.is_some() => {
                    let now = Instant::now();
                    for request_id in self.tracker.due_retries(swept, now).await {
                        self.advance(&request_id).await;
                    }
                    swept = now;
                }
            }
        }
        self.running.abort_all();
    }

    async fn advance(&mut self, request_id: &RequestId) {
        if let Err(err) = self.dispatch_ready(request_id).await {
            tracing::error!(request = %request_id.short(), "Dispatch failed: {}", err);
        }
    }

    /// Advance one request as far as it can go right now.
    ///
    /// Resolves pending tasks, fails tasks nobody can run, admits what the
    /// capability ceilings allow, and announces the response once the
    /// request is terminal. Returns how many attempts were started.
    pub async fn dispatch_ready(&mut self, request_id: &RequestId) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let mut changed = self.tracker.resolve_pending(request_id).await?;

            for task in self.tracker.runnable(request_id, Instant::now()).await? {
                let Some(registration) = self.registry.get(task.capability.as_str()) else {
                    tracing::warn!(
                        capability = %task.capability,
                        "No worker for step '{}'",
                        task.step
                    );
                    let reason = FailureReason::NoWorkerForCapability {
                        capability: task.capability.clone(),
                    };
                    match self.tracker.fail(&task.id, reason).await {
                        Ok(()) => changed = true,
                        Err(Error::RequestCancelled(_)) => break,
                        Err(err) => return Err(err),
                    }
                    continue;
                };

                let ceiling = self.ceiling(&task.capability, &registration);
                match self.tracker.mark_dispatched(&task.id, ceiling).await? {
                    Admission::Admitted(invocation) => {
                        let deadline = self.deadline(&task, &registration);
                        self.launch(registration.worker, invocation, deadline);
                        dispatched += 1;
                    }
                    Admission::AtCapacity | Admission::NotRunnable => {}
                }
            }

            if !changed {
                break;
            }
        }

        if let Some(response) = self.tracker.finish(request_id).await? {
            tracing::debug!(
                request = %request_id.short(),
                "Response ready: {}",
                response.summary
            );
            if self.config.archive_terminal {
                match self.tracker.archive(request_id).await {
                    // forgotten by its caller as soon as it was announced
                    Ok(()) | Err(Error::RequestNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(dispatched)
    }

    async fn on_completion(&mut self, joined: std::result::Result<AttemptReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                tracing::error!("Worker task did not complete: {}", err);
                return;
            }
        };

        match self.tracker.mark_done(&report).await {
            Ok(Completion::Recorded(status)) => {
                tracing::trace!("Task {} recorded as {}", report.task_id.short(), status);
            }
            Ok(Completion::Discarded) => {}
            Err(err) => {
                tracing::error!("Could not record completion: {}", err);
            }
        }

        // A freed slot may unblock tasks of any request.
        self.advance(&report.request_id).await;
        for request_id in self.tracker.active_requests().await {
            if request_id != report.request_id {
                self.advance(&request_id).await;
            }
        }
    }

    /// Ceiling: configuration override, then registration, then default.
    fn ceiling(&self, capability: &Capability, registration: &Registration) -> usize {
        self.config
            .concurrency_override(capability)
            .or(registration.concurrency)
            .unwrap_or(self.config.dispatch.default_concurrency)
            .max(1)
    }

    /// Deadline: the task's own, configuration override, registration,
    /// then default.
    fn deadline(&self, task: &Task, registration: &Registration) -> Duration {
        task.timeout
            .or_else(|| self.config.timeout_override(&task.capability))
            .or(registration.timeout)
            .unwrap_or_else(|| Duration::from_secs(self.config.dispatch.default_timeout_secs))
    }

    fn launch(&mut self, worker: Arc<dyn Worker>, invocation: TaskInvocation, deadline: Duration) {
        tracing::debug!(
            step = %invocation.step,
            capability = %invocation.capability,
            attempt = invocation.attempt,
            "Dispatching task {}",
            invocation.task_id.short()
        );
        self.running.spawn(async move {
            let call = AssertUnwindSafe(worker.invoke(&invocation)).catch_unwind();
            let outcome = match tokio::time::timeout(deadline, call).await {
                Ok(Ok(Ok(value))) => Outcome::Succeeded(value),
                Ok(Ok(Err(failure))) => Outcome::Failed(failure),
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(step = %invocation.step, "Worker panicked: {}", message);
                    Outcome::Failed(WorkerFailure::Permanent(format!(
                        "worker panicked: {}",
                        message
                    )))
                }
                Err(_) => Outcome::TimedOut(deadline),
            };
            AttemptReport {
                task_id: invocation.task_id,
                request_id: invocation.request_id,
                capability: invocation.capability.clone(),
                attempt: invocation.attempt,
                outcome,
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

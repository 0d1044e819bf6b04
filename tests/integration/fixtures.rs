//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building an orchestrator around a registry of mock workers
//! - Scripted, hanging, slow and recording workers
//! - Waiting on progress events

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use switchboard::config::Config;
use switchboard::core::{RequestId, TaskStatus};
use switchboard::orchestration::{Orchestrator, OrchestratorEvent};
use switchboard::worker::{TaskInvocation, Worker, WorkerFailure, WorkerRegistry};
use switchboard::Decomposer;

/// Config with a given retry budget that keeps graphs after completion so
/// tests can inspect task history.
pub fn test_config(max_retries: u32) -> Config {
    let mut config = Config::default();
    config.retry.max_retries = max_retries;
    config.archive_terminal = false;
    config
}

/// Start an orchestrator over the built-in workers with `overrides`
/// replacing some of them.
pub fn start(config: Config, overrides: Vec<(&str, Arc<dyn Worker>)>) -> Orchestrator {
    let registry = WorkerRegistry::with_builtins();
    for (capability, worker) in overrides {
        registry.register(capability, worker);
    }
    start_with_registry(config, registry)
}

/// Share a mock as a trait object while keeping the concrete handle.
pub fn as_worker<W: Worker + 'static>(worker: &Arc<W>) -> Arc<dyn Worker> {
    worker.clone()
}

pub fn start_with_registry(config: Config, registry: WorkerRegistry) -> Orchestrator {
    let decomposer = Decomposer::from_config(&config).expect("builtin rules compile");
    Orchestrator::start(config, Arc::new(registry), decomposer).expect("orchestrator starts")
}

/// Worker that plays back a script of outcomes, then repeats the last one.
pub struct Scripted {
    script: Mutex<VecDeque<Result<Value, WorkerFailure>>>,
    last: Mutex<Result<Value, WorkerFailure>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<TaskInvocation>>,
}

impl Scripted {
    pub fn new(script: Vec<Result<Value, WorkerFailure>>) -> Arc<Self> {
        let last = script
            .last()
            .cloned()
            .unwrap_or_else(|| Ok(json!({"report": "ok"})));
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(value: Value) -> Arc<Self> {
        Self::new(vec![Ok(value)])
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::new(vec![Err(WorkerFailure::permanent(message))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<TaskInvocation> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for Scripted {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(task.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(outcome) => outcome,
            None => self.last.lock().unwrap().clone(),
        }
    }

    fn description(&self) -> &str {
        "scripted test worker"
    }
}

/// Worker that never answers.
pub struct Hanging {
    calls: AtomicUsize,
}

impl Hanging {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for Hanging {
    async fn invoke(&self, _task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn description(&self) -> &str {
        "never returns"
    }
}

/// Worker that takes a while and tracks how many calls overlap.
pub struct Slow {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Slow {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for Slow {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "report": format!("{} done", task.step) }))
    }

    fn description(&self) -> &str {
        "slow test worker"
    }
}

/// Start/end marks written by [`Recording`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Start(String),
    End(String),
}

/// Worker that logs when each step starts and ends. Steps listed in
/// `fail` fail permanently.
pub struct Recording {
    log: Mutex<Vec<Mark>>,
    fail: Vec<String>,
}

impl Recording {
    pub fn new(fail: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            fail,
        })
    }

    pub fn log(&self) -> Vec<Mark> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for Recording {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        self.log.lock().unwrap().push(Mark::Start(task.step.clone()));
        tokio::task::yield_now().await;
        self.log.lock().unwrap().push(Mark::End(task.step.clone()));
        if self.fail.contains(&task.step) {
            Err(WorkerFailure::permanent(format!("{} refused", task.step)))
        } else {
            Ok(json!({ "report": task.step }))
        }
    }

    fn description(&self) -> &str {
        "recording test worker"
    }
}

/// Wait until `step` of `request_id` enters a status with the given name.
pub async fn wait_for_status(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    request_id: RequestId,
    step: &str,
    status: &str,
) -> TaskStatus {
    loop {
        match events.recv().await.expect("event stream open") {
            OrchestratorEvent::TaskStatusChanged {
                request_id: id,
                step: s,
                to,
                ..
            } if id == request_id && s == step && to.name() == status => return to,
            _ => {}
        }
    }
}

/// A JSON plan over the given steps: `(id, capability, depends_on)`.
pub fn plan(steps: &[(&str, &str, &[&str])]) -> String {
    let steps: Vec<Value> = steps
        .iter()
        .map(|(id, capability, deps)| {
            json!({ "id": id, "capability": capability, "depends_on": deps })
        })
        .collect();
    json!({ "steps": steps }).to_string()
}

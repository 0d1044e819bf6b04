//! The orchestrator facade used by transports.
//!
//! Owns the tracker, the worker registry and the dispatcher loop, and turns
//! raw requests into responses.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::Config;
use crate::core::{Request, RequestId, RequesterContext, Task, TaskGraph, TaskId};
use crate::decompose::Decomposer;
use crate::error::{Error, Result};
use crate::orchestration::aggregator::Response;
use crate::orchestration::dispatcher::{Dispatcher, DispatcherHandle};
use crate::orchestration::events::OrchestratorEvent;
use crate::orchestration::tracker::TaskTracker;
use crate::worker::WorkerRegistry;

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<WorkerRegistry>,
    tracker: Arc<TaskTracker>,
    decomposer: Decomposer,
    dispatcher: DispatcherHandle,
}

impl Orchestrator {
    /// Validate the setup and start the dispatcher loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Fails with `UnregisteredCapability` when a decomposition rule or the
    /// fallback names a capability with no registered worker.
    pub fn start(
        config: Config,
        registry: Arc<WorkerRegistry>,
        decomposer: Decomposer,
    ) -> Result<Self> {
        config.validate()?;
        for capability in decomposer.referenced_capabilities() {
            if !registry.contains(capability.as_str()) {
                return Err(Error::UnregisteredCapability(capability.to_string()));
            }
        }

        let config = Arc::new(config);
        let tracker = Arc::new(
            TaskTracker::new(config.retry.clone(), config.dispatch.event_capacity)
                .with_retention(config.retain_responses),
        );
        let dispatcher =
            Dispatcher::new(tracker.clone(), registry.clone(), config.clone()).spawn();

        tracing::info!(
            capabilities = registry.len(),
            max_retries = config.retry.max_retries,
            "Orchestrator started"
        );
        Ok(Self {
            config,
            registry,
            tracker,
            decomposer,
            dispatcher,
        })
    }

    /// Start with the built-in rules and workers.
    pub fn with_builtins(config: Config) -> Result<Self> {
        let decomposer = Decomposer::from_config(&config)?;
        Self::start(config, Arc::new(WorkerRegistry::with_builtins()), decomposer)
    }

    /// Decompose, register and start dispatching a request.
    ///
    /// Decomposition errors are returned here and nothing is registered.
    pub async fn submit(&self, raw: &str, requester: RequesterContext) -> Result<RequestId> {
        let (request, graph) = self
            .decomposer
            .decompose(raw, requester, &self.registry)
            .map_err(|err| {
                tracing::info!("Request rejected: {}", err);
                err
            })?;
        self.submit_graph(request, graph).await
    }

    /// Register a graph built by the caller and start dispatching it.
    pub async fn submit_graph(&self, request: Request, graph: TaskGraph) -> Result<RequestId> {
        let request_id = request.id;
        self.tracker.register(request, graph).await?;
        self.dispatcher.dispatch(request_id)?;
        Ok(request_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tracker.subscribe()
    }

    /// Wait until the request's response has been announced.
    pub async fn wait_for(&self, request_id: &RequestId) -> Result<Response> {
        let mut events = self.tracker.subscribe();
        if let Some(response) = self.tracker.delivered_response(request_id).await? {
            return Ok(response);
        }
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::RequestTerminal {
                    request_id: id,
                    response,
                }) if id == *request_id => return Ok(response),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event receiver lagged");
                    if let Some(response) = self.tracker.delivered_response(request_id).await? {
                        return Ok(response);
                    }
                }
                Err(RecvError::Closed) => return Err(Error::DispatcherStopped),
            }
        }
    }

    /// Submit and wait for the response.
    pub async fn run(&self, raw: &str, requester: RequesterContext) -> Result<Response> {
        let mut events = self.tracker.subscribe();
        let request_id = self.submit(raw, requester).await?;
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::RequestTerminal {
                    request_id: id,
                    response,
                }) if id == request_id => return Ok(response),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => return self.wait_for(&request_id).await,
                Err(RecvError::Closed) => return Err(Error::DispatcherStopped),
            }
        }
    }

    /// Cancel a request. Returns how many tasks were cancelled; zero when
    /// the request had already finished.
    pub async fn cancel(&self, request_id: &RequestId) -> Result<usize> {
        let cancelled = self.tracker.cancel(request_id).await?;
        if cancelled > 0 {
            self.dispatcher.dispatch(*request_id)?;
        }
        Ok(cancelled)
    }

    pub async fn aggregate(&self, request_id: &RequestId) -> Result<Response> {
        self.tracker.aggregate(request_id).await
    }

    /// Drop a delivered request. Transports call this once they have
    /// passed the response on.
    pub async fn forget(&self, request_id: &RequestId) -> Result<()> {
        self.tracker.forget(request_id).await
    }

    pub async fn is_request_terminal(&self, request_id: &RequestId) -> Result<bool> {
        self.tracker.is_request_terminal(request_id).await
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.tracker.task(task_id).await
    }

    pub async fn tasks(&self, request_id: &RequestId) -> Result<Vec<Task>> {
        self.tracker.tasks(request_id).await
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn decomposer(&self) -> &Decomposer {
        &self.decomposer
    }

    /// Stop the dispatcher. Running worker calls are aborted.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        tracing::info!("Orchestrator stopped");
    }
}

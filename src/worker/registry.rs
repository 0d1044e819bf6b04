//! Registry mapping capabilities to workers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::core::Capability;
use crate::error::{Error, Result};
use crate::worker::Worker;

/// A worker together with its dispatch limits.
#[derive(Clone)]
pub struct Registration {
    pub worker: Arc<dyn Worker>,
    /// Maximum simultaneous invocations. `None` defers to configuration.
    pub concurrency: Option<usize>,
    /// Per-attempt deadline. `None` defers to configuration.
    pub timeout: Option<Duration>,
}

impl Registration {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            concurrency: None,
            timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("worker", &self.worker.description())
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Registry of available workers, one per capability.
///
/// Lookups go through a sharded map, so dispatch never waits on a
/// registry-wide lock while workers are registered or removed.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<Capability, Registration>,
}

impl WorkerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }

    /// Register a worker with default limits. Replaces any previous
    /// worker for the capability.
    pub fn register(&self, capability: impl Into<Capability>, worker: Arc<dyn Worker>) {
        let capability = capability.into();
        tracing::debug!(capability = %capability, "Registered worker: {}", worker.description());
        self.workers.insert(capability, Registration::new(worker));
    }

    /// Register a worker with explicit limits.
    ///
    /// # Errors
    /// Rejects a concurrency ceiling of zero or a zero timeout.
    pub fn register_with(
        &self,
        capability: impl Into<Capability>,
        registration: Registration,
    ) -> Result<()> {
        let capability = capability.into();
        if capability.as_str().is_empty() {
            return Err(Error::Validation("capability name is empty".to_string()));
        }
        if registration.concurrency == Some(0) {
            return Err(Error::Validation(format!(
                "concurrency for '{}' must be at least 1",
                capability
            )));
        }
        if registration.timeout == Some(Duration::ZERO) {
            return Err(Error::Validation(format!(
                "timeout for '{}' must be positive",
                capability
            )));
        }
        tracing::debug!(
            capability = %capability,
            concurrency = ?registration.concurrency,
            "Registered worker: {}",
            registration.worker.description()
        );
        self.workers.insert(capability, registration);
        Ok(())
    }

    /// Unregister a worker.
    pub fn unregister(&self, capability: &str) -> Option<Registration> {
        self.workers
            .remove(&Capability::new(capability))
            .map(|(_, registration)| registration)
    }

    /// Get the registration for a capability.
    pub fn get(&self, capability: &str) -> Option<Registration> {
        self.workers
            .get(&Capability::new(capability))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.workers.contains_key(&Capability::new(capability))
    }

    /// All registered capabilities, sorted.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.workers.iter().map(|e| e.key().clone()).collect();
        caps.sort();
        caps
    }

    /// Capability and description pairs, sorted by capability.
    pub fn describe(&self) -> Vec<(Capability, String)> {
        let mut entries: Vec<(Capability, String)> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), e.value().worker.description().to_string()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

//! Turning a raw request into a task graph.
//!
//! Resolution order:
//! 1. an explicit JSON plan (`{"steps": [...]}`),
//! 2. the `<capability>: <text>` prefix form,
//! 3. composite rules matching the whole request,
//! 4. clauses joined by "then", run in sequence,
//! 5. keyword classification of a single clause,
//! 6. the fallback capability.
//!
//! The decomposer has no side effects. Nothing is registered or dispatched
//! here, and every error is fatal to the request.

pub mod rules;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::core::{Capability, CompositionRule, Request, RequesterContext, Task, TaskGraph, TaskId};
use crate::error::{DecompositionError, Error, Result};
use crate::worker::WorkerRegistry;

pub use rules::{CapabilityRule, CompositeRule, RuleTable, StepTemplate};

/// One step before it becomes a task.
#[derive(Debug, Clone)]
struct PlannedStep {
    step: String,
    capability: Capability,
    payload: Map<String, Value>,
    depends_on: Vec<String>,
    timeout: Option<Duration>,
}

impl PlannedStep {
    fn new(step: String, capability: Capability, query: &str) -> Self {
        let mut payload = Map::new();
        payload.insert("query".to_string(), Value::String(query.to_string()));
        Self {
            step,
            capability,
            payload,
            depends_on: Vec::new(),
            timeout: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlanDocument {
    steps: Vec<PlanStepDocument>,
    #[serde(default)]
    composition: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanStepDocument {
    id: String,
    capability: String,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Produces task graphs from raw requests.
#[derive(Debug, Clone)]
pub struct Decomposer {
    rules: RuleTable,
    fallback: Option<Capability>,
    composition: CompositionRule,
}

impl Decomposer {
    pub fn new(
        rules: RuleTable,
        fallback: Option<Capability>,
        composition: CompositionRule,
    ) -> Self {
        Self {
            rules,
            fallback,
            composition,
        }
    }

    /// Built-in rules with the fallback and composition from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            RuleTable::builtin()?,
            config.fallback_capability(),
            config.composition,
        ))
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn fallback(&self) -> Option<&Capability> {
        self.fallback.as_ref()
    }

    /// Capabilities this decomposer may put into a graph without an
    /// explicit plan.
    pub fn referenced_capabilities(&self) -> Vec<Capability> {
        let mut caps = self.rules.referenced_capabilities();
        if let Some(fallback) = &self.fallback {
            if !caps.contains(fallback) {
                caps.push(fallback.clone());
                caps.sort();
            }
        }
        caps
    }

    /// Decompose `raw` into a request and its task graph.
    ///
    /// Every step must name a capability currently present in `registry`.
    pub fn decompose(
        &self,
        raw: &str,
        requester: RequesterContext,
        registry: &WorkerRegistry,
    ) -> std::result::Result<(Request, TaskGraph), DecompositionError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(DecompositionError::AmbiguousIntent(
                "the request is empty".to_string(),
            ));
        }

        let request = Request::new(raw, requester);

        let (steps, composition, how) = if text.starts_with('{') {
            let (steps, composition) = self.plan_steps(text)?;
            (steps, composition, "plan")
        } else if let Some((capability, rest)) = self.rules.split_prefix(text) {
            let step = PlannedStep::new(capability.to_string(), capability.clone(), rest);
            (vec![step], self.composition, "prefix")
        } else if let Some(rule) = self.rules.composite_for(text) {
            let steps = rule
                .steps
                .iter()
                .map(|template| {
                    let mut step = PlannedStep::new(
                        template.step.clone(),
                        template.capability.clone(),
                        text,
                    );
                    for (key, value) in &template.payload {
                        step.payload.insert(key.clone(), value.clone());
                    }
                    step.depends_on = template.depends_on.clone();
                    step
                })
                .collect();
            (steps, rule.composition.unwrap_or(self.composition), "composite")
        } else {
            let clauses = self.rules.clauses(text);
            if clauses.len() > 1 {
                (self.sequence_steps(&clauses)?, self.composition, "sequence")
            } else {
                let capability = self.classify_clause(text)?;
                let step = PlannedStep::new(capability.to_string(), capability, text);
                (vec![step], self.composition, "single")
            }
        };

        let graph = build_graph(&request, steps, composition, registry)?;
        tracing::debug!(
            "Decomposed request {} via {}: {} step(s), {} edge(s)",
            request.id.short(),
            how,
            graph.task_count(),
            graph.dependency_count()
        );
        Ok((request, graph))
    }

    fn plan_steps(
        &self,
        text: &str,
    ) -> std::result::Result<(Vec<PlannedStep>, CompositionRule), DecompositionError> {
        let doc: PlanDocument = serde_json::from_str(text)
            .map_err(|e| DecompositionError::InvalidPlan(e.to_string()))?;
        if doc.steps.is_empty() {
            return Err(DecompositionError::InvalidPlan(
                "plan has no steps".to_string(),
            ));
        }

        let composition = match doc.composition.as_deref() {
            Some(name) => name
                .parse::<CompositionRule>()
                .map_err(|e| DecompositionError::InvalidPlan(e.to_string()))?,
            None => self.composition,
        };
        let query = doc.query.unwrap_or_default();

        let mut steps = Vec::with_capacity(doc.steps.len());
        for entry in doc.steps {
            let id = entry.id.trim();
            if id.is_empty() {
                return Err(DecompositionError::InvalidPlan(
                    "step id must not be empty".to_string(),
                ));
            }
            if entry.timeout_ms == Some(0) {
                return Err(DecompositionError::InvalidPlan(format!(
                    "step '{}' has a zero timeout",
                    id
                )));
            }
            let capability = self
                .rules
                .resolve_alias(&entry.capability)
                .cloned()
                .unwrap_or_else(|| Capability::new(&entry.capability));

            let mut step = PlannedStep::new(id.to_string(), capability, &query);
            if let Some(payload) = entry.payload {
                step.payload.extend(payload);
            }
            step.depends_on = entry
                .depends_on
                .iter()
                .map(|d| d.trim().to_string())
                .collect();
            step.timeout = entry.timeout_ms.map(Duration::from_millis);
            steps.push(step);
        }
        Ok((steps, composition))
    }

    fn sequence_steps(
        &self,
        clauses: &[&str],
    ) -> std::result::Result<Vec<PlannedStep>, DecompositionError> {
        let mut seen: HashMap<Capability, usize> = HashMap::new();
        let mut steps: Vec<PlannedStep> = Vec::with_capacity(clauses.len());
        for clause in clauses {
            let (capability, query) = match self.rules.split_prefix(clause) {
                Some((capability, rest)) => (capability.clone(), rest),
                None => (self.classify_clause(clause)?, *clause),
            };
            let count = seen.entry(capability.clone()).or_insert(0);
            *count += 1;
            let name = if *count == 1 {
                capability.to_string()
            } else {
                format!("{}_{}", capability, count)
            };

            let mut step = PlannedStep::new(name, capability, query);
            if let Some(previous) = steps.last() {
                step.depends_on.push(previous.step.clone());
            }
            steps.push(step);
        }
        Ok(steps)
    }

    fn classify_clause(&self, clause: &str) -> std::result::Result<Capability, DecompositionError> {
        if let Some(capability) = self.rules.classify(clause) {
            return Ok(capability.clone());
        }
        self.fallback.clone().ok_or_else(|| {
            DecompositionError::AmbiguousIntent(format!(
                "no capability matches '{}'",
                clause
            ))
        })
    }
}

/// Check the planned steps and turn them into a graph.
fn build_graph(
    request: &Request,
    steps: Vec<PlannedStep>,
    composition: CompositionRule,
    registry: &WorkerRegistry,
) -> std::result::Result<TaskGraph, DecompositionError> {
    let mut declared = HashSet::new();
    for step in &steps {
        if !declared.insert(step.step.as_str()) {
            return Err(DecompositionError::DuplicateStep(step.step.clone()));
        }
    }
    for step in &steps {
        if !registry.contains(step.capability.as_str()) {
            return Err(DecompositionError::UnsupportedCapability(
                step.capability.to_string(),
            ));
        }
        for dep in &step.depends_on {
            if dep == &step.step {
                return Err(DecompositionError::CyclicDependency(step.step.clone()));
            }
            if !declared.contains(dep.as_str()) {
                return Err(DecompositionError::UnknownDependency {
                    step: step.step.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut graph = TaskGraph::new(request.id).with_composition(composition);
    let mut ids: HashMap<String, TaskId> = HashMap::with_capacity(steps.len());
    let mut edges = Vec::new();
    for planned in steps {
        let mut task = Task::new(request.id, &planned.step, planned.capability)
            .with_payload(planned.payload)
            .with_requester(request.requester.clone());
        if let Some(timeout) = planned.timeout {
            task = task.with_timeout(timeout);
        }
        ids.insert(planned.step.clone(), task.id);
        edges.push((planned.step, planned.depends_on));
        graph.add_task(task).map_err(invalid_plan)?;
    }

    let lookup = |step: &str| {
        ids.get(step)
            .copied()
            .ok_or_else(|| DecompositionError::InvalidPlan(format!("unknown step '{}'", step)))
    };
    for (step, deps) in edges {
        let to = lookup(step.as_str())?;
        for dep in deps {
            let from = lookup(dep.as_str())?;
            match graph.add_dependency(&from, &to) {
                Ok(()) => {}
                Err(Error::CycleDetected { .. }) => {
                    return Err(DecompositionError::CyclicDependency(step));
                }
                Err(e) => return Err(invalid_plan(e)),
            }
        }
    }
    Ok(graph)
}

fn invalid_plan(err: Error) -> DecompositionError {
    DecompositionError::InvalidPlan(err.to_string())
}

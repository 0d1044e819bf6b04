//! Task graph for dependency management.
//!
//! `TaskGraph` holds every task of one request as a directed acyclic graph.
//! An edge `a -> b` means `b` depends on `a`. Independent branches can run
//! in parallel; dependents wait for their predecessors.

use crate::core::request::RequestId;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the aggregator combines the results of a fully successful graph.
///
/// Only sink tasks (tasks nothing depends on) contribute; intermediate
/// results already flowed into their dependents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionRule {
    /// JSON object keyed by step.
    #[default]
    Merge,
    /// Concatenated report text, one block per sink.
    Concatenate,
    /// Result of the last sink in graph order.
    Last,
}

impl std::fmt::Display for CompositionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompositionRule::Merge => "merge",
            CompositionRule::Concatenate => "concatenate",
            CompositionRule::Last => "last",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CompositionRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "concatenate" | "concat" => Ok(Self::Concatenate),
            "last" => Ok(Self::Last),
            other => Err(Error::Validation(format!(
                "unknown composition rule: {}",
                other
            ))),
        }
    }
}

/// The task dependency graph of one request.
pub struct TaskGraph {
    request_id: RequestId,
    composition: CompositionRule,
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Step key to task.
    step_index: HashMap<String, TaskId>,
}

impl TaskGraph {
    /// Create a new empty graph for a request.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            composition: CompositionRule::default(),
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            step_index: HashMap::new(),
        }
    }

    pub fn with_composition(mut self, composition: CompositionRule) -> Self {
        self.composition = composition;
        self
    }

    /// Build a graph from tasks whose `dependencies` are already declared.
    ///
    /// # Errors
    /// Fails on duplicate tasks, references to tasks outside the list,
    /// or cyclic dependencies.
    pub fn from_tasks(request_id: RequestId, tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new(request_id);
        let mut declared = Vec::with_capacity(tasks.len());
        for task in tasks {
            declared.push((task.id, task.dependencies.clone()));
            graph.add_task(task)?;
        }
        for (id, deps) in declared {
            for dep in deps {
                graph.add_dependency(&dep, &id)?;
            }
        }
        Ok(graph)
    }

    /// Add a task to the graph.
    ///
    /// # Errors
    /// Fails if the task id or step is already present, or if the task
    /// belongs to another request.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if task.request_id != self.request_id {
            return Err(Error::MalformedGraph(format!(
                "task {} belongs to request {}, not {}",
                task.id, task.request_id, self.request_id
            )));
        }
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        if self.step_index.contains_key(&task.step) {
            return Err(Error::MalformedGraph(format!(
                "step '{}' appears twice",
                task.step
            )));
        }

        let id = task.id;
        let step = task.step.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.step_index.insert(step, id);
        Ok(index)
    }

    /// Add a dependency: `from` must succeed before `to` can start.
    ///
    /// Keeps `to.dependencies` in sync with the edges.
    ///
    /// # Errors
    /// Returns an error if either task is missing or if the edge would
    /// create a cycle. The graph is unchanged on error.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::MalformedGraph(format!("task {} not found in graph", from)))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::MalformedGraph(format!("task {} not found in graph", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::CycleDetected {
                from: *from,
                to: *to,
            });
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            if !task.dependencies.contains(from) {
                task.dependencies.push(*from);
            }
        }
        Ok(())
    }

    /// Check the structural invariants before the graph is admitted.
    ///
    /// Every declared dependency must name a task of this graph and be
    /// backed by an edge, and the graph must be acyclic.
    pub fn validate(&self) -> Result<()> {
        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            for dep in &task.dependencies {
                let dep_index = self.task_index.get(dep).ok_or_else(|| {
                    Error::MalformedGraph(format!(
                        "step '{}' depends on unknown task {}",
                        task.step, dep
                    ))
                })?;
                if self.graph.find_edge(*dep_index, index).is_none() {
                    return Err(Error::MalformedGraph(format!(
                        "step '{}' declares dependency {} without an edge",
                        task.step, dep
                    )));
                }
            }
        }
        if is_cyclic_directed(&self.graph) {
            return Err(Error::MalformedGraph("graph contains a cycle".to_string()));
        }
        Ok(())
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn composition(&self) -> CompositionRule {
        self.composition
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Look a task up by its step key.
    pub fn task_by_step(&self, step: &str) -> Option<&Task> {
        self.step_index.get(step).and_then(|id| self.get_task(id))
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks in graph order (the order they were added).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    /// Get all tasks that the given task depends on (predecessors).
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task (successors).
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Tasks nothing depends on, in graph order.
    pub fn sinks(&self) -> Vec<&Task> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|index| &self.graph[index])
            .collect()
    }

    /// Task ids in topological order (dependencies first).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle (cannot happen for
    /// graphs built through `add_dependency`).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let step = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.step.as_str())
                .unwrap_or("unknown");
            Error::MalformedGraph(format!("cycle detected at step: {}", step))
        })?;

        Ok(sorted.into_iter().map(|index| self.graph[index].id).collect())
    }

    /// True iff every task is terminal.
    pub fn is_terminal(&self) -> bool {
        self.tasks().all(|t| t.is_finished())
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("request_id", &self.request_id)
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("composition", &self.composition)
            .finish()
    }
}

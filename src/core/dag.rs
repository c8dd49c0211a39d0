//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are tasks with their live status; an edge `a -> b` means `b`
//! consumes the artifact of `a`. The DAG answers the scheduler's questions:
//! which tasks are ready, and which tasks sit downstream of a failure.

use crate::core::plan::Plan;
use crate::core::task::{Task, TaskId, TaskStatus, TaskType};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

pub struct TaskDAG {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build the DAG for a validated plan.
    ///
    /// # Errors
    /// Returns a validation error if a config does not parse or the
    /// dependencies form a cycle.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        let mut dag = Self::new();
        for spec in &plan.tasks {
            dag.add_task(Task::new(spec.task_id.clone(), spec.typed_config()?));
        }
        for spec in &plan.tasks {
            for dep in &spec.depends_on {
                dag.add_dependency(dep, &spec.task_id)?;
            }
        }
        Ok(dag)
    }

    /// Add a task. If a task with the same id exists, its index is returned.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `to` depends on `from`.
    ///
    /// # Errors
    /// Returns an error if either task is unknown or the edge closes a cycle.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Tasks that `id` depends on, in plan order.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on `id`, in plan order.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        nodes.sort();
        nodes
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n))
            .collect()
    }

    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    // ========== Scheduling Operations ==========

    /// Every quality gate in the plan has reached a terminal state.
    pub fn quality_barrier_open(&self) -> bool {
        self.graph
            .node_weights()
            .filter(|t| t.task_type == TaskType::QualityGate)
            .all(|t| t.is_finished())
    }

    /// Pending tasks whose dependencies are all completed.
    ///
    /// Calculation and synthesis tasks are additionally held back until
    /// every quality gate has been decided.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let barrier_open = self.quality_barrier_open();
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Pending {
                    return None;
                }
                if task.task_type.behind_quality_barrier() && !barrier_open {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.is_completed())
                            .unwrap_or(false)
                    });
                deps_satisfied.then_some(task)
            })
            .collect()
    }

    /// Apply a status transition to one task.
    pub fn transition(&mut self, id: &TaskId, next: TaskStatus) -> Result<()> {
        let task = self
            .get_task_mut(id)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", id)))?;
        task.transition(next)
    }

    /// Non-completed tasks reachable downstream of `id`.
    ///
    /// Traversal stops at completed tasks: their outputs already exist, so
    /// nothing beyond them is affected by the failure.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();

        while let Some(index) = queue.pop_front() {
            let mut next: Vec<NodeIndex> =
                self.graph.neighbors_directed(index, Direction::Outgoing).collect();
            next.sort();
            for n in next {
                if !seen.insert(n) {
                    continue;
                }
                let Some(task) = self.graph.node_weight(n) else {
                    continue;
                };
                if task.is_completed() {
                    continue;
                }
                found.push(task.id.clone());
                queue.push_back(n);
            }
        }
        found
    }

    /// Cancel every non-terminal task downstream of `id`.
    ///
    /// Returns the ids actually cancelled.
    pub fn cancel_dependents(&mut self, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let mut cancelled = Vec::new();
        for dep in self.transitive_dependents(id) {
            if let Some(task) = self.get_task_mut(&dep) {
                if !task.is_finished() {
                    task.cancel(reason)?;
                    cancelled.push(dep);
                }
            }
        }
        Ok(cancelled)
    }

    /// Cancel every task still pending.
    pub fn cancel_pending(&mut self, reason: &str) -> Result<Vec<TaskId>> {
        let mut cancelled = Vec::new();
        for task in self.graph.node_weights_mut() {
            if task.status == TaskStatus::Pending {
                task.cancel(reason)?;
                cancelled.push(task.id.clone());
            }
        }
        Ok(cancelled)
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    pub fn pending_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Snapshot of every task's status keyed by id.
    pub fn statuses(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.graph
            .node_weights()
            .map(|t| (t.id.clone(), t.status.clone()))
            .collect()
    }

    /// Tasks in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

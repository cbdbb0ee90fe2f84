//! Task graphs - nodes, dependencies and per-node execution status.
//!
//! Edges point from a dependency to the node that waits for it, so
//! `A → B` means B runs after A succeeds. Structure is fixed once
//! [`GraphBuilder::build`] has checked it; only node status changes after
//! that.

use orca_core::{TaskId, TaskNode};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Structural or status error on a task graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The dependencies form a cycle; `path` starts and ends on the same node.
    #[error("dependency cycle: {}", format_path(path))]
    Cycle {
        /// Nodes along the cycle
        path: Vec<TaskId>,
    },

    /// A node depends on a node that was never added.
    #[error("{node} depends on unknown node {missing}")]
    DanglingDependency {
        /// Node declaring the dependency
        node: TaskId,
        /// Missing dependency
        missing: TaskId,
    },

    /// The same task id was added twice.
    #[error("duplicate node {0}")]
    DuplicateNode(TaskId),

    /// No node with this id.
    #[error("unknown node {0}")]
    UnknownNode(TaskId),

    /// The status change is not allowed.
    #[error("cannot move {task_id} from {from} to {to}")]
    InvalidStatus {
        /// Node
        task_id: TaskId,
        /// Current status
        from: NodeStatus,
        /// Requested status
        to: NodeStatus,
    },
}

fn format_path(path: &[TaskId]) -> String {
    path.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> ")
}

/// Execution status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting to run
    Pending,
    /// Dispatched
    Running,
    /// Finished successfully
    Succeeded,
    /// Gave up
    Failed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Counts of nodes per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    /// All nodes
    pub total: usize,
    /// Pending and runnable once their dependencies succeed
    pub pending: usize,
    /// Pending behind a failed dependency; will never run
    pub blocked: usize,
    /// Dispatched
    pub running: usize,
    /// Done
    pub succeeded: usize,
    /// Given up
    pub failed: usize,
}

/// Collects nodes and edges, then validates them into a [`TaskGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl GraphBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node that runs after every node in `deps`.
    ///
    /// Dependencies must already be present.
    pub fn add_node(&mut self, node: TaskNode, deps: &[TaskId]) -> Result<&mut Self, GraphError> {
        let id = node.task_id;
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let dep_indices = deps
            .iter()
            .map(|dep| {
                self.index.get(dep).copied().ok_or(GraphError::DanglingDependency {
                    node: id,
                    missing: *dep,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
        for dep in dep_indices {
            self.graph.update_edge(dep, idx, ());
        }
        Ok(self)
    }

    /// Declare that `to` runs after `from`. Both nodes must be present.
    ///
    /// Cycles are only detected by [`GraphBuilder::build`].
    pub fn add_dependency(&mut self, from: TaskId, to: TaskId) -> Result<&mut Self, GraphError> {
        let from_idx = *self.index.get(&from).ok_or(GraphError::UnknownNode(from))?;
        let to_idx = *self.index.get(&to).ok_or(GraphError::UnknownNode(to))?;
        self.graph.update_edge(from_idx, to_idx, ());
        Ok(self)
    }

    /// Check for cycles and freeze the structure.
    pub fn build(self) -> Result<TaskGraph, GraphError> {
        if let Err(cycle) = toposort(&self.graph, None) {
            return Err(GraphError::Cycle {
                path: cycle_path(&self.graph, cycle.node_id()),
            });
        }

        let order = stable_order(&self.graph);
        let status = vec![NodeStatus::Pending; self.graph.node_count()];
        Ok(TaskGraph {
            graph: self.graph,
            index: self.index,
            order,
            status,
        })
    }
}

/// A cycle through `start`, as task ids, closed on `start`.
fn cycle_path(graph: &DiGraph<TaskNode, ()>, start: NodeIndex) -> Vec<TaskId> {
    let component: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .unwrap_or_default()
        .into_iter()
        .collect();

    // Shortest way back to `start` inside its strongly connected component.
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if !component.contains(&next) {
                continue;
            }
            if next == start {
                let mut path = vec![current];
                let mut cursor = current;
                while cursor != start {
                    match parent.get(&cursor) {
                        Some(&p) => {
                            path.push(p);
                            cursor = p;
                        }
                        None => break,
                    }
                }
                path.reverse();
                path.push(start);
                return path.into_iter().map(|i| graph[i].task_id).collect();
            }
            if !parent.contains_key(&next) {
                parent.insert(next, current);
                queue.push_back(next);
            }
        }
    }
    vec![graph[start].task_id]
}

/// Topological order that keeps insertion order among independent nodes.
fn stable_order(graph: &DiGraph<TaskNode, ()>) -> Vec<NodeIndex> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|i| indegree[i.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

/// A validated, acyclic task graph with per-node status.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
    order: Vec<NodeIndex>,
    status: Vec<NodeStatus>,
}

impl TaskGraph {
    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Whether `id` is a node of this graph.
    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Node by id.
    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.index.get(&id).map(|&i| &self.graph[i])
    }

    /// Status by id.
    pub fn status(&self, id: TaskId) -> Option<NodeStatus> {
        self.index.get(&id).map(|&i| self.status[i.index()])
    }

    /// Node ids, dependencies before dependents.
    pub fn topological_order(&self) -> Vec<TaskId> {
        self.order.iter().map(|&i| self.graph[i].task_id).collect()
    }

    /// Pending nodes whose dependencies have all succeeded, in topological
    /// order.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        self.order
            .iter()
            .filter(|&&i| self.status[i.index()] == NodeStatus::Pending)
            .filter(|&&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .all(|dep| self.status[dep.index()] == NodeStatus::Succeeded)
            })
            .map(|&i| &self.graph[i])
            .collect()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents(&self, id: TaskId) -> Result<Vec<TaskId>, GraphError> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Pending → Running.
    pub fn mark_running(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.set_status(id, NodeStatus::Running, &[NodeStatus::Pending])
    }

    /// Running → Succeeded.
    pub fn mark_succeeded(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.set_status(id, NodeStatus::Succeeded, &[NodeStatus::Running])
    }

    /// Pending or Running → Failed.
    pub fn mark_failed(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.set_status(id, NodeStatus::Failed, &[NodeStatus::Pending, NodeStatus::Running])
    }

    /// Running or Failed → Pending, so the node runs again.
    pub fn reset(&mut self, id: TaskId) -> Result<(), GraphError> {
        self.set_status(id, NodeStatus::Pending, &[NodeStatus::Running, NodeStatus::Failed])
    }

    /// Nothing left that could still run.
    ///
    /// True once every node has succeeded or failed, or the only pending
    /// nodes sit behind a failure.
    pub fn is_finished(&self) -> bool {
        let summary = self.summary();
        summary.pending == 0 && summary.running == 0
    }

    /// Counts per status.
    pub fn summary(&self) -> GraphSummary {
        let blocked = self.blocked();
        let mut summary = GraphSummary {
            total: self.len(),
            ..GraphSummary::default()
        };
        for idx in self.graph.node_indices() {
            match self.status[idx.index()] {
                NodeStatus::Pending if blocked.contains(&idx) => summary.blocked += 1,
                NodeStatus::Pending => summary.pending += 1,
                NodeStatus::Running => summary.running += 1,
                NodeStatus::Succeeded => summary.succeeded += 1,
                NodeStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Pending nodes with a failed node somewhere upstream.
    fn blocked(&self) -> HashSet<NodeIndex> {
        let mut blocked = HashSet::new();
        for &idx in &self.order {
            let upstream_failed = self.graph.neighbors_directed(idx, Direction::Incoming).any(|dep| {
                self.status[dep.index()] == NodeStatus::Failed || blocked.contains(&dep)
            });
            if upstream_failed && self.status[idx.index()] == NodeStatus::Pending {
                blocked.insert(idx);
            }
        }
        blocked
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Result<Vec<TaskId>, GraphError> {
        let idx = *self.index.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort();
        Ok(found.into_iter().map(|i| self.graph[i].task_id).collect())
    }

    fn set_status(&mut self, id: TaskId, to: NodeStatus, allowed_from: &[NodeStatus]) -> Result<(), GraphError> {
        let idx = *self.index.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let from = self.status[idx.index()];
        if !allowed_from.contains(&from) {
            return Err(GraphError::InvalidStatus { task_id: id, from, to });
        }
        self.status[idx.index()] = to;
        Ok(())
    }
}

//! Execution layer - task graphs and the dispatch loop that drives them.

#![warn(missing_docs)]

pub mod engine;
pub mod graph;

pub use engine::{
    CycleReport, CycleResult, EngineConfig, EngineError, ExecutionEngine, RunnerError, TaskRunner,
};
pub use graph::{GraphBuilder, GraphError, GraphSummary, NodeStatus, TaskGraph};

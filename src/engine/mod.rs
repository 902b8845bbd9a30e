mod graph;
mod node;
mod runner;
mod task;

pub use crate::engine::graph::{BuildGraph, OutputFileChecker};
pub use crate::engine::node::NodeName;
pub use crate::engine::runner::{Execution, RunReport, Runner, TaskEvent};
pub use crate::engine::task::{Actions, Outcome, StepContext, Task};

/// Index of a node in a [`BuildGraph`].
pub type NodeId = petgraph::graph::NodeIndex;

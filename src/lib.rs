#![forbid(unsafe_code)]
//! Incremental build orchestration.
//!
//! A build is described as a [`BuildGraph`]: containers holding tasks and
//! other containers, with dependency edges between siblings. A [`RootGraph`]
//! fills it from a resolved [`WorkspaceDescriptor`], one container per
//! (target, environment, variant) combination, and a [`Runner`] then drives
//! one action (`build`, `clean`, ...) across it on a thread pool.
//!
//! Every task with a stable identity remembers its last run of each action in
//! a session record. On the next run a task that reports it is not required
//! replays the logs and diagnostics it stored instead of doing the work again.
//!
//! ```rust,ignore
//! let env = Arc::new(BuildEnv::new());
//! let mut registry = TargetRegistry::new();
//! registry.register("library", Library);
//!
//! let mut root = RootGraph::new(env.clone(), WorkspaceDescriptor::load("workspace.json")?, registry);
//! let mut reporter = Reporter::new();
//! root.create_targets(&mut reporter, &BuildGraphOptions::default());
//! root.build_graph(&mut reporter);
//!
//! let report = Runner::new(Arc::new(root.into_graph()), env, "build").run()?;
//! ```

mod barrier;
mod core;
mod engine;
mod error;
mod file;
mod reporter;
mod root;
mod session;
mod target;
pub mod tasks;
mod utils;

pub use crate::barrier::Barrier;
pub use crate::core::{BuildEnv, RunOptions, SessionMode};
pub use crate::engine::{
	Actions, BuildGraph, Execution, NodeId, NodeName, Outcome, OutputFileChecker, RunReport, Runner, StepContext,
	Task, TaskEvent,
};
pub use crate::error::*;
pub use crate::file::{EnsureOptions, File, FileCache, common_directory_path};
pub use crate::reporter::{Diagnostic, Reporter, Severity, Snapshot};
pub use crate::root::{RootGraph, TargetExport};
pub use crate::session::{ActionRecord, BuildSession, InMemory, JsonFile, Noop, SHARED};
pub use crate::target::{
	BuildGraphOptions, EnvironmentDescriptor, ProjectDescriptor, TargetDescriptor, TargetGraph, TargetInfo,
	TargetKind, TargetPaths, TargetRegistry, WorkspaceDescriptor,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::engine::NodeId;

pub use anyhow::Error as HookError;

/// Errors raised while wiring the build graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
	#[error("Node {0:?} can't depend on itself")]
	SelfDependency(NodeId),

	#[error("Node {0:?} has no parent graph, it can't hold dependencies")]
	Detached(NodeId),

	#[error("Node {dependency:?} is contained in another graph than {node:?}")]
	ForeignGraph { node: NodeId, dependency: NodeId },

	#[error("Adding {dependency:?} as a dependency of {node:?} would create a cycle")]
	Cycle { node: NodeId, dependency: NodeId },

	#[error("Node {0:?} is not a graph")]
	NotAGraph(NodeId),

	#[error("Node {0:?} has no target associated")]
	NoTarget(NodeId),
}

#[derive(Debug, Error)]
pub enum FileError {
	#[error("File path must be absolute, got: '{0}'")]
	Relative(Utf8PathBuf),

	#[error("Directory usage is incoherent for file: '{0}'")]
	Incoherent(Utf8PathBuf),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Couldn't access build session '{0}'.\n{1}")]
	Io(Utf8PathBuf, std::io::Error),

	#[error("Couldn't encode build session '{0}'.\n{1}")]
	Json(Utf8PathBuf, serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RunError {
	#[error("Failed to build the task pool")]
	Pool(#[from] rayon::ThreadPoolBuildError),

	#[error(transparent)]
	Template(#[from] indicatif::style::TemplateError),

	#[error("The run ended without reporting its completion")]
	Interrupted,
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
	#[error("Couldn't read workspace description '{0}'.\n{1}")]
	Io(Utf8PathBuf, std::io::Error),

	#[error("Couldn't parse workspace description '{0}'.\n{1}")]
	Parse(Utf8PathBuf, serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TsumikiError {
	#[error(transparent)]
	Graph(#[from] GraphError),

	#[error(transparent)]
	File(#[from] FileError),

	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error("Error while running the build.\n{0}")]
	Run(#[from] RunError),

	#[error(transparent)]
	Workspace(#[from] WorkspaceError),

	#[cfg(feature = "logging")]
	#[error("Couldn't install the logging subscriber.\n{0}")]
	Logging(#[from] tracing_subscriber::util::TryInitError),
}

//! Configured build units, and the resolved workspace description they are
//! created from.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{BuildGraph, NodeId, NodeName, Task};
use crate::error::{GraphError, WorkspaceError};
use crate::file::FileCache;
use crate::reporter::Reporter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
	pub name: String,
	/// Environments a dependency may be built in when this one is missing.
	#[serde(default)]
	pub compatible_environments: Vec<String>,
}

impl EnvironmentDescriptor {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			compatible_environments: Vec::new(),
		}
	}

	pub fn compatible_with(mut self, name: impl Into<String>) -> Self {
		self.compatible_environments.push(name.into());
		self
	}

	pub fn accepts(&self, name: &str) -> bool {
		self.name == name || self.compatible_environments.iter().any(|e| e == name)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub environments: Vec<EnvironmentDescriptor>,
	/// Names of the targets this one depends on.
	#[serde(default)]
	pub targets: Vec<String>,
	/// Fully resolved configuration, opaque to the engine.
	#[serde(default)]
	pub attributes: Value,
	/// Logical element path, `<project>:<name>` when absent.
	#[serde(default)]
	pub path: Option<String>,
}

impl TargetDescriptor {
	pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind: kind.into(),
			environments: Vec::new(),
			targets: Vec::new(),
			attributes: Value::Null,
			path: None,
		}
	}

	pub fn with_environment(mut self, environment: EnvironmentDescriptor) -> Self {
		self.environments.push(environment);
		self
	}

	pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
		self.targets.push(name.into());
		self
	}

	pub fn with_attributes(mut self, attributes: Value) -> Self {
		self.attributes = attributes;
		self
	}

	pub fn element_path(&self, project: &ProjectDescriptor) -> String {
		match &self.path {
			Some(path) => path.clone(),
			None => format!("{}:{}", project.path, self.name),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDescriptor {
	pub path: Utf8PathBuf,
	#[serde(default)]
	pub targets: Vec<TargetDescriptor>,
}

/// What the configuration layer hands over: every project of the workspace
/// with its targets, attributes already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
	pub directory: Utf8PathBuf,
	#[serde(default)]
	pub projects: Vec<ProjectDescriptor>,
}

impl WorkspaceDescriptor {
	pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, WorkspaceError> {
		let path = path.as_ref();
		let text = fs::read_to_string(path).map_err(|e| WorkspaceError::Io(path.to_owned(), e))?;
		serde_json::from_str(&text).map_err(|e| WorkspaceError::Parse(path.to_owned(), e))
	}
}

/// Which targets to instantiate, and where their outputs go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildGraphOptions {
	/// Target names to build, every target when absent.
	pub targets: Option<Vec<String>>,
	/// Environment names to build, every environment when absent.
	pub environments: Option<Vec<String>>,
	pub variants: Vec<String>,
	/// Output base directory, `<workspace>/out` when absent.
	pub output: Option<Utf8PathBuf>,
}

impl Default for BuildGraphOptions {
	fn default() -> Self {
		Self {
			targets: None,
			environments: None,
			variants: vec![String::from("debug")],
			output: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
	/// Final products.
	pub output: Utf8PathBuf,
	/// Everything else the build leaves behind.
	pub build: Utf8PathBuf,
	pub intermediates: Utf8PathBuf,
	/// Session records of the tasks.
	pub tasks: Utf8PathBuf,
}

impl TargetPaths {
	pub fn new(output: impl Into<Utf8PathBuf>, name: &str) -> Self {
		let output = output.into();
		let build = output.join(".build");
		Self {
			intermediates: build.join("intermediates").join(name),
			tasks: build.join("tasks"),
			build,
			output,
		}
	}
}

/// One fully configured (target, environment, variant) combination.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
	pub name: String,
	pub kind: String,
	pub environment: EnvironmentDescriptor,
	pub variant: String,
	pub project: Utf8PathBuf,
	pub element_path: String,
	pub attributes: Value,
	/// Declared dependency names, as written in the description.
	pub dependencies: Vec<String>,
	pub paths: TargetPaths,
}

impl TargetInfo {
	pub fn storage_path(&self, id: &str) -> Utf8PathBuf {
		self.paths.tasks.join(id)
	}

	/// `<project>:<name>{<variant>/<environment>}`
	pub fn logical_path(&self) -> String {
		format!("{}{{{}/{}}}", self.element_path, self.variant, self.environment.name)
	}

	pub fn attribute(&self, key: &str) -> Option<&Value> {
		self.attributes.get(key)
	}
}

/// Behaviour of one target type.
///
/// Hooks are called in order: `configure` once the dependencies are resolved,
/// `exports` right after, and `build_graph` later on, only for targets whose
/// configuration succeeded.
pub trait TargetKind: Send + Sync {
	fn configure(&self, _info: &mut TargetInfo, _reporter: &mut Reporter) -> anyhow::Result<()> {
		Ok(())
	}

	fn build_graph(&self, graph: &mut TargetGraph<'_>) -> anyhow::Result<()>;

	/// Data published to the targets depending on this one.
	fn exports(&self, _info: &TargetInfo) -> Option<Value> {
		None
	}
}

/// Target types by their `type` name.
#[derive(Default, Clone)]
pub struct TargetRegistry {
	kinds: HashMap<String, Arc<dyn TargetKind>>,
}

impl TargetRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, name: impl Into<String>, kind: impl TargetKind + 'static) -> &mut Self {
		self.kinds.insert(name.into(), Arc::new(kind));
		self
	}

	pub fn get(&self, name: &str) -> Option<&Arc<dyn TargetKind>> {
		self.kinds.get(name)
	}
}

/// The part of the build graph a target populates.
pub struct TargetGraph<'a> {
	pub(crate) graph: &'a mut BuildGraph,
	pub(crate) node: NodeId,
	pub(crate) info: Arc<TargetInfo>,
	pub(crate) files: &'a FileCache,
	pub reporter: &'a mut Reporter,
}

impl TargetGraph<'_> {
	/// The target container.
	pub fn node(&self) -> NodeId {
		self.node
	}

	pub fn info(&self) -> &TargetInfo {
		&self.info
	}

	pub fn files(&self) -> &FileCache {
		self.files
	}

	pub fn graph(&self) -> &BuildGraph {
		self.graph
	}

	pub fn add_task<T: Task>(&mut self, name: NodeName, task: T) -> Result<NodeId, GraphError> {
		self.graph.add_task(self.node, name, task)
	}

	pub fn add_task_in<T: Task>(&mut self, parent: NodeId, name: NodeName, task: T) -> Result<NodeId, GraphError> {
		self.graph.add_task(parent, name, task)
	}

	pub fn add_graph(&mut self, name: NodeName) -> Result<NodeId, GraphError> {
		self.graph.add_graph(self.node, name)
	}

	pub fn add_dependency(&mut self, node: NodeId, dependency: NodeId) -> Result<(), GraphError> {
		self.graph.add_dependency(node, dependency)
	}
}

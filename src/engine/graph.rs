use std::collections::{BTreeSet, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use serde_json::Value;

use crate::engine::node::{Container, NodeData, NodeKind};
use crate::engine::task::{ErasedTask, TaskCell};
use crate::engine::{NodeId, NodeName, Task};
use crate::error::GraphError;
use crate::target::TargetInfo;

/// The whole build graph: every container and task, nested under one root.
///
/// Edges point from a dependency to the node requiring it, and only ever
/// link two children of the same container.
pub struct BuildGraph {
	graph: petgraph::Graph<NodeData, ()>,
	root: NodeId,
}

impl Default for BuildGraph {
	fn default() -> Self {
		Self::new(NodeName::new("root", "Root"))
	}
}

impl BuildGraph {
	pub fn new(name: NodeName) -> Self {
		let mut graph = petgraph::Graph::new();
		let root = graph.add_node(NodeData::new(
			name,
			None,
			NodeKind::Graph(Container::default()),
			"RootGraph",
		));
		Self { graph, root }
	}

	pub fn root(&self) -> NodeId {
		self.root
	}

	pub fn len(&self) -> usize {
		self.graph.node_count()
	}

	pub fn is_empty(&self) -> bool {
		self.graph.node_count() == 1
	}

	fn add_node(&mut self, parent: NodeId, data: NodeData) -> Result<NodeId, GraphError> {
		if self.graph[parent].container().is_none() {
			return Err(GraphError::NotAGraph(parent));
		}

		let index = self.graph.add_node(data);
		// `parent` was checked to be a container above.
		if let Some(container) = self.graph[parent].container_mut() {
			container.children.push(index);
			container.inputs.insert(index);
			container.outputs.insert(index);
		}

		Ok(index)
	}

	/// Adds an anonymous container under `parent`.
	pub fn add_graph(&mut self, parent: NodeId, name: NodeName) -> Result<NodeId, GraphError> {
		let data = NodeData::new(name, Some(parent), NodeKind::Graph(Container::default()), "Graph");
		self.add_node(parent, data)
	}

	pub fn add_task<T: Task>(&mut self, parent: NodeId, name: NodeName, task: T) -> Result<NodeId, GraphError> {
		let kind = task.kind();
		let cell: Arc<dyn ErasedTask> = Arc::new(TaskCell::new(task));
		let data = NodeData::new(name, Some(parent), NodeKind::Task(cell), kind);
		self.add_node(parent, data)
	}

	pub(crate) fn add_target(
		&mut self,
		parent: NodeId,
		name: NodeName,
		info: Arc<TargetInfo>,
		key: Value,
	) -> Result<NodeId, GraphError> {
		let container = Container {
			target: Some(info),
			..Default::default()
		};
		let data = NodeData::new(name, Some(parent), NodeKind::Graph(container), "Target").with_unique_key(key);
		self.add_node(parent, data)
	}

	/// Makes `node` wait for `dependency`.
	///
	/// Both must be children of the same container, and the new edge must
	/// not close a cycle. Adding an existing edge again does nothing.
	pub fn add_dependency(&mut self, node: NodeId, dependency: NodeId) -> Result<(), GraphError> {
		if node == dependency {
			return Err(GraphError::SelfDependency(node));
		}

		let Some(parent) = self.graph[node].parent else {
			return Err(GraphError::Detached(node));
		};

		if self.graph[dependency].parent != Some(parent) {
			return Err(GraphError::ForeignGraph { node, dependency });
		}

		if self.graph.find_edge(dependency, node).is_some() {
			return Ok(());
		}

		if has_path_connecting(&self.graph, node, dependency, None) {
			return Err(GraphError::Cycle { node, dependency });
		}

		self.graph.add_edge(dependency, node, ());
		if let Some(container) = self.graph[parent].container_mut() {
			container.inputs.remove(&node);
			container.outputs.remove(&dependency);
		}

		Ok(())
	}

	pub fn add_dependencies(
		&mut self,
		node: NodeId,
		dependencies: impl IntoIterator<Item = NodeId>,
	) -> Result<(), GraphError> {
		for dependency in dependencies {
			self.add_dependency(node, dependency)?;
		}
		Ok(())
	}

	pub fn name(&self, node: NodeId) -> &NodeName {
		&self.graph[node].name
	}

	/// Stable identity of `node`, `None` for ephemeral nodes.
	pub fn id(&self, node: NodeId) -> Option<&str> {
		self.graph[node].id()
	}

	pub fn parent(&self, node: NodeId) -> Option<NodeId> {
		self.graph[node].parent
	}

	/// Every ancestor of `node`, closest first.
	pub fn parents(&self, node: NodeId) -> Vec<NodeId> {
		std::iter::successors(self.parent(node), |&parent| self.parent(parent)).collect()
	}

	/// Topmost ancestor of `node`, `None` for the root itself.
	pub fn root_of(&self, node: NodeId) -> Option<NodeId> {
		self.parents(node).last().copied()
	}

	pub fn is_graph(&self, node: NodeId) -> bool {
		self.graph[node].container().is_some()
	}

	/// Nodes `node` waits for.
	pub fn dependencies(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
		self.graph.neighbors_directed(node, Direction::Incoming)
	}

	/// Nodes waiting for `node`.
	pub fn required_by(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
		self.graph.neighbors_directed(node, Direction::Outgoing)
	}

	pub fn inputs(&self, node: NodeId) -> Option<&BTreeSet<NodeId>> {
		self.graph[node].container().map(|c| &c.inputs)
	}

	pub fn outputs(&self, node: NodeId) -> Option<&BTreeSet<NodeId>> {
		self.graph[node].container().map(|c| &c.outputs)
	}

	pub fn children(&self, node: NodeId) -> &[NodeId] {
		self.graph[node]
			.container()
			.map(|c| c.children.as_slice())
			.unwrap_or_default()
	}

	/// Closest enclosing target of `node`, `node` included.
	pub fn target(&self, node: NodeId) -> Result<NodeId, GraphError> {
		let mut current = Some(node);
		while let Some(index) = current {
			if let Some(Container { target: Some(_), .. }) = self.graph[index].container() {
				return Ok(index);
			}
			current = self.parent(index);
		}
		Err(GraphError::NoTarget(node))
	}

	pub fn target_info(&self, node: NodeId) -> Result<&Arc<TargetInfo>, GraphError> {
		let target = self.target(node)?;
		self.graph[target]
			.container()
			.and_then(|c| c.target.as_ref())
			.ok_or(GraphError::NoTarget(node))
	}

	pub(crate) fn erased(&self, node: NodeId) -> Option<&Arc<dyn ErasedTask>> {
		self.graph[node].task()
	}

	/// The task stored at `node`, if it is a `T`.
	pub fn task<T: Task>(&self, node: NodeId) -> Option<&T> {
		self.erased(node)?.as_any().downcast_ref::<T>()
	}

	/// Where the durable session record of `node` lives.
	pub fn storage_path(&self, node: NodeId) -> Option<Utf8PathBuf> {
		let id = self.id(node)?;
		let info = self.target_info(node).ok()?;
		Some(info.storage_path(id))
	}

	/// Visits the children of `graph`, inputs first, then whatever requires
	/// them, until `keep_going` returns `false`.
	///
	/// With `deep`, the children of nested containers are visited right after
	/// the container itself.
	pub fn iterate(&self, graph: NodeId, deep: bool, mut keep_going: impl FnMut(NodeId) -> bool) -> Vec<NodeId> {
		let mut walk = Walk {
			graph: self,
			deep,
			seen: HashSet::new(),
			order: Vec::new(),
			end: false,
		};
		if let Some(inputs) = self.inputs(graph) {
			let inputs: Vec<_> = inputs.iter().copied().collect();
			walk.visit(&inputs, &mut keep_going);
		}
		walk.order
	}

	pub fn all_tasks(&self, graph: NodeId, deep: bool) -> Vec<NodeId> {
		self.iterate(graph, deep, |_| true)
	}

	/// First node, `graph` included, matching `predicate`.
	pub fn find_task(
		&self,
		graph: NodeId,
		deep: bool,
		mut predicate: impl FnMut(NodeId) -> bool,
	) -> Option<NodeId> {
		if predicate(graph) {
			return Some(graph);
		}

		let mut found = None;
		self.iterate(graph, deep, |node| {
			if predicate(node) {
				found = Some(node);
			}
			found.is_none()
		});
		found
	}

	/// Walks the dependencies of `node`, transitively with `deep`, handing
	/// each one with its depth to `keep_going` until it returns `false`.
	pub fn iterate_dependencies(
		&self,
		node: NodeId,
		deep: bool,
		mut keep_going: impl FnMut(NodeId, usize) -> bool,
	) -> Vec<NodeId> {
		let mut seen = HashSet::new();
		let mut order = Vec::new();
		let mut end = false;
		self.walk_dependencies(node, 0, deep, &mut keep_going, &mut seen, &mut order, &mut end);
		order
	}

	#[allow(clippy::too_many_arguments)]
	fn walk_dependencies(
		&self,
		node: NodeId,
		level: usize,
		deep: bool,
		keep_going: &mut impl FnMut(NodeId, usize) -> bool,
		seen: &mut HashSet<NodeId>,
		order: &mut Vec<NodeId>,
		end: &mut bool,
	) {
		let dependencies: Vec<_> = self.dependencies(node).collect();
		for dependency in dependencies {
			if *end || !seen.insert(dependency) {
				continue;
			}
			order.push(dependency);
			if !keep_going(dependency, level) {
				*end = true;
			} else if deep {
				self.walk_dependencies(dependency, level + 1, deep, keep_going, seen, order, end);
			}
		}
	}

	/// Membership test for the files produced by the tasks of `graph`.
	pub fn is_output_file_checker(&self, graph: NodeId) -> OutputFileChecker {
		let mut paths = HashSet::new();
		let mut tasks = Vec::new();

		let mut nodes = vec![graph];
		nodes.extend(self.all_tasks(graph, true));
		for node in nodes {
			let Some(task) = self.erased(node) else {
				continue;
			};
			for file in task.output_files() {
				paths.insert(file.directory_path().to_owned());
				paths.insert(file.path().to_owned());
			}
			tasks.push(task.clone());
		}

		OutputFileChecker { paths, tasks }
	}
}

struct Walk<'a> {
	graph: &'a BuildGraph,
	deep: bool,
	seen: HashSet<NodeId>,
	order: Vec<NodeId>,
	end: bool,
}

impl Walk<'_> {
	fn visit(&mut self, nodes: &[NodeId], keep_going: &mut impl FnMut(NodeId) -> bool) {
		let mut fresh = Vec::new();
		for &node in nodes {
			if self.end {
				return;
			}
			if !self.seen.insert(node) {
				continue;
			}
			self.order.push(node);
			fresh.push(node);
			if !keep_going(node) {
				self.end = true;
				return;
			}
			if self.deep
				&& let Some(inputs) = self.graph.inputs(node)
			{
				let inputs: Vec<_> = inputs.iter().copied().collect();
				self.visit(&inputs, keep_going);
			}
		}

		for node in fresh {
			let next: Vec<_> = self.graph.required_by(node).collect();
			self.visit(&next, keep_going);
		}
	}
}

/// Tells generated files, and the directories holding them, from sources.
pub struct OutputFileChecker {
	paths: HashSet<Utf8PathBuf>,
	tasks: Vec<Arc<dyn ErasedTask>>,
}

impl OutputFileChecker {
	pub fn is_output(&self, path: &Utf8Path) -> bool {
		self.paths.contains(path) || self.tasks.iter().any(|task| task.is_output_file(path))
	}
}

impl Display for BuildGraph {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "graph LR")?;
		self.fmt_node(f, self.root, 1)?;

		for edge in self.graph.raw_edges() {
			writeln!(
				f,
				"    n{} --> n{}",
				edge.source().index(),
				edge.target().index()
			)?;
		}

		Ok(())
	}
}

impl BuildGraph {
	fn fmt_node(&self, f: &mut std::fmt::Formatter<'_>, node: NodeId, depth: usize) -> std::fmt::Result {
		let indent = "    ".repeat(depth);
		let name = self.name(node).to_string().replace('"', "\\\""); // Simple escape

		if self.is_graph(node) {
			writeln!(f, "{indent}subgraph n{}[\"{}\"]", node.index(), name)?;
			for &child in self.children(node) {
				self.fmt_node(f, child, depth + 1)?;
			}
			writeln!(f, "{indent}end")
		} else {
			writeln!(f, "{indent}n{}[\"{}\"]", node.index(), name)
		}
	}
}

//! Turns a workspace description into target containers under one root.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use crate::core::BuildEnv;
use crate::engine::{BuildGraph, NodeId, NodeName};
use crate::reporter::{Diagnostic, Reporter};
use crate::target::{
	BuildGraphOptions, EnvironmentDescriptor, TargetGraph, TargetInfo, TargetKind, TargetPaths, TargetRegistry,
	WorkspaceDescriptor,
};

/// Position of a target descriptor in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DescriptorRef {
	project: usize,
	target: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
	descriptor: DescriptorRef,
	environment: String,
	variant: String,
}

/// How a request for a target ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
	Target(NodeId),
	/// The target is already under construction further up the stack.
	Cyclic,
	/// The target, or one of the targets it needs, is left out of the graph.
	Omitted,
}

struct Instance {
	key: InstanceKey,
	node: NodeId,
	info: Arc<TargetInfo>,
	kind: Arc<dyn TargetKind>,
	configured: bool,
}

/// Data a target published for its dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetExport {
	pub name: String,
	pub environment: String,
	pub variant: String,
	pub value: Value,
}

/// Owner of the build graph while it is being constructed.
///
/// Every (target, environment, variant) combination is instantiated at most
/// once. A dependency cycle between targets is reported as a fatal error on
/// the requester, and only the edge closing the cycle is dropped. A target
/// whose type or dependencies can't be resolved is left out of the graph,
/// along with every target that needs it.
pub struct RootGraph {
	env: Arc<BuildEnv>,
	workspace: WorkspaceDescriptor,
	registry: TargetRegistry,
	graph: BuildGraph,
	output: Utf8PathBuf,
	instances: HashMap<InstanceKey, NodeId>,
	omitted: HashSet<InstanceKey>,
	targets: Vec<Instance>,
	under_construction: Vec<InstanceKey>,
	exports: Vec<TargetExport>,
}

impl RootGraph {
	pub fn new(env: Arc<BuildEnv>, workspace: WorkspaceDescriptor, registry: TargetRegistry) -> Self {
		let name = NodeName::new("root", "Root").with("workspace", workspace.directory.as_str());
		Self {
			env,
			output: workspace.directory.join("out"),
			workspace,
			registry,
			graph: BuildGraph::new(name),
			instances: HashMap::new(),
			omitted: HashSet::new(),
			targets: Vec::new(),
			under_construction: Vec::new(),
			exports: Vec::new(),
		}
	}

	pub fn graph(&self) -> &BuildGraph {
		&self.graph
	}

	pub fn into_graph(self) -> BuildGraph {
		self.graph
	}

	pub fn env(&self) -> &Arc<BuildEnv> {
		&self.env
	}

	pub fn workspace(&self) -> &WorkspaceDescriptor {
		&self.workspace
	}

	/// Every instantiated target, in creation order.
	pub fn targets(&self) -> Vec<NodeId> {
		self.targets.iter().map(|instance| instance.node).collect()
	}

	pub fn find(&self, name: &str, environment: &str, variant: &str) -> Option<NodeId> {
		self.targets
			.iter()
			.find(|i| i.info.name == name && i.info.environment.name == environment && i.info.variant == variant)
			.map(|i| i.node)
	}

	pub fn exports(&self) -> &[TargetExport] {
		&self.exports
	}

	/// Instantiates every selected target, with the dependencies they pull.
	///
	/// Returns the selected targets that could be created.
	pub fn create_targets(&mut self, reporter: &mut Reporter, options: &BuildGraphOptions) -> Vec<NodeId> {
		if let Some(output) = &options.output {
			self.output = output.clone();
		}

		let mut selection = Vec::new();
		for (p, project) in self.workspace.projects.iter().enumerate() {
			for (t, target) in project.targets.iter().enumerate() {
				if let Some(names) = &options.targets
					&& !names.contains(&target.name)
				{
					continue;
				}

				for environment in &target.environments {
					if let Some(names) = &options.environments
						&& !names.contains(&environment.name)
					{
						continue;
					}

					for variant in &options.variants {
						let descriptor = DescriptorRef { project: p, target: t };
						selection.push((descriptor, environment.clone(), variant.clone()));
					}
				}
			}
		}

		if selection.is_empty() {
			reporter.diagnostic(Diagnostic::error("no target selected"));
		}

		let mut created = Vec::new();
		for (descriptor, environment, variant) in selection {
			if let Resolution::Target(node) = self.create_target(reporter, None, descriptor, environment, &variant) {
				created.push(node);
			}
		}

		tracing::debug!(targets = self.targets.len(), "Targets instantiated");
		created
	}

	fn create_target(
		&mut self,
		reporter: &mut Reporter,
		requester: Option<&InstanceKey>,
		descriptor: DescriptorRef,
		environment: EnvironmentDescriptor,
		variant: &str,
	) -> Resolution {
		let key = InstanceKey {
			descriptor,
			environment: environment.name.clone(),
			variant: variant.to_owned(),
		};

		if let Some(&node) = self.instances.get(&key) {
			return Resolution::Target(node);
		}
		if self.omitted.contains(&key) {
			return Resolution::Omitted;
		}

		if self.under_construction.contains(&key) {
			let target_path = self.logical_path(&key);
			let requester_path = requester.map_or_else(|| target_path.clone(), |r| self.logical_path(r));
			reporter.diagnostic(
				Diagnostic::fatal(format!("cyclic dependencies between {requester_path} and {target_path}"))
					.at(requester_path),
			);
			return Resolution::Cyclic;
		}

		self.under_construction.push(key.clone());
		reporter.push_category("instantiate");
		let resolution = self.instantiate(reporter, key.clone(), environment);
		reporter.pop_category();
		self.under_construction.pop();

		if resolution == Resolution::Omitted {
			tracing::debug!(path = %self.logical_path(&key), "Target omitted");
			self.omitted.insert(key);
		}
		resolution
	}

	fn instantiate(
		&mut self,
		reporter: &mut Reporter,
		key: InstanceKey,
		environment: EnvironmentDescriptor,
	) -> Resolution {
		let project = &self.workspace.projects[key.descriptor.project];
		let descriptor = project.targets[key.descriptor.target].clone();
		let element_path = descriptor.element_path(project);
		let project_path = project.path.clone();
		let path = self.logical_path(&key);

		let Some(kind) = self.registry.get(&descriptor.kind).cloned() else {
			reporter.diagnostic(
				Diagnostic::error(format!(
					"cannot create target {path}, unsupported target type {}",
					descriptor.kind
				))
				.at(path),
			);
			return Resolution::Omitted;
		};

		let mut dependencies = Vec::new();
		let mut unresolved = false;
		for (i, name) in descriptor.targets.iter().enumerate() {
			let at = format!("{path}.targets[{i}]");
			match self.find_target(reporter, &at, &key, &environment, name) {
				Resolution::Target(dependency) => dependencies.push(dependency),
				Resolution::Cyclic => {}
				Resolution::Omitted => unresolved = true,
			}
		}
		if unresolved {
			return Resolution::Omitted;
		}

		let output = self.output.join(&key.variant).join(&environment.name);
		let mut info = TargetInfo {
			paths: TargetPaths::new(output, &descriptor.name),
			name: descriptor.name.clone(),
			kind: descriptor.kind.clone(),
			environment,
			variant: key.variant.clone(),
			project: project_path,
			element_path,
			attributes: descriptor.attributes.clone(),
			dependencies: descriptor.targets.clone(),
		};

		reporter.push_category("configure");
		let snapshot = reporter.snapshot();
		if let Err(e) = kind.configure(&mut info, reporter) {
			reporter.diagnostic(Diagnostic::error(format!("{e:#}")).at(path.clone()));
		}
		let configured = !reporter
			.diagnostics_after(snapshot)
			.iter()
			.any(|d| d.severity.is_failure());
		reporter.pop_category();

		let info = Arc::new(info);
		let name = NodeName::new("target", info.name.as_str())
			.with("environment", info.environment.name.as_str())
			.with("variant", info.variant.as_str())
			.with("project", info.project.as_str());
		let unique_key = json!([info.variant, info.environment.name, info.name, info.project]);

		let node = match self.graph.add_target(self.graph.root(), name, info.clone(), unique_key) {
			Ok(node) => node,
			Err(e) => {
				reporter.diagnostic(Diagnostic::fatal(e.to_string()).at(path));
				return Resolution::Omitted;
			}
		};

		for dependency in dependencies {
			if let Err(e) = self.graph.add_dependency(node, dependency) {
				reporter.diagnostic(Diagnostic::fatal(e.to_string()).at(path.clone()));
			}
		}

		self.instances.insert(key.clone(), node);

		reporter.push_category("exports");
		if let Some(value) = kind.exports(&info) {
			self.exports.push(TargetExport {
				name: info.name.clone(),
				environment: info.environment.name.clone(),
				variant: info.variant.clone(),
				value,
			});
		}
		reporter.pop_category();

		tracing::debug!(path = %path, configured, "Target created");
		self.targets.push(Instance {
			key,
			node,
			info,
			kind,
			configured,
		});

		Resolution::Target(node)
	}

	fn find_target(
		&mut self,
		reporter: &mut Reporter,
		at: &str,
		requester: &InstanceKey,
		environment: &EnvironmentDescriptor,
		name: &str,
	) -> Resolution {
		let Some(descriptor) = self.find_target_descriptor(reporter, at, name) else {
			return Resolution::Omitted;
		};
		let Some(environment) = self.compatible_environment(reporter, descriptor, environment) else {
			return Resolution::Omitted;
		};
		self.create_target(reporter, Some(requester), descriptor, environment, &requester.variant)
	}

	fn find_target_descriptor(&self, reporter: &mut Reporter, at: &str, name: &str) -> Option<DescriptorRef> {
		let found: Vec<DescriptorRef> = self
			.workspace
			.projects
			.iter()
			.enumerate()
			.flat_map(|(p, project)| {
				project
					.targets
					.iter()
					.enumerate()
					.filter(|(_, target)| target.name == name)
					.map(move |(t, _)| DescriptorRef { project: p, target: t })
			})
			.collect();

		match found.as_slice() {
			[single] => return Some(*single),
			[] => reporter.diagnostic(
				Diagnostic::error(format!("the target '{name}' is not present in the workspace")).at(at),
			),
			_ => reporter.diagnostic(
				Diagnostic::error(format!(
					"the target '{name}' is present multiple times in the workspace, this shouldn't happen"
				))
				.at(at),
			),
		}
		None
	}

	fn compatible_environment(
		&self,
		reporter: &mut Reporter,
		descriptor: DescriptorRef,
		environment: &EnvironmentDescriptor,
	) -> Option<EnvironmentDescriptor> {
		let project = &self.workspace.projects[descriptor.project];
		let target = &project.targets[descriptor.target];
		let compatible: Vec<&EnvironmentDescriptor> = target
			.environments
			.iter()
			.filter(|e| environment.accepts(&e.name))
			.collect();

		let at = format!("{}.targets", target.element_path(project));
		match compatible.as_slice() {
			[single] => return Some((*single).clone()),
			[] => reporter.diagnostic(
				Diagnostic::error(format!(
					"no compatible environment found for target '{}' with build environment '{}'",
					target.name, environment.name
				))
				.at(at),
			),
			_ => reporter.diagnostic(
				Diagnostic::error(format!(
					"multiple compatible environments found for target '{}' with build environment '{}'",
					target.name, environment.name
				))
				.at(at),
			),
		}
		None
	}

	fn logical_path(&self, key: &InstanceKey) -> String {
		let project = &self.workspace.projects[key.descriptor.project];
		let target = &project.targets[key.descriptor.target];
		format!("{}{{{}/{}}}", target.element_path(project), key.variant, key.environment)
	}

	/// Exports of the target `name` visible from `requester`.
	///
	/// Without an explicit `environment`, the requester's own environment and
	/// the ones it is compatible with are searched. A target not instantiated
	/// yet is created on the way.
	pub fn resolve_exports(
		&mut self,
		reporter: &mut Reporter,
		requester: NodeId,
		name: &str,
		environment: Option<&str>,
	) -> Vec<Value> {
		let Some(instance) = self.targets.iter().find(|i| i.node == requester) else {
			return Vec::new();
		};
		let key = instance.key.clone();
		let environment = match environment {
			Some(name) => EnvironmentDescriptor::new(name),
			None => instance.info.environment.clone(),
		};

		let matching = |exports: &[TargetExport]| -> Vec<Value> {
			exports
				.iter()
				.filter(|e| e.name == name && e.variant == key.variant && environment.accepts(&e.environment))
				.map(|e| e.value.clone())
				.collect()
		};

		let found = matching(&self.exports);
		if !found.is_empty() {
			return found;
		}

		let at = self.logical_path(&key);
		if let Resolution::Target(_) = self.find_target(reporter, &at, &key, &environment, name) {
			return matching(&self.exports);
		}

		Vec::new()
	}

	/// Every target `target` depends on, directly or not.
	pub fn all_dependencies(&self, target: NodeId) -> Vec<NodeId> {
		self.graph.iterate_dependencies(target, true, |_, _| true)
	}

	/// The direct dependency of `target` named `name`.
	pub fn get_dependency(&self, target: NodeId, name: &str) -> Option<NodeId> {
		self.graph
			.dependencies(target)
			.find(|&dependency| self.graph.target_info(dependency).is_ok_and(|info| info.name == name))
	}

	/// Lets every successfully configured target populate its container.
	pub fn build_graph(&mut self, reporter: &mut Reporter) {
		reporter.push_category("graph");
		for instance in &self.targets {
			if !instance.configured {
				continue;
			}

			let mut graph = TargetGraph {
				graph: &mut self.graph,
				node: instance.node,
				info: instance.info.clone(),
				files: self.env.files(),
				reporter: &mut *reporter,
			};

			if let Err(e) = instance.kind.build_graph(&mut graph) {
				reporter.diagnostic(Diagnostic::error(format!("{e:#}")).at(instance.info.logical_path()));
			}
		}
		reporter.pop_category();

		tracing::debug!(nodes = self.graph.len(), "Build graph ready");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::{Actions, Outcome, Runner, Task};
	use crate::reporter::Severity;
	use crate::target::{ProjectDescriptor, TargetDescriptor};
	use crate::tasks::{Generate, GenerateFileTask};
	use crate::utils::Scratch;
	use crate::StepContext;

	struct Library;

	impl TargetKind for Library {
		fn configure(&self, info: &mut TargetInfo, _: &mut Reporter) -> anyhow::Result<()> {
			if info.attribute("broken").is_some() {
				anyhow::bail!("{} is broken", info.name);
			}
			Ok(())
		}

		fn build_graph(&self, graph: &mut TargetGraph<'_>) -> anyhow::Result<()> {
			let info = graph.info().clone();
			let output = graph.files().get(info.paths.output.join(format!("{}.txt", info.name)), false)?;
			let task = GenerateFileTask::new(output, Banner(info.name.clone()));
			graph.add_task(NodeName::new("generate", info.name.as_str()), task)?;
			Ok(())
		}

		fn exports(&self, info: &TargetInfo) -> Option<Value> {
			Some(json!({ "lib": info.name }))
		}
	}

	struct Banner(String);

	impl Generate for Banner {
		fn info(&self) -> Value {
			json!(self.0)
		}

		fn generate(&self, _: &mut StepContext<'_>) -> anyhow::Result<Vec<u8>> {
			Ok(format!("hello from {}\n", self.0).into_bytes())
		}
	}

	struct Noop;

	impl Task for Noop {
		fn register(_: &mut Actions<Self>) {}
	}

	fn linux() -> EnvironmentDescriptor {
		EnvironmentDescriptor::new("linux")
	}

	fn workspace(dir: &str, targets: Vec<TargetDescriptor>) -> WorkspaceDescriptor {
		WorkspaceDescriptor {
			directory: dir.into(),
			projects: vec![ProjectDescriptor {
				path: format!("{dir}/p").into(),
				targets,
			}],
		}
	}

	fn lib(name: &str) -> TargetDescriptor {
		TargetDescriptor::new(name, "library").with_environment(linux())
	}

	fn root(workspace: WorkspaceDescriptor) -> RootGraph {
		let mut registry = TargetRegistry::new();
		registry.register("library", Library);
		RootGraph::new(Arc::new(BuildEnv::in_memory()), workspace, registry)
	}

	fn errors(reporter: &Reporter) -> Vec<(Severity, String, Option<String>)> {
		reporter
			.diagnostics
			.iter()
			.map(|d| (d.severity, d.msg.clone(), d.path.clone()))
			.collect()
	}

	#[test]
	fn test_dependencies_are_shared() {
		let mut root = root(workspace(
			"/ws",
			vec![
				lib("app").with_dependency("core").with_dependency("util"),
				lib("util").with_dependency("core"),
				lib("core"),
			],
		));
		let mut reporter = Reporter::new();

		let created = root.create_targets(&mut reporter, &BuildGraphOptions::default());
		assert!(reporter.diagnostics.is_empty(), "{}", reporter.description());
		assert_eq!(created.len(), 3);
		assert_eq!(root.targets().len(), 3);

		let app = root.find("app", "linux", "debug").unwrap();
		let util = root.find("util", "linux", "debug").unwrap();
		let core = root.find("core", "linux", "debug").unwrap();
		assert_eq!(root.get_dependency(app, "util"), Some(util));
		assert_eq!(root.get_dependency(app, "nothing"), None);

		let mut all = root.all_dependencies(app);
		all.sort();
		let mut expected = vec![util, core];
		expected.sort();
		assert_eq!(all, expected);

		let info = root.graph().target_info(app).unwrap();
		assert_eq!(info.logical_path(), "/ws/p:app{debug/linux}");
		assert_eq!(info.paths.output, "/ws/out/debug/linux");
		assert_eq!(info.paths.tasks, "/ws/out/debug/linux/.build/tasks");
		assert!(root.graph().id(app).is_some_and(|id| id.starts_with("Target-")));
	}

	#[test]
	fn test_cycle_is_reported_once() {
		let mut root = root(workspace(
			"/ws",
			vec![lib("a").with_dependency("b"), lib("b").with_dependency("a")],
		));
		let mut reporter = Reporter::new();
		root.create_targets(&mut reporter, &BuildGraphOptions::default());

		assert_eq!(
			errors(&reporter),
			vec![(
				Severity::Fatal,
				"cyclic dependencies between /ws/p:b{debug/linux} and /ws/p:a{debug/linux}".to_string(),
				Some("/ws/p:b{debug/linux}".to_string()),
			)]
		);
		assert_eq!(reporter.diagnostics[0].category.as_deref(), Some("instantiate"));

		let a = root.find("a", "linux", "debug").unwrap();
		let b = root.find("b", "linux", "debug").unwrap();
		assert_eq!(root.targets().len(), 2);
		assert_eq!(root.graph().dependencies(a).collect::<Vec<_>>(), vec![b]);
		assert_eq!(root.graph().dependencies(b).count(), 0);
	}

	#[test]
	fn test_self_dependency() {
		let mut root = root(workspace("/ws", vec![lib("a").with_dependency("a")]));
		let mut reporter = Reporter::new();
		root.create_targets(&mut reporter, &BuildGraphOptions::default());

		assert_eq!(reporter.diagnostics.len(), 1);
		assert_eq!(
			reporter.diagnostics[0].msg,
			"cyclic dependencies between /ws/p:a{debug/linux} and /ws/p:a{debug/linux}"
		);
		assert_eq!(root.targets().len(), 1);
	}

	#[test]
	fn test_resolution_errors() {
		let mut root = root(workspace(
			"/ws",
			vec![
				TargetDescriptor::new("odd", "unknown").with_environment(linux()),
				lib("app").with_dependency("ghost"),
				lib("tool").with_dependency("win"),
				TargetDescriptor::new("win", "library").with_environment(EnvironmentDescriptor::new("windows")),
			],
		));
		let mut reporter = Reporter::new();
		root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				targets: Some(vec!["odd".into(), "app".into(), "tool".into()]),
				..Default::default()
			},
		);

		assert_eq!(
			errors(&reporter),
			vec![
				(
					Severity::Error,
					"cannot create target /ws/p:odd{debug/linux}, unsupported target type unknown".to_string(),
					Some("/ws/p:odd{debug/linux}".to_string()),
				),
				(
					Severity::Error,
					"the target 'ghost' is not present in the workspace".to_string(),
					Some("/ws/p:app{debug/linux}.targets[0]".to_string()),
				),
				(
					Severity::Error,
					"no compatible environment found for target 'win' with build environment 'linux'".to_string(),
					Some("/ws/p:win.targets".to_string()),
				),
			]
		);
		assert!(reporter.failed);
		assert!(root.targets().is_empty());
		assert!(root.find("app", "linux", "debug").is_none());
		assert!(root.find("tool", "linux", "debug").is_none());
		assert!(root.graph().children(root.graph().root()).is_empty());
	}

	#[test]
	fn test_unresolved_dependency_leaves_target_out() {
		let scratch = Scratch::new("root-unresolved");
		let mut root = root(workspace(
			scratch.as_str(),
			vec![
				lib("base"),
				lib("app").with_dependency("ghost"),
				lib("top").with_dependency("app"),
				lib("user").with_dependency("base"),
			],
		));
		let mut reporter = Reporter::new();
		let created = root.create_targets(&mut reporter, &BuildGraphOptions::default());
		root.build_graph(&mut reporter);

		assert_eq!(
			errors(&reporter),
			vec![(
				Severity::Error,
				"the target 'ghost' is not present in the workspace".to_string(),
				Some(format!("{}/p:app{{debug/linux}}.targets[0]", scratch.as_str())),
			)]
		);
		assert_eq!(created.len(), 2);
		assert!(root.find("app", "linux", "debug").is_none());
		assert!(root.find("top", "linux", "debug").is_none());
		let base = root.find("base", "linux", "debug").unwrap();
		let user = root.find("user", "linux", "debug").unwrap();
		assert_eq!(root.get_dependency(user, "base"), Some(base));
		assert_eq!(root.graph().children(root.graph().root()).len(), 2);

		let env = root.env().clone();
		let report = Runner::new(Arc::new(root.into_graph()), env, "build").run().unwrap();
		assert!(!report.failed);
		assert_eq!(report.count(Outcome::Executed), 2);
		assert!(!scratch.join("out/debug/linux/app.txt").exists());
		assert!(!scratch.join("out/debug/linux/top.txt").exists());
		assert!(scratch.join("out/debug/linux/user.txt").exists());
	}

	#[test]
	fn test_compatible_environments() {
		let posix = EnvironmentDescriptor::new("posix");
		let mut root = root(workspace(
			"/ws",
			vec![
				TargetDescriptor::new("app", "library")
					.with_environment(linux().compatible_with("posix"))
					.with_dependency("core")
					.with_dependency("dup"),
				TargetDescriptor::new("core", "library").with_environment(posix.clone()),
				TargetDescriptor::new("dup", "library")
					.with_environment(linux())
					.with_environment(posix),
			],
		));
		let mut reporter = Reporter::new();
		root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				targets: Some(vec!["app".into()]),
				..Default::default()
			},
		);

		assert_eq!(reporter.diagnostics.len(), 1);
		assert_eq!(
			reporter.diagnostics[0].msg,
			"multiple compatible environments found for target 'dup' with build environment 'linux'"
		);
		assert!(root.find("core", "posix", "debug").is_some());
		assert!(root.find("app", "linux", "debug").is_none());
	}

	#[test]
	fn test_duplicated_names() {
		let mut workspace = workspace("/ws", vec![lib("app").with_dependency("core"), lib("core")]);
		workspace.projects.push(ProjectDescriptor {
			path: "/ws/q".into(),
			targets: vec![lib("core")],
		});
		let mut root = root(workspace);
		let mut reporter = Reporter::new();
		root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				targets: Some(vec!["app".into()]),
				..Default::default()
			},
		);

		assert_eq!(
			reporter.diagnostics[0].msg,
			"the target 'core' is present multiple times in the workspace, this shouldn't happen"
		);
		assert_eq!(reporter.diagnostics.len(), 1);
		assert!(root.find("app", "linux", "debug").is_none());
	}

	#[test]
	fn test_no_target_selected() {
		let mut root = root(workspace("/ws", vec![lib("app")]));
		let mut reporter = Reporter::new();
		let created = root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				environments: Some(vec!["windows".into()]),
				..Default::default()
			},
		);

		assert!(created.is_empty());
		assert_eq!(errors(&reporter), vec![(Severity::Error, "no target selected".to_string(), None)]);
	}

	#[test]
	fn test_variants_are_distinct() {
		let mut root = root(workspace("/ws", vec![lib("app")]));
		let mut reporter = Reporter::new();
		root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				variants: vec!["debug".into(), "release".into()],
				..Default::default()
			},
		);

		let debug = root.find("app", "linux", "debug").unwrap();
		let release = root.find("app", "linux", "release").unwrap();
		assert_ne!(root.graph().id(debug), root.graph().id(release));
		assert_eq!(
			root.graph().target_info(release).unwrap().paths.output,
			"/ws/out/release/linux"
		);
	}

	#[test]
	fn test_exports() {
		let mut root = root(workspace("/ws", vec![lib("app"), lib("core")]));
		let mut reporter = Reporter::new();
		root.create_targets(
			&mut reporter,
			&BuildGraphOptions {
				targets: Some(vec!["app".into()]),
				..Default::default()
			},
		);
		let app = root.find("app", "linux", "debug").unwrap();
		assert!(root.find("core", "linux", "debug").is_none());

		let exports = root.resolve_exports(&mut reporter, app, "core", None);
		assert_eq!(exports, vec![json!({ "lib": "core" })]);
		assert!(root.find("core", "linux", "debug").is_some());
		assert_eq!(root.exports().len(), 2);

		assert!(root.resolve_exports(&mut reporter, app, "core", Some("windows")).is_empty());
		assert!(reporter.diagnostics[0].msg.starts_with("no compatible environment"));
	}

	#[test]
	fn test_failed_configuration_skips_graph() {
		let mut root = root(workspace(
			"/ws",
			vec![lib("good"), lib("bad").with_attributes(json!({ "broken": true }))],
		));
		let mut reporter = Reporter::new();
		root.create_targets(&mut reporter, &BuildGraphOptions::default());
		root.build_graph(&mut reporter);

		let good = root.find("good", "linux", "debug").unwrap();
		let bad = root.find("bad", "linux", "debug").unwrap();
		assert_eq!(root.graph().children(good).len(), 1);
		assert!(root.graph().children(bad).is_empty());

		let diagnostic = &reporter.diagnostics[0];
		assert_eq!(diagnostic.msg, "bad is broken");
		assert_eq!(diagnostic.category.as_deref(), Some("configure"));
	}

	#[test]
	fn test_build_then_replay_from_disk() {
		let scratch = Scratch::new("root-build");
		let mut registry = TargetRegistry::new();
		registry.register("library", Library);
		let env = Arc::new(BuildEnv::new());
		let mut root = RootGraph::new(env.clone(), workspace(scratch.as_str(), vec![lib("app")]), registry);

		let mut reporter = Reporter::new();
		root.create_targets(&mut reporter, &BuildGraphOptions::default());
		root.build_graph(&mut reporter);
		assert!(reporter.diagnostics.is_empty(), "{}", reporter.description());

		let app = root.find("app", "linux", "debug").unwrap();
		let task = root.graph().children(app)[0];
		let storage = root.graph().storage_path(task).unwrap();
		let output = scratch.join("out/debug/linux/app.txt");

		let graph = Arc::new(root.into_graph());
		let first = Runner::new(graph.clone(), env.clone(), "build").run().unwrap();
		assert!(!first.failed);
		assert_eq!(first.executions[&task].outcome, Outcome::Executed);
		assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello from app\n");
		assert!(storage.starts_with(scratch.join("out/debug/linux/.build/tasks")));

		let record: Value = serde_json::from_str(&std::fs::read_to_string(&storage).unwrap()).unwrap();
		assert!(record["build"]["lastSuccessTime"].as_u64().is_some_and(|t| t > 0));
		assert!(record.get("SHARED").is_some());

		env.clear_caches();
		let second = Runner::new(graph.clone(), env.clone(), "build").run().unwrap();
		assert_eq!(second.executions[&task].outcome, Outcome::Replayed);

		let clean = Runner::new(graph, env, "clean").run().unwrap();
		assert!(!clean.failed);
		assert!(!output.exists());
	}

	#[test]
	fn test_tasks_outside_targets_have_no_storage() {
		let mut root = root(workspace("/ws", Vec::new()));
		let node = root.graph.add_task(root.graph.root(), NodeName::new("noop", "n"), Noop).unwrap();
		assert_eq!(root.graph().storage_path(node), None);
		assert!(root.graph().target(node).is_err());
	}
}

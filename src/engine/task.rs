use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;
use serde_json::{Map, Value};

use crate::core::{BuildEnv, RunOptions, short_type_name};
use crate::engine::{BuildGraph, NodeId, NodeName};
use crate::error::GraphError;
use crate::file::{File, FileCache};
use crate::reporter::{Diagnostic, Reporter};
use crate::session::ActionRecord;
use crate::target::TargetInfo;

/// A leaf unit of work.
///
/// A task supports an action by registering hooks for it in
/// [`Task::register`]: an optional requirement predicate consulted before
/// running, and the executor itself. An action without an executor is
/// reported as unsupported.
///
/// ```rust,ignore
/// struct Touch(Arc<File>);
///
/// impl Task for Touch {
///     fn unique_key(&self) -> Option<Value> {
///         Some(json!(self.0.path()))
///     }
///
///     fn register(actions: &mut Actions<Self>) {
///         actions.run("build", |task, ctx| Ok(ctx.files().write(&task.0, "")?));
///     }
/// }
/// ```
pub trait Task: Send + Sync + 'static {
	/// Identity of the task across runs, tasks without one keep no session.
	fn unique_key(&self) -> Option<Value> {
		None
	}

	/// Type part of the stable id.
	fn kind(&self) -> &'static str {
		short_type_name::<Self>()
	}

	fn register(actions: &mut Actions<Self>)
	where
		Self: Sized;

	/// Files this task produces.
	fn output_files(&self) -> Vec<Arc<File>> {
		Vec::new()
	}

	/// Extra membership test for generated files not listed upfront.
	fn is_output_file(&self, _: &Utf8Path) -> bool {
		false
	}
}

type Predicate<T> = Box<dyn Fn(&T, &mut StepContext<'_>) -> anyhow::Result<bool> + Send + Sync>;
type Executor<T> = Box<dyn Fn(&T, &mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Action hooks of one task type.
pub struct Actions<T> {
	required: HashMap<String, Predicate<T>>,
	executors: HashMap<String, Executor<T>>,
}

impl<T> Default for Actions<T> {
	fn default() -> Self {
		Self {
			required: HashMap::new(),
			executors: HashMap::new(),
		}
	}
}

impl<T> Actions<T> {
	/// Registers the predicate deciding whether `action` has to run again.
	pub fn is_required<F>(&mut self, action: &str, predicate: F) -> &mut Self
	where
		F: Fn(&T, &mut StepContext<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
	{
		self.required.insert(action.to_owned(), Box::new(predicate));
		self
	}

	/// Registers the executor of `action`.
	pub fn run<F>(&mut self, action: &str, executor: F) -> &mut Self
	where
		F: Fn(&T, &mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		self.executors.insert(action.to_owned(), Box::new(executor));
		self
	}

	pub fn supports(&self, action: &str) -> bool {
		self.executors.contains_key(action)
	}
}

pub(crate) struct TaskCell<T> {
	task: T,
	actions: Actions<T>,
}

impl<T: Task> TaskCell<T> {
	pub fn new(task: T) -> Self {
		let mut actions = Actions::default();
		T::register(&mut actions);
		Self { task, actions }
	}
}

/// The type erased face of a [`Task`], what the graph holds.
pub(crate) trait ErasedTask: Send + Sync {
	fn unique_key(&self) -> Option<Value>;

	fn output_files(&self) -> Vec<Arc<File>>;

	fn is_output_file(&self, path: &Utf8Path) -> bool;

	fn is_required(&self, action: &str, ctx: &mut StepContext<'_>) -> Option<anyhow::Result<bool>>;

	fn run(&self, action: &str, ctx: &mut StepContext<'_>) -> Option<anyhow::Result<()>>;

	fn as_any(&self) -> &dyn Any;
}

impl<T: Task> ErasedTask for TaskCell<T> {
	fn unique_key(&self) -> Option<Value> {
		self.task.unique_key()
	}

	fn output_files(&self) -> Vec<Arc<File>> {
		self.task.output_files()
	}

	fn is_output_file(&self, path: &Utf8Path) -> bool {
		self.task.is_output_file(path)
	}

	fn is_required(&self, action: &str, ctx: &mut StepContext<'_>) -> Option<anyhow::Result<bool>> {
		let predicate = self.actions.required.get(action)?;
		Some(predicate(&self.task, ctx))
	}

	fn run(&self, action: &str, ctx: &mut StepContext<'_>) -> Option<anyhow::Result<()>> {
		let executor = self.actions.executors.get(action)?;
		Some(executor(&self.task, ctx))
	}

	fn as_any(&self) -> &dyn Any {
		&self.task
	}
}

/// Everything a hook can see and touch while a task runs one action.
pub struct StepContext<'a> {
	pub(crate) action: &'a str,
	pub(crate) options: &'a RunOptions,
	pub(crate) env: &'a BuildEnv,
	pub(crate) graph: &'a BuildGraph,
	pub(crate) node: NodeId,
	/// Diagnostics and logs of this run.
	pub reporter: Reporter,
	pub(crate) record: ActionRecord,
	/// Task private data common to every action.
	pub shared: Map<String, Value>,
	pub(crate) last_run_start_time: u64,
	pub(crate) last_run_end_time: u64,
	pub(crate) last_success_time: u64,
}

impl<'a> StepContext<'a> {
	pub fn action(&self) -> &str {
		self.action
	}

	pub fn options(&self) -> &RunOptions {
		self.options
	}

	pub fn env(&self) -> &BuildEnv {
		self.env
	}

	pub fn files(&self) -> &FileCache {
		self.env.files()
	}

	pub fn graph(&self) -> &BuildGraph {
		self.graph
	}

	pub fn node(&self) -> NodeId {
		self.node
	}

	pub fn name(&self) -> &NodeName {
		self.graph.name(self.node)
	}

	pub fn target(&self) -> Result<&TargetInfo, GraphError> {
		self.graph.target_info(self.node).map(|info| info.as_ref())
	}

	/// Task private data of the current action, persisted with the record.
	pub fn data(&self) -> &Map<String, Value> {
		&self.record.extra
	}

	pub fn data_mut(&mut self) -> &mut Map<String, Value> {
		&mut self.record.extra
	}

	/// When this run started, in milliseconds.
	pub fn last_run_start_time(&self) -> u64 {
		self.last_run_start_time
	}

	/// When the previous run of this action ended, `0` if it never ran.
	pub fn last_run_end_time(&self) -> u64 {
		self.last_run_end_time
	}

	/// When this action last succeeded, `0` if it never did.
	pub fn last_success_time(&self) -> u64 {
		self.last_success_time
	}
}

/// What happened to a node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	/// The action hook ran.
	Executed,
	/// Nothing changed, the previous diagnostics were replayed.
	Replayed,
	/// The task has no hook for the action.
	Unsupported,
	/// The requirement check failed, the action was not attempted.
	Skipped,
	/// A container, finished once its children did.
	Graph,
}

/// Runs one task through the requirement check then the action.
pub(crate) fn dispatch(task: &dyn ErasedTask, ctx: &mut StepContext<'_>) -> Outcome {
	let action = ctx.action;
	let mut required = true;

	if !ctx.options.full
		&& ctx.last_success_time > 0
		&& let Some(result) = task.is_required(action, ctx)
	{
		match result {
			Ok(value) => required = value,
			Err(e) => ctx.reporter.error(&e),
		}
	}

	if ctx.reporter.failed {
		return Outcome::Skipped;
	}

	if !required {
		ctx.reporter.logs = ctx.record.logs.clone();
		ctx.reporter.diagnostics = ctx.record.diagnostics.clone();
		return Outcome::Replayed;
	}

	let result = match task.run(action, ctx) {
		Some(result) => result,
		None if action == "generate" => {
			// Without a dedicated hook, `generate` goes to the IDE specific one.
			let Some(ide) = ctx.options.ide.clone() else {
				return Outcome::Executed;
			};
			match task.run(&format!("generate_{ide}"), ctx) {
				Some(result) => result,
				None => return Outcome::Executed,
			}
		}
		None => {
			let path = ctx.name().to_string();
			ctx.reporter
				.diagnostic(Diagnostic::note(format!("task doesn't support \"{action}\" action")).at(path));
			return Outcome::Unsupported;
		}
	};

	if let Err(e) = result {
		ctx.reporter.error(&e);
	}

	Outcome::Executed
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reporter::Severity;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct Probe {
		required: bool,
		checks: AtomicUsize,
		runs: AtomicUsize,
	}

	impl Task for Probe {
		fn register(actions: &mut Actions<Self>) {
			actions
				.is_required("build", |task, _| {
					task.checks.fetch_add(1, Ordering::SeqCst);
					Ok(task.required)
				})
				.run("build", |task, ctx| {
					task.runs.fetch_add(1, Ordering::SeqCst);
					ctx.reporter.lognl("built");
					Ok(())
				})
				.run("fail", |_, _| anyhow::bail!("nope"))
				.run("generate_xcode", |_, ctx| {
					ctx.reporter.note("xcode project");
					Ok(())
				});
		}
	}

	struct Fixture {
		graph: BuildGraph,
		env: BuildEnv,
		node: NodeId,
	}

	impl Fixture {
		fn new(probe: Probe) -> Self {
			let mut graph = BuildGraph::default();
			let root = graph.root();
			let node = graph.add_task(root, NodeName::new("probe", "p"), probe).unwrap();
			Self {
				graph,
				env: BuildEnv::in_memory(),
				node,
			}
		}

		fn ctx<'a>(&'a self, action: &'a str, options: &'a RunOptions, record: ActionRecord) -> StepContext<'a> {
			StepContext {
				action,
				options,
				env: &self.env,
				graph: &self.graph,
				node: self.node,
				reporter: Reporter::new(),
				last_run_end_time: record.last_run_end_time,
				last_success_time: record.last_success_time,
				record,
				shared: Map::new(),
				last_run_start_time: 100,
			}
		}

		fn task(&self) -> &Arc<dyn ErasedTask> {
			self.graph.erased(self.node).unwrap()
		}

		fn probe(&self) -> &Probe {
			self.graph.task::<Probe>(self.node).unwrap()
		}
	}

	fn previous() -> ActionRecord {
		ActionRecord {
			last_run_start_time: 10,
			last_run_end_time: 20,
			last_success_time: 20,
			logs: "old\n".into(),
			diagnostics: vec![Diagnostic::warning("old warning")],
			..Default::default()
		}
	}

	#[test]
	fn test_first_run_skips_predicate() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions::default();
		let mut ctx = fixture.ctx("build", &options, ActionRecord::default());

		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Executed);
		assert_eq!(fixture.probe().checks.load(Ordering::SeqCst), 0);
		assert_eq!(fixture.probe().runs.load(Ordering::SeqCst), 1);
		assert_eq!(ctx.reporter.logs, "built\n");
	}

	#[test]
	fn test_not_required_replays() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions::default();
		let mut ctx = fixture.ctx("build", &options, previous());

		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Replayed);
		assert_eq!(fixture.probe().checks.load(Ordering::SeqCst), 1);
		assert_eq!(fixture.probe().runs.load(Ordering::SeqCst), 0);
		assert_eq!(ctx.reporter.logs, "old\n");
		assert_eq!(ctx.reporter.diagnostics, previous().diagnostics);
	}

	#[test]
	fn test_full_ignores_predicate() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions {
			full: true,
			..Default::default()
		};
		let mut ctx = fixture.ctx("build", &options, previous());

		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Executed);
		assert_eq!(fixture.probe().checks.load(Ordering::SeqCst), 0);
		assert_eq!(fixture.probe().runs.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_unsupported_action_is_a_note() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions::default();
		let mut ctx = fixture.ctx("clean", &options, ActionRecord::default());

		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Unsupported);
		assert!(!ctx.reporter.failed);
		let note = &ctx.reporter.diagnostics[0];
		assert_eq!(note.severity, Severity::Note);
		assert_eq!(note.msg, "task doesn't support \"clean\" action");
		assert_eq!(note.path.as_deref(), Some("probe:p"));
	}

	#[test]
	fn test_failing_hook() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions::default();
		let mut ctx = fixture.ctx("fail", &options, ActionRecord::default());

		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Executed);
		assert!(ctx.reporter.failed);
		assert_eq!(ctx.reporter.diagnostics[0].msg, "nope");
	}

	#[test]
	fn test_generate_goes_to_ide_hook() {
		let fixture = Fixture::new(Probe::default());
		let options = RunOptions {
			ide: Some("xcode".into()),
			..Default::default()
		};
		let mut ctx = fixture.ctx("generate", &options, ActionRecord::default());
		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Executed);
		assert_eq!(ctx.reporter.diagnostics[0].msg, "xcode project");

		let options = RunOptions {
			ide: Some("vscode".into()),
			..Default::default()
		};
		let mut ctx = fixture.ctx("generate", &options, ActionRecord::default());
		assert_eq!(dispatch(fixture.task().as_ref(), &mut ctx), Outcome::Executed);
		assert!(ctx.reporter.diagnostics.is_empty());
	}
}

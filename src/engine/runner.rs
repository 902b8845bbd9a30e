use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_json::{Map, Value};
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::barrier::Barrier;
use crate::core::{BuildEnv, RunOptions, SessionMode, lock, now_ms};
use crate::engine::task::{ErasedTask, dispatch};
use crate::engine::{BuildGraph, NodeId, NodeName, Outcome, StepContext};
use crate::error::RunError;
use crate::reporter::{Diagnostic, Reporter};
use crate::session::{ActionRecord, BuildSession, InMemory, JsonFile, Noop, SHARED};
use crate::utils::{get_style_run, get_style_task};

/// Emitted when a node starts and when it ends.
///
/// On start `record` holds what the previous run stored, on end what this run
/// just stored.
#[derive(Debug, Clone)]
pub struct TaskEvent {
	pub node: NodeId,
	pub id: Option<String>,
	pub name: NodeName,
	pub action: String,
	pub record: ActionRecord,
	pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct Execution {
	pub start: Instant,
	pub duration: Duration,
	pub outcome: Outcome,
}

/// Result of [`Runner::run`].
#[derive(Debug, Default)]
pub struct RunReport {
	/// Whether any executed node failed.
	pub failed: bool,
	/// Every node that ran, containers included.
	pub executions: HashMap<NodeId, Execution>,
}

impl RunReport {
	pub fn count(&self, outcome: Outcome) -> usize {
		self.executions.values().filter(|e| e.outcome == outcome).count()
	}
}

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Called once a node finished, with its failure flag.
type Continuation = Box<dyn FnOnce(bool) + Send>;

/// Drives one action across a graph, or across a selection of its nodes.
pub struct Runner {
	graph: Arc<BuildGraph>,
	env: Arc<BuildEnv>,
	root: NodeId,
	action: String,
	options: RunOptions,
	enabled: Vec<NodeId>,
	on_begin: Vec<Listener>,
	on_end: Vec<Listener>,
}

impl Runner {
	pub fn new(graph: Arc<BuildGraph>, env: Arc<BuildEnv>, action: impl Into<String>) -> Self {
		Self {
			root: graph.root(),
			graph,
			env,
			action: action.into(),
			options: RunOptions::default(),
			enabled: Vec::new(),
			on_begin: Vec::new(),
			on_end: Vec::new(),
		}
	}

	/// Runs `root` instead of the whole graph when nothing is enabled.
	pub fn with_root(mut self, root: NodeId) -> Self {
		self.root = root;
		self
	}

	pub fn with_options(mut self, options: RunOptions) -> Self {
		self.options = options;
		self
	}

	pub fn action(&self) -> &str {
		&self.action
	}

	pub fn graph(&self) -> &Arc<BuildGraph> {
		&self.graph
	}

	/// Selects `node` for the run.
	///
	/// Nothing happens when `node` or one of its ancestors is already
	/// selected, and selecting a container drops its selected descendants.
	pub fn enable(&mut self, node: NodeId) -> &mut Self {
		let parents = self.graph.parents(node);
		if self.enabled.contains(&node) || parents.iter().any(|p| self.enabled.contains(p)) {
			return self;
		}

		let graph = &self.graph;
		self.enabled.retain(|&enabled| !graph.parents(enabled).contains(&node));
		self.enabled.push(node);
		self
	}

	pub fn enabled(&self) -> &[NodeId] {
		&self.enabled
	}

	fn selection(&self) -> Vec<NodeId> {
		if self.enabled.is_empty() {
			vec![self.root]
		} else {
			self.enabled.clone()
		}
	}

	/// Every node the run would go through, containers included.
	pub fn nodes(&self) -> Vec<NodeId> {
		let mut nodes = Vec::new();
		for node in self.selection() {
			nodes.push(node);
			if self.graph.is_graph(node) {
				nodes.extend(self.graph.all_tasks(node, true));
			}
		}
		nodes
	}

	pub fn on_task_begin(&mut self, listener: impl Fn(&TaskEvent) + Send + Sync + 'static) -> &mut Self {
		self.on_begin.push(Arc::new(listener));
		self
	}

	pub fn on_task_end(&mut self, listener: impl Fn(&TaskEvent) + Send + Sync + 'static) -> &mut Self {
		self.on_end.push(Arc::new(listener));
		self
	}

	/// Runs the action and waits for every selected node to finish.
	///
	/// Independent nodes run concurrently on a thread pool sized by
	/// [`RunOptions::max_concurrent_tasks`]. A failing node never stops its
	/// siblings, only the nodes requiring it.
	pub fn run(&self) -> Result<RunReport, RunError> {
		let pool = ThreadPoolBuilder::new()
			.num_threads(self.options.max_concurrent_tasks.unwrap_or(0))
			.thread_name(|i| format!("tsumiki-{i}"))
			.panic_handler(|panic| {
				tracing::error!("{}", panic_message(panic.as_ref()));
			})
			.build()?;

		let selection = self.selection();
		let total = self
			.nodes()
			.into_iter()
			.filter(|&node| !self.graph.is_graph(node))
			.count();

		let span = tracing::span!(Level::INFO, "run", action = %self.action);
		span.pb_set_length(total as u64);
		span.pb_set_style(&get_style_run()?);
		span.pb_set_message(&format!("Running {}...", self.action));
		let _enter = span.enter();

		let exec = Arc::new(Exec {
			graph: self.graph.clone(),
			env: self.env.clone(),
			action: self.action.clone(),
			options: self.options.clone(),
			pool,
			span: span.clone(),
			style: get_style_task()?,
			on_begin: self.on_begin.clone(),
			on_end: self.on_end.clone(),
			executions: Mutex::default(),
		});

		let (sender, receiver) = channel();
		let failed = Arc::new(AtomicBool::new(false));
		let barrier = Arc::new(Barrier::new("run", selection.len()));

		for node in selection {
			let failed = failed.clone();
			let barrier = barrier.clone();
			exec.execute(
				node,
				Box::new(move |node_failed| {
					if node_failed {
						failed.store(true, Ordering::SeqCst);
					}
					barrier.dec();
				}),
			);
		}

		barrier.end_with(move || {
			let _ = sender.send(failed.load(Ordering::SeqCst));
		});
		// A lost continuation drops the last handle, and the sender with it.
		drop(barrier);

		let failed = receiver.recv().map_err(|_| RunError::Interrupted)?;
		let executions = std::mem::take(&mut *lock(&exec.executions));

		tracing::info!(failed, nodes = executions.len(), "Run complete");
		Ok(RunReport { failed, executions })
	}
}

/// Shared state of one run, handed to every pool job.
struct Exec {
	graph: Arc<BuildGraph>,
	env: Arc<BuildEnv>,
	action: String,
	options: RunOptions,
	pool: ThreadPool,
	span: Span,
	style: ProgressStyle,
	on_begin: Vec<Listener>,
	on_end: Vec<Listener>,
	executions: Mutex<HashMap<NodeId, Execution>>,
}

/// Scheduling state of one child within a running container.
struct Step {
	requirements: usize,
	running: bool,
}

struct GraphRun {
	steps: Mutex<HashMap<NodeId, Step>>,
	barrier: Barrier,
	failed: Arc<AtomicBool>,
}

impl Exec {
	fn execute(self: &Arc<Self>, node: NodeId, then: Continuation) {
		match self.graph.erased(node) {
			Some(task) => {
				let exec = self.clone();
				let task = task.clone();
				self.pool.spawn(move || exec.run_task(node, task, then));
			}
			None => self.run_graph(node, then),
		}
	}

	fn storage(&self, node: NodeId) -> Box<dyn BuildSession> {
		let Some(id) = self.graph.id(node) else {
			return Box::new(Noop);
		};

		match self.env.mode() {
			SessionMode::InMemory => Box::new(InMemory::shared(&self.env, id)),
			SessionMode::Durable => match self.graph.storage_path(node) {
				Some(path) => Box::new(JsonFile::new(self.env.clone(), path)),
				None => Box::new(Noop),
			},
		}
	}

	fn emit(&self, listeners: &[Listener], node: NodeId, record: &ActionRecord, failed: bool) {
		if listeners.is_empty() {
			return;
		}

		let event = TaskEvent {
			node,
			id: self.graph.id(node).map(str::to_owned),
			name: self.graph.name(node).clone(),
			action: self.action.clone(),
			record: record.clone(),
			failed,
		};

		for listener in listeners {
			listener(&event);
		}
	}

	fn finish(&self, node: NodeId, start: Instant, outcome: Outcome) {
		let execution = Execution {
			start,
			duration: start.elapsed(),
			outcome,
		};
		lock(&self.executions).insert(node, execution);
	}

	fn run_task(&self, node: NodeId, task: Arc<dyn ErasedTask>, then: Continuation) {
		let name = self.graph.name(node);
		let span = tracing::span!(parent: &self.span, Level::INFO, "task", name = %name);
		span.pb_set_style(&self.style);
		span.pb_set_message(&format!("Running {name}"));
		let enter = span.enter();

		let start = Instant::now();
		let mut reporter = Reporter::new();
		let mut storage = self.storage(node);
		if let Err(e) = storage.load() {
			tracing::warn!(error = %e, "Couldn't load build session");
			reporter.warning(format!("couldn't load build session: {e}"));
		}

		let record = ActionRecord::from_stored(storage.get(&self.action));
		let shared = match storage.get(SHARED) {
			Some(Value::Object(shared)) => shared,
			_ => Map::new(),
		};

		let mut ctx = StepContext {
			action: &self.action,
			options: &self.options,
			env: &self.env,
			graph: &self.graph,
			node,
			reporter,
			last_run_start_time: now_ms(),
			last_run_end_time: record.last_run_end_time,
			last_success_time: record.last_success_time,
			record,
			shared,
		};
		self.emit(&self.on_begin, node, &ctx.record, false);

		// We use AssertUnwindSafe because the context is dropped right after
		// a panic is recorded, nothing observes its half updated state.
		let outcome = match catch_unwind(AssertUnwindSafe(|| dispatch(task.as_ref(), &mut ctx))) {
			Ok(outcome) => outcome,
			Err(panic) => {
				ctx.reporter.fatal(panic_message(panic.as_ref()));
				Outcome::Executed
			}
		};

		let end = now_ms();
		let StepContext {
			reporter,
			mut record,
			shared,
			last_run_start_time,
			..
		} = ctx;

		let mut failed = reporter.failed;
		record.logs = reporter.logs;
		record.diagnostics = reporter.diagnostics;
		record.last_run_start_time = last_run_start_time;
		record.last_run_end_time = end;
		record.last_success_time = if failed { 0 } else { end };

		storage.set(&self.action, record.to_value());
		storage.set(SHARED, Value::Object(shared));
		if let Err(e) = storage.save() {
			tracing::error!(error = %e, "Couldn't save build session");
			record
				.diagnostics
				.push(Diagnostic::error(format!("couldn't save build session: {e}")));
			failed = true;
		}

		tracing::debug!(?outcome, failed, "Task done");
		self.emit(&self.on_end, node, &record, failed);
		self.finish(node, start, outcome);
		self.span.pb_inc(1);
		drop(enter);

		then(failed);
	}

	fn run_graph(self: &Arc<Self>, node: NodeId, then: Continuation) {
		let start = Instant::now();
		self.emit(&self.on_begin, node, &ActionRecord::default(), false);

		let run = Arc::new(GraphRun {
			steps: Mutex::default(),
			barrier: Barrier::new(self.graph.name(node).to_string(), 0),
			failed: Arc::new(AtomicBool::new(false)),
		});

		let inputs: Vec<NodeId> = self
			.graph
			.inputs(node)
			.map(|inputs| inputs.iter().copied().collect())
			.unwrap_or_default();

		for input in inputs {
			self.start(&run, input);
		}

		let exec = self.clone();
		let failed = run.failed.clone();
		run.barrier.end_with(move || {
			let failed = failed.load(Ordering::SeqCst);
			exec.emit(&exec.on_end, node, &ActionRecord::default(), failed);
			exec.finish(node, start, Outcome::Graph);
			then(failed);
		});
	}

	/// Starts `node` unless it already runs or still waits for a dependency.
	fn start(self: &Arc<Self>, run: &Arc<GraphRun>, node: NodeId) {
		{
			let mut steps = lock(&run.steps);
			let step = steps.entry(node).or_insert_with(|| Step {
				requirements: self.graph.dependencies(node).count(),
				running: false,
			});
			if step.running || step.requirements > 0 {
				return;
			}
			step.running = true;
		}

		run.barrier.inc();
		let exec = self.clone();
		let run = run.clone();
		self.execute(node, Box::new(move |failed| exec.done(&run, node, failed)));
	}

	fn done(self: &Arc<Self>, run: &Arc<GraphRun>, node: NodeId, failed: bool) {
		if failed {
			run.failed.store(true, Ordering::SeqCst);
		} else {
			let ready: Vec<NodeId> = {
				let mut steps = lock(&run.steps);
				self.graph
					.required_by(node)
					.filter(|&next| {
						let step = steps.entry(next).or_insert_with(|| Step {
							requirements: self.graph.dependencies(next).count(),
							running: false,
						});
						step.requirements = step.requirements.saturating_sub(1);
						step.requirements == 0
					})
					.collect()
			};

			for next in ready {
				self.start(run, next);
			}
		}

		run.barrier.dec();
	}
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		format!("task panicked: {s}")
	} else if let Some(s) = panic.downcast_ref::<String>() {
		format!("task panicked: {s}")
	} else {
		String::from("task panicked with unknown payload")
	}
}

//! Generic task kinds working on files.
//!
//! These carry no toolchain knowledge, they only know how to tell when their
//! outputs are stale and how to get rid of them.

use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Value, json};

use crate::core::short_type_name;
use crate::engine::{Actions, StepContext, Task};
use crate::file::{EnsureOptions, File, FileCache, common_directory_path};
use crate::reporter::{Diagnostic, Reporter};

/// Input and output files of a task, and the staleness rules over them.
#[derive(Debug, Clone, Default)]
pub struct InOut {
	pub inputs: Vec<Arc<File>>,
	pub outputs: Vec<Arc<File>>,
}

impl InOut {
	pub fn new(inputs: Vec<Arc<File>>, outputs: Vec<Arc<File>>) -> Self {
		Self { inputs, outputs }
	}

	pub fn unique_key(&self) -> Value {
		let paths = |files: &[Arc<File>]| -> Vec<String> { files.iter().map(|f| f.path().to_string()).collect() };
		json!({
			"inputs": paths(&self.inputs),
			"outputs": paths(&self.outputs),
		})
	}

	/// Whether `build` has to run again.
	///
	/// With both inputs and outputs, any missing output or any file modified
	/// since the last success makes it required; missing output directories
	/// are created on the way. Otherwise only a task that never succeeded is
	/// required.
	pub fn is_build_required(&self, ctx: &StepContext<'_>) -> bool {
		let since = ctx.last_success_time();
		if self.inputs.is_empty() || self.outputs.is_empty() {
			return since == 0;
		}

		let files = ctx.files();
		let outputs = EnsureOptions {
			ensure_dir: true,
			..Default::default()
		};
		if !matches!(files.ensure(&self.outputs, since, outputs), Ok(false)) {
			return true;
		}

		!matches!(files.ensure(&self.inputs, since, EnsureOptions::default()), Ok(false))
	}

	/// Removes every output.
	pub fn clean(&self, reporter: &mut Reporter) {
		for output in &self.outputs {
			if let Err(e) = output.unlink() {
				reporter.diagnostic(Diagnostic::error(format!("couldn't remove file: {e}")).at(output.path().as_str()));
			}
		}
	}
}

/// The work of an [`InOutTask`].
pub trait Transform: Send + Sync + 'static {
	fn build(&self, files: &InOut, ctx: &mut StepContext<'_>) -> anyhow::Result<()>;

	/// Anything besides the file lists that changes the result.
	fn info(&self) -> Option<Value> {
		None
	}
}

/// Turns input files into output files, rebuilding only what is stale.
pub struct InOutTask<T> {
	pub files: InOut,
	transform: T,
}

impl<T: Transform> InOutTask<T> {
	pub fn new(inputs: Vec<Arc<File>>, outputs: Vec<Arc<File>>, transform: T) -> Self {
		Self {
			files: InOut::new(inputs, outputs),
			transform,
		}
	}

	pub fn transform(&self) -> &T {
		&self.transform
	}
}

impl<T: Transform> Task for InOutTask<T> {
	fn unique_key(&self) -> Option<Value> {
		let mut key = self.files.unique_key();
		if let Some(info) = self.transform.info() {
			key["info"] = info;
		}
		Some(key)
	}

	fn kind(&self) -> &'static str {
		short_type_name::<T>()
	}

	fn register(actions: &mut Actions<Self>) {
		actions
			.is_required("build", |task, ctx| Ok(task.files.is_build_required(ctx)))
			.run("build", |task, ctx| task.transform.build(&task.files, ctx))
			.run("clean", |task, ctx| {
				task.files.clean(&mut ctx.reporter);
				Ok(())
			});
	}

	fn output_files(&self) -> Vec<Arc<File>> {
		self.files.outputs.clone()
	}
}

/// Produces the content of a [`GenerateFileTask`].
pub trait Generate: Send + Sync + 'static {
	/// Identity of what gets generated, part of the task key.
	fn info(&self) -> Value;

	fn generate(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<Vec<u8>>;
}

/// Writes generated content to a single file.
pub struct GenerateFileTask<G> {
	files: InOut,
	generator: G,
}

impl<G: Generate> GenerateFileTask<G> {
	pub fn new(output: Arc<File>, generator: G) -> Self {
		Self {
			files: InOut::new(Vec::new(), vec![output]),
			generator,
		}
	}

	pub fn output(&self) -> &Arc<File> {
		&self.files.outputs[0]
	}
}

impl<G: Generate> Task for GenerateFileTask<G> {
	fn unique_key(&self) -> Option<Value> {
		let mut key = self.files.unique_key();
		key["info"] = self.generator.info();
		Some(key)
	}

	fn kind(&self) -> &'static str {
		short_type_name::<G>()
	}

	fn register(actions: &mut Actions<Self>) {
		actions
			.is_required("build", |task, ctx| Ok(task.files.is_build_required(ctx)))
			.run("build", |task, ctx| {
				let contents = task.generator.generate(ctx)?;
				let output = task.output();
				ctx.files()
					.write(output, contents)
					.with_context(|| format!("couldn't write {}", output.path()))
			})
			.run("clean", |task, ctx| {
				task.files.clean(&mut ctx.reporter);
				Ok(())
			});
	}

	fn output_files(&self) -> Vec<Arc<File>> {
		self.files.outputs.clone()
	}
}

/// Copies files next to each other, skipping copies already up to date.
#[derive(Debug, Default)]
pub struct CopyTask {
	/// `(from, to)` pairs.
	pairs: Vec<(Arc<File>, Arc<File>)>,
}

impl CopyTask {
	pub fn new() -> Self {
		Self::default()
	}

	/// Schedules a copy of `from` onto `to`; directories are not supported.
	pub fn will_copy_file(&mut self, reporter: &mut Reporter, from: Arc<File>, to: Arc<File>) {
		if from.is_directory() || to.is_directory() {
			reporter.warning(format!(
				"will_copy_file doesn't support copying directory, ignoring {}",
				from.path()
			));
		} else {
			self.pairs.push((from, to));
		}
	}

	/// Schedules a copy of every file into `out_dir`.
	///
	/// Files keep their bare name, unless `expand` is set: then they keep
	/// their path relative to the deepest directory common to all of them.
	pub fn will_copy_files(
		&mut self,
		files: &FileCache,
		reporter: &mut Reporter,
		sources: &[Arc<File>],
		out_dir: &Utf8Path,
		expand: bool,
	) -> Result<(), crate::error::FileError> {
		let common: Option<Utf8PathBuf> = expand.then(|| common_directory_path(sources));
		for source in sources {
			let relative = match &common {
				Some(common) if !common.as_str().is_empty() => source.relative_path(common),
				_ => Utf8PathBuf::from(source.name()),
			};
			let to = files.get(out_dir.join(relative), source.is_directory())?;
			self.will_copy_file(reporter, source.clone(), to);
		}
		Ok(())
	}

	pub fn pairs(&self) -> &[(Arc<File>, Arc<File>)] {
		&self.pairs
	}
}

impl Task for CopyTask {
	fn unique_key(&self) -> Option<Value> {
		let pairs: Vec<[&str; 2]> = self
			.pairs
			.iter()
			.map(|(from, to)| [from.path().as_str(), to.path().as_str()])
			.collect();
		Some(json!({ "copy": pairs }))
	}

	fn register(actions: &mut Actions<Self>) {
		actions
			.run("build", |task, ctx| {
				let since = ctx.last_success_time();
				for (from, to) in &task.pairs {
					if let Err(e) = ctx.files().copy_to(from, to, since, since) {
						ctx.reporter.diagnostic(
							Diagnostic::error(format!("couldn't copy file: {e}")).at(from.path().as_str()),
						);
					}
				}
				Ok(())
			})
			.run("clean", |task, ctx| {
				for (_, to) in &task.pairs {
					if let Err(e) = to.unlink() {
						ctx.reporter
							.diagnostic(Diagnostic::error(format!("couldn't remove file: {e}")).at(to.path().as_str()));
					}
				}
				Ok(())
			});
	}

	fn output_files(&self) -> Vec<Arc<File>> {
		self.pairs.iter().map(|(_, to)| to.clone()).collect()
	}
}

//! Filesystem entities shared by every task of a build.
//!
//! The [`FileCache`] hands out one [`File`] per absolute path, and remembers
//! which directories were already created so that tasks writing into the same
//! output directory only hit the filesystem once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::core::{lock, system_time_ms};
use crate::error::FileError;

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct File {
	path: Utf8PathBuf,
	is_directory: bool,
}

impl File {
	pub fn path(&self) -> &Utf8Path {
		&self.path
	}

	pub fn name(&self) -> &str {
		self.path.file_name().unwrap_or_default()
	}

	pub fn extension(&self) -> Option<&str> {
		self.path.extension()
	}

	pub fn is_directory(&self) -> bool {
		self.is_directory
	}

	/// Path of the directory holding this file.
	pub fn directory_path(&self) -> &Utf8Path {
		self.path.parent().unwrap_or(&self.path)
	}

	pub fn read_to_string(&self) -> io::Result<String> {
		fs::read_to_string(&self.path)
	}

	/// Modification time in milliseconds since the UNIX epoch.
	pub fn modified_ms(&self) -> io::Result<u64> {
		Ok(system_time_ms(fs::metadata(&self.path)?.modified()?))
	}

	/// Removes the file, a missing file is not an error.
	pub fn unlink(&self) -> io::Result<()> {
		match fs::remove_file(&self.path) {
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
			other => other,
		}
	}

	pub fn relative_path(&self, base: &Utf8Path) -> Utf8PathBuf {
		relative_to(&self.path, base)
	}

	/// Directory the memoised directory creation applies to.
	fn dir_to_ensure(&self) -> &Utf8Path {
		if self.is_directory {
			&self.path
		} else {
			self.directory_path()
		}
	}
}

/// Options of [`FileCache::ensure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
	/// Create the missing parent directories, and keep checking every file
	/// after the first change.
	pub ensure_dir: bool,
	/// Check the files concurrently.
	pub parallel: bool,
}

#[derive(Default)]
pub struct FileCache {
	files: Mutex<HashMap<Utf8PathBuf, Arc<File>>>,
	dirs: Mutex<HashSet<Utf8PathBuf>>,
}

impl FileCache {
	/// Returns the shared entity for `path`.
	///
	/// The path must be absolute, and is normalised lexically. Asking for the
	/// same path once as a file and once as a directory is an error.
	pub fn get(&self, path: impl AsRef<Utf8Path>, is_directory: bool) -> Result<Arc<File>, FileError> {
		let path = normalize(path.as_ref());
		if !path.is_absolute() {
			return Err(FileError::Relative(path));
		}

		let file = lock(&self.files)
			.entry(path.clone())
			.or_insert_with(|| Arc::new(File { path, is_directory }))
			.clone();

		if file.is_directory != is_directory {
			return Err(FileError::Incoherent(file.path.clone()));
		}

		Ok(file)
	}

	pub fn directory(&self, file: &File) -> Result<Arc<File>, FileError> {
		self.get(file.directory_path(), true)
	}

	pub fn common_directory(&self, files: &[Arc<File>]) -> Result<Arc<File>, FileError> {
		self.get(common_directory_path(files), true)
	}

	/// Creates the directory `file` lives in (or `file` itself when it is a
	/// directory), at most once per cache.
	pub fn ensure_dir(&self, file: &File) -> io::Result<()> {
		self.ensure_dir_path(file.dir_to_ensure())
	}

	fn ensure_dir_path(&self, dir: &Utf8Path) -> io::Result<()> {
		if lock(&self.dirs).contains(dir) {
			return Ok(());
		}

		// `create_dir_all` is idempotent, concurrent callers may both get here.
		fs::create_dir_all(dir)?;
		lock(&self.dirs).insert(dir.to_owned());
		Ok(())
	}

	/// Forgets every memoised directory creation.
	pub fn clear(&self) {
		lock(&self.dirs).clear();
	}

	/// Reports whether any of `files` changed after `time` (milliseconds).
	///
	/// A missing file is an error, unless `ensure_dir` is set: then its
	/// directory is created and the file counts as changed. Without
	/// `ensure_dir` the check stops at the first change or error.
	pub fn ensure(&self, files: &[Arc<File>], time: u64, options: EnsureOptions) -> io::Result<bool> {
		let EnsureOptions { ensure_dir, parallel } = options;

		let results: Vec<io::Result<bool>> = if parallel {
			files
				.par_iter()
				.map(|file| self.ensure_one(file, ensure_dir, time))
				.collect()
		} else {
			let mut results = Vec::with_capacity(files.len());
			for file in files {
				let result = self.ensure_one(file, ensure_dir, time);
				let stop = !ensure_dir && !matches!(result, Ok(false));
				results.push(result);
				if stop {
					break;
				}
			}
			results
		};

		let mut changed = false;
		let mut error = None;
		for result in results {
			match result {
				Ok(c) => changed |= c,
				Err(e) => error = Some(e),
			}
		}

		match error {
			Some(e) => Err(e),
			None => Ok(changed),
		}
	}

	fn ensure_one(&self, file: &File, ensure_dir: bool, time: u64) -> io::Result<bool> {
		if file.is_directory {
			if ensure_dir {
				self.ensure_dir_path(file.directory_path())?;
			}
			return Ok(ensure_dir);
		}

		match fs::metadata(&file.path) {
			Err(_) if ensure_dir => {
				self.ensure_dir(file)?;
				Ok(true)
			}
			Err(e) => Err(e),
			Ok(meta) if meta.is_file() => Ok(system_time_ms(meta.modified()?) > time),
			Ok(_) => Ok(false),
		}
	}

	/// Writes `contents`, creating the parent directory first.
	pub fn write(&self, file: &File, contents: impl AsRef<[u8]>) -> io::Result<()> {
		self.ensure_dir(file)?;
		fs::write(&file.path, contents)
	}

	/// Copies `from` onto `to`, keeping the source modification time.
	///
	/// The copy is skipped when the source is older than `start` and the
	/// destination exists and is older than `end`. Returns whether a copy
	/// happened.
	pub fn copy_to(&self, from: &File, to: &File, start: u64, end: u64) -> io::Result<bool> {
		let source = fs::metadata(&from.path)?;
		let source_mtime = source.modified()?;

		if let Ok(dest) = fs::metadata(&to.path)
			&& system_time_ms(source_mtime) < start
			&& system_time_ms(dest.modified()?) < end
		{
			return Ok(false);
		}

		self.ensure_dir(to)?;
		fs::copy(&from.path, &to.path)?;
		fs::File::options()
			.write(true)
			.open(&to.path)?
			.set_modified(source_mtime)?;

		Ok(true)
	}
}

impl std::fmt::Debug for FileCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FileCache")
			.field("files", &lock(&self.files).len())
			.field("dirs", &lock(&self.dirs).len())
			.finish()
	}
}

/// Deepest directory containing every one of `files`.
pub fn common_directory_path(files: &[Arc<File>]) -> Utf8PathBuf {
	let mut common: Option<Vec<Utf8Component<'_>>> = None;

	for file in files {
		let components: Vec<_> = file.path.components().collect();
		let considered = if file.is_directory {
			components.len()
		} else {
			components.len().saturating_sub(1)
		};

		match &mut common {
			None => common = Some(components[..considered].to_vec()),
			Some(common) => {
				let same = common
					.iter()
					.zip(&components[..considered])
					.take_while(|(a, b)| a == b)
					.count();
				common.truncate(same);
			}
		}
	}

	common.unwrap_or_default().into_iter().collect()
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
	let mut out = Utf8PathBuf::new();
	for component in path.components() {
		match component {
			Utf8Component::CurDir => {}
			Utf8Component::ParentDir => {
				if !out.pop() {
					out.push("..");
				}
			}
			other => out.push(other.as_str()),
		}
	}
	out
}

fn relative_to(path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
	let path: Vec<_> = path.components().collect();
	let base: Vec<_> = base.components().collect();
	let same = path.iter().zip(&base).take_while(|(a, b)| a == b).count();

	let mut out = Utf8PathBuf::new();
	for _ in same..base.len() {
		out.push("..");
	}
	for component in &path[same..] {
		out.push(component.as_str());
	}
	out
}

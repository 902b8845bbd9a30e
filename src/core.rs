use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::file::FileCache;

/// A JSON object shared between every storage handle opened on the same key.
pub(crate) type Document = Arc<Mutex<Map<String, Value>>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Milliseconds since the UNIX epoch, the time unit of every session record.
pub(crate) fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or_default()
}

pub(crate) fn system_time_ms(time: SystemTime) -> u64 {
	time.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or_default()
}

/// Where task session records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
	/// One JSON document per task under the target's `tasks` directory.
	Durable,
	/// Records live in the [`BuildEnv`] and vanish with it.
	InMemory,
}

/// The build environment shared by every task of one or more runs.
///
/// It owns the caches the engine needs across tasks: the file identity table,
/// the memoised directory creations, the JSON session documents already read
/// from disk and, in [`SessionMode::InMemory`], the session records
/// themselves. Dropping the environment drops every cache.
pub struct BuildEnv {
	mode: SessionMode,
	files: FileCache,
	documents: Mutex<HashMap<Utf8PathBuf, Document>>,
	memory: Mutex<HashMap<String, Document>>,
}

impl BuildEnv {
	pub fn new() -> Self {
		Self::with_mode(SessionMode::Durable)
	}

	pub fn in_memory() -> Self {
		Self::with_mode(SessionMode::InMemory)
	}

	pub fn with_mode(mode: SessionMode) -> Self {
		Self {
			mode,
			files: FileCache::default(),
			documents: Mutex::default(),
			memory: Mutex::default(),
		}
	}

	pub fn mode(&self) -> SessionMode {
		self.mode
	}

	pub fn files(&self) -> &FileCache {
		&self.files
	}

	/// Returns the cached document for `path`, or loads it with `load` and
	/// caches the result.
	pub(crate) fn document<E>(
		&self,
		path: &Utf8Path,
		load: impl FnOnce() -> Result<Map<String, Value>, E>,
	) -> Result<Document, E> {
		if let Some(document) = lock(&self.documents).get(path) {
			return Ok(document.clone());
		}

		// Reading happens outside the lock, the first insertion wins.
		let loaded = Arc::new(Mutex::new(load()?));
		let mut documents = lock(&self.documents);
		Ok(documents
			.entry(path.to_owned())
			.or_insert(loaded)
			.clone())
	}

	pub(crate) fn memory_document(&self, id: &str) -> Document {
		lock(&self.memory).entry(id.to_owned()).or_default().clone()
	}

	/// Forgets every cached document and directory creation.
	pub fn clear_caches(&self) {
		lock(&self.documents).clear();
		self.files.clear();
	}
}

impl Default for BuildEnv {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for BuildEnv {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BuildEnv")
			.field("mode", &self.mode)
			.field("documents", &lock(&self.documents).len())
			.field("memory", &lock(&self.memory).len())
			.finish()
	}
}

/// Options of a single [`Runner`](crate::Runner) invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunOptions {
	/// Ignore incremental state, every task is considered required.
	pub full: bool,
	/// Selects the `generate_<ide>` hook used by the `generate` action.
	pub ide: Option<String>,
	/// Number of tasks allowed to run at once, defaults to the CPU count.
	pub max_concurrent_tasks: Option<usize>,
	/// Anything else, handed over to task hooks untouched.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

/// Computes the session stable identity of a node.
///
/// `serde_json` keeps object keys sorted, so the compact encoding of the key
/// doesn't depend on the order it was built in. The encoding is hashed with
/// SHA-1.
pub(crate) fn stable_id(kind: &str, key: &Value) -> String {
	let digest = Sha1::digest(key.to_string().as_bytes());
	format!("{kind}-{}", crate::utils::hex(&digest))
}

/// Last path segment of a Rust type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
	let full = std::any::type_name::<T>();
	let base = full.split('<').next().unwrap_or(full);
	base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_stable_id_is_deterministic() {
		let a = stable_id("Copy", &json!({ "inputs": ["/a"], "outputs": ["/b"] }));
		let b = stable_id("Copy", &json!({ "inputs": ["/a"], "outputs": ["/b"] }));
		assert_eq!(a, b);
		assert!(a.starts_with("Copy-"));
		assert_eq!(a.len(), "Copy-".len() + 40);
	}

	#[test]
	fn test_stable_id_ignores_key_order() {
		let mut first = Map::new();
		first.insert("z".into(), json!(1));
		first.insert("a".into(), json!({ "y": 2, "b": 3 }));

		let mut second = Map::new();
		second.insert("a".into(), json!({ "b": 3, "y": 2 }));
		second.insert("z".into(), json!(1));

		assert_eq!(
			stable_id("T", &Value::Object(first)),
			stable_id("T", &Value::Object(second))
		);
	}

	#[test]
	fn test_stable_id_differs() {
		assert_ne!(stable_id("T", &json!([1, 2])), stable_id("T", &json!([2, 1])));
		assert_ne!(stable_id("A", &json!("x")), stable_id("B", &json!("x")));
	}

	#[test]
	fn test_stable_id_hashes_sorted_encoding() {
		let digest = Sha1::digest(r#"{"a":"q\"","b":[true,null,1.5]}"#.as_bytes());
		assert_eq!(
			stable_id("T", &json!({ "b": [true, null, 1.5], "a": "q\"" })),
			format!("T-{}", crate::utils::hex(&digest))
		);
	}

	#[test]
	fn test_short_type_name() {
		struct Local;
		assert_eq!(short_type_name::<Local>(), "Local");
		assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
	}

	#[test]
	fn test_run_options_from_json() {
		let options: RunOptions =
			serde_json::from_value(json!({ "full": true, "ide": "xcode", "jobs": 3 })).unwrap();
		assert!(options.full);
		assert_eq!(options.ide.as_deref(), Some("xcode"));
		assert_eq!(options.max_concurrent_tasks, None);
		assert_eq!(options.extra.get("jobs"), Some(&json!(3)));
	}

	#[test]
	fn test_memory_documents_are_shared() {
		let env = BuildEnv::in_memory();
		let first = env.memory_document("T-1");
		lock(&first).insert("k".into(), json!(1));
		let second = env.memory_document("T-1");
		assert_eq!(lock(&second).get("k"), Some(&json!(1)));
	}
}

//! Per task memory that survives between runs.
//!
//! A session record is a JSON object keyed by action name. Each action maps to
//! an [`ActionRecord`], and the reserved [`SHARED`] key holds task private
//! data common to every action.

use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{BuildEnv, Document, lock};
use crate::error::StorageError;
use crate::reporter::Diagnostic;

/// Key of the cross action data in a session record.
pub const SHARED: &str = "SHARED";

/// Storage backend of one task's session record.
///
/// `load` must be called before `get` and `set` mean anything, and the record
/// only becomes durable once `save` returns.
pub trait BuildSession: Send {
	fn load(&mut self) -> Result<(), StorageError>;

	fn save(&mut self) -> Result<(), StorageError>;

	fn get(&self, key: &str) -> Option<Value>;

	fn set(&mut self, key: &str, value: Value);

	fn all(&self) -> Map<String, Value>;
}

/// What a task remembers about its last run of one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionRecord {
	pub last_run_start_time: u64,
	pub last_run_end_time: u64,
	pub last_success_time: u64,
	pub logs: String,
	pub diagnostics: Vec<Diagnostic>,
	/// Task private keys stored next to the bookkeeping fields.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl ActionRecord {
	/// Reads a stored record, anything unreadable counts as "never run".
	pub fn from_stored(value: Option<Value>) -> Self {
		value
			.and_then(|value| serde_json::from_value(value).ok())
			.unwrap_or_default()
	}

	pub fn to_value(&self) -> Value {
		serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
	}
}

/// One JSON document per task, cached in the [`BuildEnv`] by path.
pub struct JsonFile {
	env: Arc<BuildEnv>,
	path: Utf8PathBuf,
	document: Option<Document>,
}

impl JsonFile {
	pub fn new(env: Arc<BuildEnv>, path: impl Into<Utf8PathBuf>) -> Self {
		Self {
			env,
			path: path.into(),
			document: None,
		}
	}

	pub fn path(&self) -> &Utf8Path {
		&self.path
	}
}

fn read_document(path: &Utf8Path) -> Result<Map<String, Value>, StorageError> {
	let text = match fs::read_to_string(path) {
		Ok(text) => text,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
		Err(e) => return Err(StorageError::Io(path.to_owned(), e)),
	};

	match serde_json::from_str::<Value>(&text) {
		Ok(Value::Object(map)) => Ok(map),
		Ok(_) => {
			tracing::warn!(%path, "Session record is not a JSON object, starting over");
			Ok(Map::new())
		}
		Err(e) => {
			tracing::warn!(%path, error = %e, "Unreadable session record, starting over");
			Ok(Map::new())
		}
	}
}

impl BuildSession for JsonFile {
	fn load(&mut self) -> Result<(), StorageError> {
		let path = self.path.clone();
		self.document = Some(self.env.document(&path, || read_document(&path))?);
		Ok(())
	}

	fn save(&mut self) -> Result<(), StorageError> {
		let Some(document) = &self.document else {
			return Ok(());
		};

		let bytes = serde_json::to_vec(&*lock(document))
			.map_err(|e| StorageError::Json(self.path.clone(), e))?;

		let io = |e| StorageError::Io(self.path.clone(), e);
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).map_err(io)?;
		}

		let temp = self.path.with_extension("tmp");
		fs::write(&temp, bytes).map_err(io)?;
		fs::rename(&temp, &self.path).map_err(io)?;
		Ok(())
	}

	fn get(&self, key: &str) -> Option<Value> {
		lock(self.document.as_ref()?).get(key).cloned()
	}

	fn set(&mut self, key: &str, value: Value) {
		if let Some(document) = &self.document {
			lock(document).insert(key.to_owned(), value);
		}
	}

	fn all(&self) -> Map<String, Value> {
		self.document
			.as_ref()
			.map(|document| lock(document).clone())
			.unwrap_or_default()
	}
}

/// Records kept in memory, shared through the [`BuildEnv`] when created with
/// [`InMemory::shared`].
#[derive(Default)]
pub struct InMemory {
	document: Document,
}

impl InMemory {
	pub fn shared(env: &BuildEnv, id: &str) -> Self {
		Self {
			document: env.memory_document(id),
		}
	}
}

impl BuildSession for InMemory {
	fn load(&mut self) -> Result<(), StorageError> {
		Ok(())
	}

	fn save(&mut self) -> Result<(), StorageError> {
		Ok(())
	}

	fn get(&self, key: &str) -> Option<Value> {
		lock(&self.document).get(key).cloned()
	}

	fn set(&mut self, key: &str, value: Value) {
		lock(&self.document).insert(key.to_owned(), value);
	}

	fn all(&self) -> Map<String, Value> {
		lock(&self.document).clone()
	}
}

/// Storage of nodes without a stable identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

impl BuildSession for Noop {
	fn load(&mut self) -> Result<(), StorageError> {
		Ok(())
	}

	fn save(&mut self) -> Result<(), StorageError> {
		Ok(())
	}

	fn get(&self, _: &str) -> Option<Value> {
		None
	}

	fn set(&mut self, _: &str, _: Value) {}

	fn all(&self) -> Map<String, Value> {
		Map::new()
	}
}

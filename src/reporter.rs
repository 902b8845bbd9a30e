use std::fmt::{Display, Write};

use serde::{Deserialize, Serialize};

/// Diagnostic severity, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
	#[serde(rename = "note")]
	Note,
	#[serde(rename = "warning")]
	Warning,
	#[serde(rename = "error")]
	Error,
	#[serde(rename = "fatal error")]
	Fatal,
}

impl Severity {
	/// Whether a diagnostic of this severity fails its task.
	pub fn is_failure(self) -> bool {
		matches!(self, Severity::Error | Severity::Fatal)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Severity::Note => "note",
			Severity::Warning => "warning",
			Severity::Error => "error",
			Severity::Fatal => "fatal error",
		}
	}
}

impl Display for Severity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
	#[serde(rename = "type")]
	pub severity: Severity,
	pub msg: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub category: Option<String>,
}

impl Diagnostic {
	pub fn new(severity: Severity, msg: impl Into<String>) -> Self {
		Self {
			severity,
			msg: msg.into(),
			path: None,
			category: None,
		}
	}

	pub fn note(msg: impl Into<String>) -> Self {
		Self::new(Severity::Note, msg)
	}

	pub fn warning(msg: impl Into<String>) -> Self {
		Self::new(Severity::Warning, msg)
	}

	pub fn error(msg: impl Into<String>) -> Self {
		Self::new(Severity::Error, msg)
	}

	pub fn fatal(msg: impl Into<String>) -> Self {
		Self::new(Severity::Fatal, msg)
	}

	/// Attaches the element or file the diagnostic is about.
	pub fn at(mut self, path: impl Into<String>) -> Self {
		self.path = Some(path.into());
		self
	}

	pub fn in_category(mut self, category: impl Into<String>) -> Self {
		self.category = Some(category.into());
		self
	}
}

impl Display for Diagnostic {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if let Some(path) = &self.path {
			write!(f, "{path}: ")?;
		}
		write!(f, "{}: {}", self.severity, self.msg)
	}
}

/// Position in a [`Reporter`] to come back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
	count: usize,
	failed: bool,
}

/// Collects the diagnostics and raw logs of one task run.
///
/// Any `error` or `fatal error` diagnostic flips [`Reporter::failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reporter {
	pub diagnostics: Vec<Diagnostic>,
	pub logs: String,
	pub failed: bool,
	categories: Vec<String>,
}

impl Reporter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn diagnostic(&mut self, mut diagnostic: Diagnostic) {
		if let Some(category) = self.categories.last() {
			diagnostic.category = Some(category.clone());
		}
		if diagnostic.severity.is_failure() {
			self.failed = true;
		}
		self.diagnostics.push(diagnostic);
	}

	pub fn note(&mut self, msg: impl Into<String>) {
		self.diagnostic(Diagnostic::note(msg));
	}

	pub fn warning(&mut self, msg: impl Into<String>) {
		self.diagnostic(Diagnostic::warning(msg));
	}

	/// Records an error returned by a hook, including its chain of causes.
	pub fn error(&mut self, error: &anyhow::Error) {
		self.diagnostic(Diagnostic::error(format!("{error:#}")));
	}

	pub fn fatal(&mut self, msg: impl Into<String>) {
		self.diagnostic(Diagnostic::fatal(msg));
	}

	pub fn log(&mut self, text: impl Display) {
		let _ = write!(self.logs, "{text}");
	}

	pub fn lognl(&mut self, text: impl Display) {
		let _ = writeln!(self.logs, "{text}");
	}

	/// Every diagnostic added until the matching [`Reporter::pop_category`]
	/// is tagged with `category`.
	pub fn push_category(&mut self, category: impl Into<String>) {
		self.categories.push(category.into());
	}

	pub fn pop_category(&mut self) -> Option<String> {
		self.categories.pop()
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			count: self.diagnostics.len(),
			failed: self.failed,
		}
	}

	pub fn rollback(&mut self, snapshot: Snapshot) {
		self.diagnostics.truncate(snapshot.count);
		self.failed = snapshot.failed;
	}

	pub fn diagnostics_after(&self, snapshot: Snapshot) -> &[Diagnostic] {
		self.diagnostics.get(snapshot.count..).unwrap_or_default()
	}

	pub fn has_changed(&self, snapshot: Snapshot) -> bool {
		self.failed != snapshot.failed || self.diagnostics.len() != snapshot.count
	}

	/// Takes over the diagnostics and logs of another reporter.
	pub fn aggregate(&mut self, other: &Reporter) {
		self.failed |= other.failed;
		self.logs.push_str(&other.logs);
		for diagnostic in &other.diagnostics {
			self.diagnostic(diagnostic.clone());
		}
	}

	pub fn description(&self) -> String {
		let mut desc = format!("{} diagnostics:\n", self.diagnostics.len());
		for diagnostic in &self.diagnostics {
			let _ = writeln!(desc, " - [{}] {}", diagnostic.severity, diagnostic.msg);
		}
		desc
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_failure_flag() {
		let mut reporter = Reporter::new();
		reporter.note("fine");
		reporter.warning("hmm");
		assert!(!reporter.failed);

		reporter.diagnostic(Diagnostic::error("broken").at("a.c"));
		assert!(reporter.failed);
		assert_eq!(reporter.diagnostics.len(), 3);
		assert_eq!(reporter.diagnostics[2].to_string(), "a.c: error: broken");
	}

	#[test]
	fn test_error_keeps_context() {
		let mut reporter = Reporter::new();
		let error = anyhow::anyhow!("disk full").context("cannot write out.o");
		reporter.error(&error);
		assert!(reporter.failed);
		assert_eq!(reporter.diagnostics[0].msg, "cannot write out.o: disk full");
	}

	#[test]
	fn test_snapshot_rollback() {
		let mut reporter = Reporter::new();
		reporter.note("kept");
		let snapshot = reporter.snapshot();
		assert!(!reporter.has_changed(snapshot));

		reporter.fatal("dropped");
		assert!(reporter.has_changed(snapshot));
		assert_eq!(reporter.diagnostics_after(snapshot).len(), 1);

		reporter.rollback(snapshot);
		assert!(!reporter.failed);
		assert_eq!(reporter.diagnostics.len(), 1);
		assert!(reporter.diagnostics_after(snapshot).is_empty());
	}

	#[test]
	fn test_categories() {
		let mut reporter = Reporter::new();
		reporter.push_category("link");
		reporter.warning("unused symbol");
		assert_eq!(reporter.pop_category().as_deref(), Some("link"));
		reporter.warning("plain");

		assert_eq!(reporter.diagnostics[0].category.as_deref(), Some("link"));
		assert_eq!(reporter.diagnostics[1].category, None);
	}

	#[test]
	fn test_aggregate_and_description() {
		let mut inner = Reporter::new();
		inner.lognl("cc -c a.c");
		inner.fatal("cycle");

		let mut outer = Reporter::new();
		outer.aggregate(&inner);
		assert!(outer.failed);
		assert_eq!(outer.logs, "cc -c a.c\n");
		assert_eq!(outer.description(), "1 diagnostics:\n - [fatal error] cycle\n");
	}

	#[test]
	fn test_serialized_shape() {
		let diagnostic = Diagnostic::fatal("boom").at("p:t");
		let json = serde_json::to_value(&diagnostic).unwrap();
		assert_eq!(
			json,
			serde_json::json!({ "type": "fatal error", "msg": "boom", "path": "p:t" })
		);
		let back: Diagnostic = serde_json::from_value(json).unwrap();
		assert_eq!(back, diagnostic);
	}
}

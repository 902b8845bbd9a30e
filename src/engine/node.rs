use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::stable_id;
use crate::engine::NodeId;
use crate::engine::task::ErasedTask;
use crate::target::TargetInfo;

/// Human readable name of a node, not unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeName {
	#[serde(rename = "type")]
	pub kind: String,
	pub name: String,
	#[serde(flatten)]
	pub extra: BTreeMap<String, String>,
}

impl NodeName {
	pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			name: name.into(),
			extra: BTreeMap::new(),
		}
	}

	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.extra.insert(key.into(), value.into());
		self
	}
}

impl Display for NodeName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.kind, self.name)
	}
}

/// Bookkeeping of a node able to hold other nodes.
#[derive(Default)]
pub(crate) struct Container {
	/// Children without any dependency.
	pub inputs: BTreeSet<NodeId>,
	/// Children nothing depends on.
	pub outputs: BTreeSet<NodeId>,
	pub children: Vec<NodeId>,
	pub target: Option<Arc<TargetInfo>>,
}

pub(crate) enum NodeKind {
	Task(Arc<dyn ErasedTask>),
	Graph(Container),
}

pub(crate) struct NodeData {
	pub name: NodeName,
	pub parent: Option<NodeId>,
	pub kind: NodeKind,
	/// Type part of the stable id.
	pub type_name: &'static str,
	/// Identity of containers, tasks provide theirs on demand.
	pub unique_key: Option<Value>,
	id: OnceLock<Option<String>>,
}

impl NodeData {
	pub fn new(name: NodeName, parent: Option<NodeId>, kind: NodeKind, type_name: &'static str) -> Self {
		Self {
			name,
			parent,
			kind,
			type_name,
			unique_key: None,
			id: OnceLock::new(),
		}
	}

	pub fn with_unique_key(mut self, key: Value) -> Self {
		self.unique_key = Some(key);
		self
	}

	/// Stable identity, computed on first use.
	pub fn id(&self) -> Option<&str> {
		self.id
			.get_or_init(|| {
				let key = match &self.kind {
					NodeKind::Task(task) => task.unique_key(),
					NodeKind::Graph(_) => self.unique_key.clone(),
				};
				key.map(|key| stable_id(self.type_name, &key))
			})
			.as_deref()
	}

	pub fn container(&self) -> Option<&Container> {
		match &self.kind {
			NodeKind::Graph(container) => Some(container),
			NodeKind::Task(_) => None,
		}
	}

	pub fn container_mut(&mut self) -> Option<&mut Container> {
		match &mut self.kind {
			NodeKind::Graph(container) => Some(container),
			NodeKind::Task(_) => None,
		}
	}

	pub fn task(&self) -> Option<&Arc<dyn ErasedTask>> {
		match &self.kind {
			NodeKind::Task(task) => Some(task),
			NodeKind::Graph(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_name_display_and_shape() {
		let name = NodeName::new("target", "app").with("variant", "debug");
		assert_eq!(name.to_string(), "target:app");

		let json = serde_json::to_value(&name).unwrap();
		assert_eq!(
			json,
			serde_json::json!({ "type": "target", "name": "app", "variant": "debug" })
		);
	}

	#[test]
	fn test_container_id_is_memoized() {
		let node = NodeData::new(
			NodeName::new("graph", "g"),
			None,
			NodeKind::Graph(Container::default()),
			"Graph",
		)
		.with_unique_key(serde_json::json!(["g"]));

		let first = node.id().map(str::to_owned);
		assert!(first.as_deref().is_some_and(|id| id.starts_with("Graph-")));
		assert_eq!(node.id(), first.as_deref());

		let anonymous = NodeData::new(
			NodeName::new("graph", "g"),
			None,
			NodeKind::Graph(Container::default()),
			"Graph",
		);
		assert_eq!(anonymous.id(), None);
	}
}

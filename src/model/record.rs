use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifies one syncable record: (entity, record id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
	pub entity: String,
	pub record_id: String,
}

impl RecordKey {
	pub fn new(entity: impl Into<String>, record_id: impl Into<String>) -> Self {
		Self {
			entity: entity.into(),
			record_id: record_id.into(),
		}
	}
}

impl fmt::Display for RecordKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.entity, self.record_id)
	}
}

/// A point-in-time copy of a record, either as held locally or as returned
/// by a backend. Snapshots are plain values: conflict history and events
/// store copies, never references into live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
	/// Entity (collection) name.
	pub entity: String,
	/// Record identifier, unique within the entity.
	pub id: String,
	/// Monotonic record version.
	pub version: u64,
	/// Last modification time as reported by the writer.
	#[serde(default)]
	pub updated_at: Option<DateTime<Utc>>,
	/// Record fields. Always a JSON object for well-formed records.
	pub props: Value,
	/// Deletion marker.
	#[serde(default)]
	pub tombstone: bool,
}

impl RecordSnapshot {
	pub fn new(entity: impl Into<String>, id: impl Into<String>, props: Value, version: u64) -> Self {
		Self {
			entity: entity.into(),
			id: id.into(),
			version,
			updated_at: None,
			props,
			tombstone: false,
		}
	}

	pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
		self.updated_at = Some(updated_at);
		self
	}

	pub fn with_tombstone(mut self, tombstone: bool) -> Self {
		self.tombstone = tombstone;
		self
	}

	pub fn key(&self) -> RecordKey {
		RecordKey::new(self.entity.clone(), self.id.clone())
	}

	/// Field map of the record, or `None` when `props` is not an object.
	pub fn fields(&self) -> Option<&Map<String, Value>> {
		self.props.as_object()
	}

	pub fn field(&self, name: &str) -> Option<&Value> {
		self.fields().and_then(|m| m.get(name))
	}

	/// Serialized size of the record fields in bytes.
	pub fn encoded_len(&self) -> usize {
		serde_json::to_vec(&self.props).map(|v| v.len()).unwrap_or(0)
	}

	/// SHA-256 over the canonical JSON encoding of the record fields.
	pub fn checksum(&self) -> String {
		crate::sync::delta::checksum(&self.props)
	}

	/// True when both snapshots carry the same fields and deletion state.
	pub fn same_content(&self, other: &RecordSnapshot) -> bool {
		self.tombstone == other.tombstone && self.props == other.props
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_record_key_display() {
		assert_eq!(RecordKey::new("notes", "1").to_string(), "notes/1");
	}

	#[test]
	fn test_same_content_ignores_version() {
		let a = RecordSnapshot::new("notes", "1", json!({"title": "A"}), 1);
		let b = RecordSnapshot::new("notes", "1", json!({"title": "A"}), 7);
		assert!(a.same_content(&b));
		assert!(!a.same_content(&b.clone().with_tombstone(true)));
	}

	#[test]
	fn test_checksum_is_order_independent() {
		let a = RecordSnapshot::new("notes", "1", json!({"a": 1, "b": 2}), 1);
		let b = RecordSnapshot::new("notes", "1", json!({"b": 2, "a": 1}), 1);
		assert_eq!(a.checksum(), b.checksum());
	}
}

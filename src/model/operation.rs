use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::record::RecordKey;
use crate::error::SyncError;

/// Queue tier. Lower variants are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Critical = 0,
	High = 1,
	Normal = 2,
	Low = 3,
}

impl Priority {
	pub const ALL: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

	pub fn index(self) -> usize {
		self as usize
	}

	/// One tier up; `Critical` stays `Critical`.
	pub fn promoted(self) -> Self {
		match self {
			Priority::Critical | Priority::High => Priority::Critical,
			Priority::Normal => Priority::High,
			Priority::Low => Priority::Normal,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Priority::Critical => "critical",
			Priority::High => "high",
			Priority::Normal => "normal",
			Priority::Low => "low",
		}
	}
}

impl Default for Priority {
	fn default() -> Self {
		Priority::Normal
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
	Create,
	Update,
	Delete,
}

/// Lifecycle of a queued operation.
///
/// `Pending -> InFlight -> {Succeeded | RecoverableFailure -> Pending | TerminalFailure -> DeadLetter}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
	Pending,
	InFlight,
	Succeeded,
	RecoverableFailure,
	TerminalFailure,
	DeadLetter,
	Cancelled,
}

/// One queued unit of sync work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
	pub id: String,
	pub entity: String,
	pub record_id: String,
	pub kind: OperationKind,
	/// Record fields for create/update; ignored for delete.
	#[serde(default)]
	pub payload: Option<Value>,
	pub priority: Priority,
	pub enqueued_at: DateTime<Utc>,
	pub attempts: u32,
	#[serde(default)]
	pub last_error: Option<SyncError>,
	/// Local record version this operation was created for. Assigned on enqueue.
	#[serde(default)]
	pub version: u64,
	/// Skip delta encoding and send the whole record.
	#[serde(default)]
	pub force_full: bool,
	pub state: OperationState,
}

impl SyncOperation {
	pub fn new(
		entity: impl Into<String>,
		record_id: impl Into<String>,
		kind: OperationKind,
		payload: Option<Value>,
	) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			entity: entity.into(),
			record_id: record_id.into(),
			kind,
			payload,
			priority: Priority::default(),
			enqueued_at: Utc::now(),
			attempts: 0,
			last_error: None,
			version: 0,
			force_full: false,
			state: OperationState::Pending,
		}
	}

	pub fn create(entity: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
		Self::new(entity, record_id, OperationKind::Create, Some(payload))
	}

	pub fn update(entity: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
		Self::new(entity, record_id, OperationKind::Update, Some(payload))
	}

	pub fn delete(entity: impl Into<String>, record_id: impl Into<String>) -> Self {
		Self::new(entity, record_id, OperationKind::Delete, None)
	}

	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	pub fn key(&self) -> RecordKey {
		RecordKey::new(self.entity.clone(), self.record_id.clone())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_priority_ordering() {
		assert!(Priority::Critical < Priority::High);
		assert!(Priority::High < Priority::Normal);
		assert!(Priority::Normal < Priority::Low);
	}

	#[test]
	fn test_priority_promotion() {
		assert_eq!(Priority::Low.promoted(), Priority::Normal);
		assert_eq!(Priority::Normal.promoted(), Priority::High);
		assert_eq!(Priority::High.promoted(), Priority::Critical);
		assert_eq!(Priority::Critical.promoted(), Priority::Critical);
	}

	#[test]
	fn test_operation_constructors() {
		let op = SyncOperation::update("notes", "1", json!({"title": "A"})).with_priority(Priority::High);
		assert_eq!(op.kind, OperationKind::Update);
		assert_eq!(op.priority, Priority::High);
		assert_eq!(op.attempts, 0);
		assert_eq!(op.state, OperationState::Pending);
		assert_eq!(op.key(), RecordKey::new("notes", "1"));

		let del = SyncOperation::delete("notes", "1");
		assert!(del.payload.is_none());
		assert_ne!(op.id, del.id);
	}
}

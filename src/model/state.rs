use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-record sync bookkeeping.
///
/// Invariant: `local_version >= last_synced_version`, and `dirty` is true
/// exactly when `local_version > last_synced_version`. Fields are private so
/// the invariant can only move through the methods below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecordState {
	local_version: u64,
	last_synced_version: u64,
	last_synced_at: Option<DateTime<Utc>>,
	dirty: bool,
}

impl SyncRecordState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn local_version(&self) -> u64 {
		self.local_version
	}

	pub fn last_synced_version(&self) -> u64 {
		self.last_synced_version
	}

	pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
		self.last_synced_at
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	/// Record a local mutation; returns the new local version.
	pub fn record_local_change(&mut self) -> u64 {
		self.local_version += 1;
		self.dirty = true;
		self.local_version
	}

	/// Both sides now agree on `version`.
	pub fn mark_synced(&mut self, version: u64, at: DateTime<Utc>) {
		self.local_version = version;
		self.last_synced_version = version;
		self.last_synced_at = Some(at);
		self.dirty = false;
	}

	/// True when the operation created for `version` has nothing left to do.
	pub fn is_settled(&self, version: u64) -> bool {
		!self.dirty && version <= self.last_synced_version
	}

	pub fn is_consistent(&self) -> bool {
		self.local_version >= self.last_synced_version
			&& self.dirty == (self.local_version > self.last_synced_version)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_local_change_marks_dirty() {
		let mut s = SyncRecordState::new();
		assert!(!s.is_dirty());
		assert_eq!(s.record_local_change(), 1);
		assert_eq!(s.record_local_change(), 2);
		assert!(s.is_dirty());
		assert_eq!(s.last_synced_version(), 0);
		assert!(s.is_consistent());
	}

	#[test]
	fn test_mark_synced_clears_dirty() {
		let mut s = SyncRecordState::new();
		s.record_local_change();
		s.mark_synced(1, Utc::now());
		assert!(!s.is_dirty());
		assert_eq!(s.local_version(), s.last_synced_version());
		assert!(s.last_synced_at().is_some());
		assert!(s.is_consistent());
	}

	#[test]
	fn test_settled_versions() {
		let mut s = SyncRecordState::new();
		let v = s.record_local_change();
		assert!(!s.is_settled(v));
		s.mark_synced(v, Utc::now());
		assert!(s.is_settled(v));
		assert!(!s.is_settled(v + 1));
	}
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SyncError;

/// Outcome of one operation or one batch. Returned to callers, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
	pub entity: Option<String>,
	pub success: bool,
	/// Records written locally or remotely.
	pub affected: usize,
	/// Conflicts detected and resolved.
	pub conflicts: usize,
	/// Operations that failed and were re-queued for retry.
	pub retried: usize,
	/// Operations moved to the dead-letter queue.
	pub dead_lettered: usize,
	/// The batch stopped early on a cancellation signal.
	pub cancelled: bool,
	/// First error encountered, if any.
	pub error: Option<SyncError>,
	pub duration: Duration,
}

impl SyncResult {
	pub fn ok(entity: impl Into<String>) -> Self {
		Self {
			entity: Some(entity.into()),
			success: true,
			..Self::default()
		}
	}

	pub fn failure(entity: impl Into<String>, error: SyncError) -> Self {
		Self {
			entity: Some(entity.into()),
			success: false,
			error: Some(error),
			..Self::default()
		}
	}

	/// Record a failure without losing an earlier, more relevant error.
	pub fn note_error(&mut self, error: SyncError) {
		self.success = false;
		if self.error.is_none() {
			self.error = Some(error);
		}
	}

	/// Fold another partial result into this one.
	pub fn absorb(&mut self, other: SyncResult) {
		self.affected += other.affected;
		self.conflicts += other.conflicts;
		self.retried += other.retried;
		self.dead_lettered += other.dead_lettered;
		self.cancelled |= other.cancelled;
		if !other.success {
			self.success = false;
		}
		if self.error.is_none() {
			self.error = other.error;
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_absorb_keeps_first_error() {
		let mut total = SyncResult::ok("notes");
		let mut a = SyncResult::ok("notes");
		a.affected = 2;
		total.absorb(a);
		assert!(total.success);

		total.absorb(SyncResult::failure("notes", SyncError::Network("a".into())));
		total.absorb(SyncResult::failure("notes", SyncError::Network("b".into())));
		assert!(!total.success);
		assert_eq!(total.affected, 2);
		assert_eq!(total.error, Some(SyncError::Network("a".into())));
	}
}

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::RecordKey;

/// Table of per-record exclusive locks.
///
/// Entries are created on demand and removed once the last holder or waiter
/// lets go, so the table only ever holds records with work in progress.
#[derive(Clone, Default)]
pub struct RecordLocks {
	table: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
}

impl RecordLocks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Wait for exclusive access to `key`.
	pub async fn acquire(&self, key: &RecordKey) -> RecordGuard {
		let slot = {
			let mut table = self.table.lock();
			Arc::clone(table.entry(key.clone()).or_default())
		};
		let guard = slot.lock_owned().await;
		RecordGuard {
			key: key.clone(),
			table: Arc::clone(&self.table),
			guard: Some(guard),
		}
	}

	/// Exclusive access to `key` if nobody holds it right now.
	pub fn try_acquire(&self, key: &RecordKey) -> Option<RecordGuard> {
		let slot = {
			let mut table = self.table.lock();
			Arc::clone(table.entry(key.clone()).or_default())
		};
		match slot.try_lock_owned() {
			Ok(guard) => Some(RecordGuard {
				key: key.clone(),
				table: Arc::clone(&self.table),
				guard: Some(guard),
			}),
			// The failed attempt has already released its handle on the slot.
			Err(_) => {
				self.cleanup(key);
				None
			}
		}
	}

	fn cleanup(&self, key: &RecordKey) {
		remove_if_idle(&self.table, key);
	}
}

fn remove_if_idle(table: &Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>, key: &RecordKey) {
	let mut table = table.lock();
	// Only the table itself still references the slot.
	if table.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
		table.remove(key);
	}
}

/// Held for the duration of one record's sync. Released on drop, on every
/// exit path.
pub struct RecordGuard {
	key: RecordKey,
	table: Arc<Mutex<HashMap<RecordKey, Arc<AsyncMutex<()>>>>>,
	guard: Option<OwnedMutexGuard<()>>,
}

impl RecordGuard {
	pub fn key(&self) -> &RecordKey {
		&self.key
	}
}

impl Drop for RecordGuard {
	fn drop(&mut self) {
		// Release the slot before checking whether it is idle.
		self.guard.take();
		remove_if_idle(&self.table, &self.key);
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::time::Duration;

	fn active(locks: &RecordLocks) -> usize {
		locks.table.lock().len()
	}

	#[tokio::test]
	async fn test_exclusive_per_record() {
		let locks = RecordLocks::new();
		let a = RecordKey::new("notes", "1");
		let b = RecordKey::new("notes", "2");

		let held = locks.acquire(&a).await;
		assert!(locks.try_acquire(&a).is_none());
		// A failed attempt leaves the holder's entry in place.
		assert_eq!(active(&locks), 1);
		// Other records are unaffected.
		assert!(locks.try_acquire(&b).is_some());

		drop(held);
		assert_eq!(active(&locks), 0);
		assert!(locks.try_acquire(&a).is_some());
	}

	#[tokio::test]
	async fn test_table_is_cleaned_up() {
		let locks = RecordLocks::new();
		let key = RecordKey::new("notes", "1");
		{
			let _g = locks.acquire(&key).await;
			assert_eq!(active(&locks), 1);
		}
		assert_eq!(active(&locks), 0);
	}

	#[tokio::test]
	async fn test_waiter_gets_lock_after_release() {
		let locks = RecordLocks::new();
		let key = RecordKey::new("notes", "1");
		let first = locks.acquire(&key).await;

		let waiter = {
			let locks = locks.clone();
			let key = key.clone();
			tokio::spawn(async move {
				let _g = locks.acquire(&key).await;
			})
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(!waiter.is_finished());

		drop(first);
		waiter.await.expect("waiter");
		assert_eq!(active(&locks), 0);
	}
}

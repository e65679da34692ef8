use chrono::{DateTime, Utc};
use log::{debug, error};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::model::{OperationState, Priority, SyncOperation};

/// A queued operation plus its scheduling metadata.
#[derive(Debug, Clone)]
pub struct QueueEntry {
	pub operation: SyncOperation,
	/// When the entry entered its current tier; reset on promotion.
	pub queued_at: Instant,
	/// Earliest time the entry may be released (retry backoff).
	pub ready_at: Instant,
}

/// Operation that exhausted its retries or failed terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
	pub operation: SyncOperation,
	pub error: SyncError,
	pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tiers {
	tiers: [VecDeque<QueueEntry>; 4],
	dead: Vec<DeadLetter>,
}

/// Four-tier FIFO queue with age-based promotion, delayed re-entry and a
/// dead-letter sub-queue. All access goes through `&self`.
pub struct OperationQueue {
	inner: Mutex<Tiers>,
	notify: Notify,
	aging_threshold: Duration,
}

impl OperationQueue {
	/// `aging_threshold` of zero disables promotion.
	pub fn new(aging_threshold: Duration) -> Self {
		Self {
			inner: Mutex::new(Tiers::default()),
			notify: Notify::new(),
			aging_threshold,
		}
	}

	pub fn push(&self, operation: SyncOperation) {
		self.push_delayed(operation, Duration::ZERO);
	}

	/// Enqueue an operation that may not be released before `delay` elapses.
	pub fn push_delayed(&self, mut operation: SyncOperation, delay: Duration) {
		let now = Instant::now();
		operation.state = OperationState::Pending;
		let tier = operation.priority.index();
		debug!(
			"queue: {} {}/{} into {} (delay {:?})",
			operation.id, operation.entity, operation.record_id, operation.priority, delay
		);
		self.inner.lock().tiers[tier].push_back(QueueEntry {
			operation,
			queued_at: now,
			ready_at: now + delay,
		});
		self.notify.notify_one();
	}

	/// Highest-priority ready operation, oldest first within a tier.
	pub fn pop_ready(&self) -> Option<QueueEntry> {
		self.pop_matching(|_| true)
	}

	pub fn pop_ready_for(&self, entity: &str) -> Option<QueueEntry> {
		self.pop_matching(|op| op.entity == entity)
	}

	/// Every ready operation of `entity`, in release order.
	pub fn drain_ready_for(&self, entity: &str) -> Vec<QueueEntry> {
		std::iter::from_fn(|| self.pop_ready_for(entity)).collect()
	}

	fn pop_matching(&self, pred: impl Fn(&SyncOperation) -> bool) -> Option<QueueEntry> {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		self.promote_locked(&mut inner, now);

		for tier in inner.tiers.iter_mut() {
			if let Some(idx) = tier
				.iter()
				.position(|e| e.ready_at <= now && pred(&e.operation))
			{
				return tier.remove(idx);
			}
		}
		None
	}

	/// Promote entries that waited past the aging threshold by one tier.
	/// Returns the number of promotions.
	pub fn promote_aged(&self) -> usize {
		let now = Instant::now();
		let mut inner = self.inner.lock();
		self.promote_locked(&mut inner, now)
	}

	fn promote_locked(&self, inner: &mut Tiers, now: Instant) -> usize {
		if self.aging_threshold.is_zero() {
			return 0;
		}
		let mut promoted = 0;
		for tier in 1..inner.tiers.len() {
			let mut stay = VecDeque::with_capacity(inner.tiers[tier].len());
			while let Some(mut entry) = inner.tiers[tier].pop_front() {
				if now.saturating_duration_since(entry.queued_at) >= self.aging_threshold {
					let from = entry.operation.priority;
					entry.operation.priority = from.promoted();
					entry.queued_at = now;
					debug!("queue: promoted {} from {} to {}", entry.operation.id, from, entry.operation.priority);
					inner.tiers[tier - 1].push_back(entry);
					promoted += 1;
				} else {
					stay.push_back(entry);
				}
			}
			inner.tiers[tier] = stay;
		}
		promoted
	}

	/// Earliest release time among queued entries of `entity` (any entity
	/// when `None`).
	pub fn next_ready_at(&self, entity: Option<&str>) -> Option<Instant> {
		let inner = self.inner.lock();
		inner
			.tiers
			.iter()
			.flatten()
			.filter(|e| entity.is_none_or(|n| e.operation.entity == n))
			.map(|e| e.ready_at)
			.min()
	}

	/// Resolves when an operation is pushed.
	pub fn notified(&self) -> Notified<'_> {
		self.notify.notified()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().tiers.iter().map(VecDeque::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn len_for(&self, entity: &str) -> usize {
		self.inner
			.lock()
			.tiers
			.iter()
			.flatten()
			.filter(|e| e.operation.entity == entity)
			.count()
	}

	/// Queue depth per tier, critical first.
	pub fn depth_by_tier(&self) -> [(Priority, usize); 4] {
		let inner = self.inner.lock();
		Priority::ALL.map(|p| (p, inner.tiers[p.index()].len()))
	}

	/// Entities with at least one queued operation.
	pub fn pending_entities(&self) -> Vec<String> {
		let inner = self.inner.lock();
		let mut names: Vec<String> = inner
			.tiers
			.iter()
			.flatten()
			.map(|e| e.operation.entity.clone())
			.collect();
		names.sort();
		names.dedup();
		names
	}

	/// Park an operation in the dead-letter sub-queue. It is never retried
	/// automatically.
	pub fn dead_letter(&self, mut operation: SyncOperation, error: SyncError) -> DeadLetter {
		operation.state = OperationState::DeadLetter;
		operation.last_error = Some(error.clone());
		let entry = DeadLetter {
			operation,
			error,
			failed_at: Utc::now(),
		};
		match serde_json::to_string(&entry) {
			Ok(json) => error!("dead-lettered sync operation: {}", json),
			Err(_) => error!("dead-lettered sync operation {}", entry.operation.id),
		}
		self.inner.lock().dead.push(entry.clone());
		entry
	}

	pub fn dead_letters(&self) -> Vec<DeadLetter> {
		self.inner.lock().dead.clone()
	}

	pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
		std::mem::take(&mut self.inner.lock().dead)
	}

	pub fn dead_letter_count(&self) -> usize {
		self.inner.lock().dead.len()
	}
}

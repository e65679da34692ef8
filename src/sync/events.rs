use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ErrorKind, SyncError};
use crate::model::ConflictStrategy;

/// Typed notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
	SyncStarted {
		entity: String,
	},
	SyncProgress {
		entity: String,
		percent: u8,
	},
	SyncCompleted {
		entity: String,
		affected: usize,
	},
	ConflictDetected {
		entity: String,
		record_id: String,
		fields: Vec<String>,
	},
	ConflictResolved {
		entity: String,
		record_id: String,
		strategy: ConflictStrategy,
		/// Fields resolved below the confidence threshold.
		review: Vec<String>,
	},
	SyncError {
		entity: String,
		record_id: Option<String>,
		error: SyncError,
		kind: ErrorKind,
		attempt: u32,
		/// Delay before the next attempt, absent when the error is final.
		retry_in: Option<Duration>,
		dead_lettered: bool,
	},
	SyncCancelled {
		entity: String,
		/// Operations left in the queue.
		remaining: usize,
	},
}

impl SyncEvent {
	pub fn entity(&self) -> &str {
		match self {
			SyncEvent::SyncStarted { entity }
			| SyncEvent::SyncProgress { entity, .. }
			| SyncEvent::SyncCompleted { entity, .. }
			| SyncEvent::ConflictDetected { entity, .. }
			| SyncEvent::ConflictResolved { entity, .. }
			| SyncEvent::SyncError { entity, .. }
			| SyncEvent::SyncCancelled { entity, .. } => entity,
		}
	}

	pub fn is_error(&self) -> bool {
		matches!(self, SyncEvent::SyncError { .. })
	}
}

/// Bounded fan-out bus. Publishing never blocks; a subscriber that falls
/// more than `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity.max(1));
		Self { tx }
	}

	pub fn publish(&self, event: SyncEvent) {
		if self.tx.send(event).is_err() {
			// no subscribers
			debug!("sync event dropped, no subscribers");
		}
	}

	pub fn subscribe(&self) -> EventSubscription {
		EventSubscription {
			rx: self.tx.subscribe(),
			lagged: 0,
		}
	}

	/// Subscription as a stream; lagged gaps are skipped silently.
	pub fn stream(&self) -> BoxStream<'static, SyncEvent> {
		BroadcastStream::new(self.tx.subscribe())
			.filter_map(|item| futures_util::future::ready(item.ok()))
			.boxed()
	}

	pub fn subscriber_count(&self) -> usize {
		self.tx.receiver_count()
	}
}

pub struct EventSubscription {
	rx: broadcast::Receiver<SyncEvent>,
	lagged: u64,
}

impl EventSubscription {
	/// Next event, or `None` once the bus is gone.
	pub async fn recv(&mut self) -> Option<SyncEvent> {
		loop {
			match self.rx.recv().await {
				Ok(ev) => return Some(ev),
				Err(RecvError::Lagged(n)) => {
					warn!("event subscriber lagged, {} events dropped", n);
					self.lagged += n;
				}
				Err(RecvError::Closed) => return None,
			}
		}
	}

	/// Non-blocking variant of [`recv`](Self::recv).
	pub fn try_recv(&mut self) -> Option<SyncEvent> {
		use broadcast::error::TryRecvError;
		loop {
			match self.rx.try_recv() {
				Ok(ev) => return Some(ev),
				Err(TryRecvError::Lagged(n)) => self.lagged += n,
				Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
			}
		}
	}

	/// Everything currently buffered.
	pub fn drain(&mut self) -> Vec<SyncEvent> {
		std::iter::from_fn(|| self.try_recv()).collect()
	}

	/// Events this subscriber lost to overflow.
	pub fn lagged(&self) -> u64 {
		self.lagged
	}
}

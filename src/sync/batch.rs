use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::adapter::Capabilities;
use crate::model::{RecordKey, SyncEntityConfig, SyncOperation};

/// Failure rate above which the adaptive selector drops to sequential.
const ADAPTIVE_FAILURE_LIMIT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
	/// One at a time, in queue order.
	Sequential,
	/// All at once, bounded by the orchestrator's semaphore.
	Parallel,
	/// Fixed-size groups through the adapter batch calls.
	Chunked,
	/// Pick one of the above from recent outcomes.
	Adaptive,
}

impl Default for BatchStrategy {
	fn default() -> Self {
		BatchStrategy::Adaptive
	}
}

/// How one batch of operations will be executed.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPlan {
	/// Concrete strategy, never `Adaptive`.
	pub strategy: BatchStrategy,
	/// Execution units: one op each for sequential, one unit of everything
	/// for parallel, groups of at most the chunk size for chunked.
	pub units: Vec<Vec<SyncOperation>>,
	/// Operations made redundant by a later operation on the same record.
	pub superseded: Vec<SyncOperation>,
}

impl BatchPlan {
	pub fn operation_count(&self) -> usize {
		self.units.iter().map(Vec::len).sum()
	}
}

#[derive(Debug, Clone, Copy)]
struct Sample {
	success: bool,
	latency: Duration,
}

/// Groups queued operations into network-efficient units.
pub struct BatchOptimizer {
	configured: BatchStrategy,
	chunk_size: usize,
	window_size: usize,
	latency_target: Duration,
	window: Mutex<VecDeque<Sample>>,
}

impl Default for BatchOptimizer {
	fn default() -> Self {
		Self::new(BatchStrategy::Adaptive, 50, 20, Duration::from_millis(750))
	}
}

impl BatchOptimizer {
	pub fn new(configured: BatchStrategy, chunk_size: usize, window_size: usize, latency_target: Duration) -> Self {
		Self {
			configured,
			chunk_size: chunk_size.max(1),
			window_size: window_size.max(1),
			latency_target,
			window: Mutex::new(VecDeque::new()),
		}
	}

	/// Feed the outcome of one adapter round trip to the adaptive selector.
	pub fn record(&self, success: bool, latency: Duration) {
		let mut window = self.window.lock();
		if window.len() >= self.window_size {
			window.pop_front();
		}
		window.push_back(Sample { success, latency });
	}

	/// Share of failed round trips in the current window.
	pub fn failure_rate(&self) -> f64 {
		let window = self.window.lock();
		if window.is_empty() {
			return 0.0;
		}
		window.iter().filter(|s| !s.success).count() as f64 / window.len() as f64
	}

	pub fn mean_latency(&self) -> Duration {
		let window = self.window.lock();
		if window.is_empty() {
			return Duration::ZERO;
		}
		window.iter().map(|s| s.latency).sum::<Duration>() / window.len() as u32
	}

	/// Strategy for `pending` operations of `entity` against a backend with
	/// `caps`.
	pub fn select(&self, caps: &Capabilities, entity: &SyncEntityConfig, pending: usize) -> BatchStrategy {
		if entity.strict_ordering || !caps.concurrent_writes {
			return BatchStrategy::Sequential;
		}
		let chunked_ok = caps.batch && caps.query && caps.max_batch_size > 1;

		match self.configured {
			BatchStrategy::Sequential => BatchStrategy::Sequential,
			BatchStrategy::Parallel => BatchStrategy::Parallel,
			BatchStrategy::Chunked if chunked_ok => BatchStrategy::Chunked,
			BatchStrategy::Chunked => BatchStrategy::Parallel,
			BatchStrategy::Adaptive => {
				if self.failure_rate() > ADAPTIVE_FAILURE_LIMIT {
					BatchStrategy::Sequential
				} else if chunked_ok
					&& pending >= 2 && (pending >= self.chunk_size / 2 || self.mean_latency() > self.latency_target)
				{
					BatchStrategy::Chunked
				} else {
					BatchStrategy::Parallel
				}
			}
		}
	}

	/// Coalesce `ops` and split them into execution units.
	pub fn plan(&self, ops: Vec<SyncOperation>, caps: &Capabilities, entity: &SyncEntityConfig) -> BatchPlan {
		let (ops, superseded) = coalesce(ops);
		let strategy = self.select(caps, entity, ops.len());
		let units = match strategy {
			BatchStrategy::Sequential => ops.into_iter().map(|op| vec![op]).collect(),
			BatchStrategy::Chunked => {
				let size = self.chunk_size.min(caps.max_batch_size).max(1);
				let mut units = Vec::new();
				let mut it = ops.into_iter().peekable();
				while it.peek().is_some() {
					units.push(it.by_ref().take(size).collect());
				}
				units
			}
			BatchStrategy::Parallel | BatchStrategy::Adaptive => {
				if ops.is_empty() {
					Vec::new()
				} else {
					vec![ops]
				}
			}
		};
		debug!(
			"batch plan for {}: {:?}, {} units, {} superseded",
			entity.name,
			strategy,
			units.len(),
			superseded.len()
		);
		BatchPlan {
			strategy,
			units,
			superseded,
		}
	}
}

/// Collapse several operations on one record into the latest one. The
/// survivor takes the position and the highest priority of the group.
pub fn coalesce(ops: Vec<SyncOperation>) -> (Vec<SyncOperation>, Vec<SyncOperation>) {
	let mut slots: HashMap<RecordKey, usize> = HashMap::new();
	let mut kept: Vec<SyncOperation> = Vec::with_capacity(ops.len());
	let mut superseded = Vec::new();

	for op in ops {
		match slots.get(&op.key()) {
			Some(&idx) => {
				let current = &mut kept[idx];
				let priority = current.priority.min(op.priority);
				if op.version >= current.version {
					let mut newer = op;
					newer.priority = priority;
					superseded.push(std::mem::replace(current, newer));
				} else {
					current.priority = priority;
					superseded.push(op);
				}
			}
			None => {
				slots.insert(op.key(), kept.len());
				kept.push(op);
			}
		}
	}
	(kept, superseded)
}

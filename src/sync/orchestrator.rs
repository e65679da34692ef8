//! Top-level sync coordinator.
//!
//! Local mutations are applied to the [`LocalStore`] and queued. Queued
//! operations are released either by an explicit `sync_entity` / `flush`, or
//! by the background dispatcher started with [`SyncOrchestrator::start`].
//! Every record goes through the same pipeline while its lock is held: read
//! the remote copy, compare versions, then push, apply or resolve.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::{BoxStream, FuturesUnordered};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::auth::{AuthState, TokenManager};
use super::batch::{BatchOptimizer, BatchStrategy};
use super::compression::{Algorithm, CompressionPriority, Compressor};
use super::conflict::{ConflictEngine, ConflictHistory, SyncConflict};
use super::delta::DeltaCalculator;
use super::events::{EventBus, EventSubscription, SyncEvent};
use super::locks::{RecordGuard, RecordLocks};
use super::queue::{DeadLetter, OperationQueue};
use super::registry::{EntityRegistry, LocalStore};
use super::retry::{RetryPolicy, Transition};
use super::scheduler::{SchedulerConfig, SmartScheduler, SystemConditions};
use crate::adapter::query::FIELD_UPDATED_AT;
use crate::adapter::{
	AuthContext, BackendAdapter, ChangeKind, Filter, Query, SortDirection, WritePayload,
};
use crate::error::{ErrorKind, SyncError, SyncResultOf};
use crate::model::{
	OperationState, Priority, RecordKey, RecordSnapshot, SyncEntityConfig, SyncOperation,
	SyncRecordState, SyncResult,
};
use crate::observability::MetricsRegistry;

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
	/// Upper bound on concurrently executing record syncs.
	pub concurrency_limit: usize,
	/// Per adapter call.
	pub operation_timeout: Duration,
	/// Queue wait after which an operation is promoted one tier.
	pub aging_threshold: Duration,
	pub retry: RetryPolicy,
	pub batch_strategy: BatchStrategy,
	pub chunk_size: usize,
	pub adaptive_window: usize,
	pub latency_target: Duration,
	pub compression_enabled: bool,
	pub compression_threshold: usize,
	pub compression_probe: usize,
	pub confidence_threshold: f64,
	pub history_capacity: usize,
	pub scheduler: SchedulerConfig,
	/// How often the background scheduler looks for due entities.
	pub scheduler_tick: Duration,
	pub event_capacity: usize,
	pub auth_refresh_margin: Duration,
	/// Re-read/re-resolve rounds after an optimistic write conflict.
	pub max_conflict_rounds: u32,
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		Self {
			concurrency_limit: 4,
			operation_timeout: Duration::from_secs(30),
			aging_threshold: Duration::from_secs(60),
			retry: RetryPolicy::default(),
			batch_strategy: BatchStrategy::Adaptive,
			chunk_size: 50,
			adaptive_window: 20,
			latency_target: Duration::from_millis(750),
			compression_enabled: true,
			compression_threshold: 4096,
			compression_probe: 4096,
			confidence_threshold: 0.5,
			history_capacity: 256,
			scheduler: SchedulerConfig::default(),
			scheduler_tick: Duration::from_secs(1),
			event_capacity: 1024,
			auth_refresh_margin: Duration::from_secs(60),
			max_conflict_rounds: 3,
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
struct Attempt {
	/// Local version the queued operation was created for; `None` for
	/// pulls and pushed change events.
	version: Option<u64>,
	force_full: bool,
}

impl Attempt {
	fn pull() -> Self {
		Self::default()
	}
}

#[derive(Debug, Clone, Copy, Default)]
struct RecordOutcome {
	affected: usize,
	conflicts: usize,
}

impl RecordOutcome {
	fn applied(changed: bool) -> Self {
		Self {
			affected: usize::from(changed),
			conflicts: 0,
		}
	}
}

struct Progress {
	entity: String,
	total: usize,
	done: usize,
}

impl Progress {
	fn new(entity: &str, total: usize) -> Self {
		Self {
			entity: entity.to_string(),
			total,
			done: 0,
		}
	}

	fn step(&mut self, events: &EventBus) {
		self.done += 1;
		if self.total == 0 {
			return;
		}
		let percent = (self.done * 100 / self.total).min(100) as u8;
		events.publish(SyncEvent::SyncProgress {
			entity: self.entity.clone(),
			percent,
		});
	}
}

/// Coordinates queue, scheduler, conflict engine and adapter.
pub struct SyncOrchestrator {
	adapter: Arc<dyn BackendAdapter>,
	registry: Arc<EntityRegistry>,
	store: Arc<LocalStore>,
	queue: OperationQueue,
	locks: RecordLocks,
	events: EventBus,
	conflicts: ConflictEngine,
	history: ConflictHistory,
	scheduler: SmartScheduler,
	batcher: BatchOptimizer,
	compressor: Compressor,
	delta: DeltaCalculator,
	retry: RetryPolicy,
	auth: AuthState,
	permits: Arc<Semaphore>,
	config: OrchestratorConfig,
	metrics: Option<Arc<MetricsRegistry>>,
	shutdown: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	/// Operations held until a usable auth context is supplied.
	parked: Mutex<Vec<SyncOperation>>,
}

impl SyncOrchestrator {
	pub fn new(
		adapter: Arc<dyn BackendAdapter>,
		registry: Arc<EntityRegistry>,
		store: Arc<LocalStore>,
		config: OrchestratorConfig,
	) -> Self {
		let scheduler = SmartScheduler::new(config.scheduler.clone());
		for entity in registry.all() {
			scheduler.register(&entity.name, entity.priority);
		}
		info!(
			"Sync orchestrator using backend '{}' ({} entities, concurrency {})",
			adapter.name(),
			registry.len(),
			config.concurrency_limit
		);

		Self {
			queue: OperationQueue::new(config.aging_threshold),
			locks: RecordLocks::new(),
			events: EventBus::new(config.event_capacity),
			conflicts: ConflictEngine::new(config.confidence_threshold),
			history: ConflictHistory::new(config.history_capacity),
			scheduler,
			batcher: BatchOptimizer::new(
				config.batch_strategy,
				config.chunk_size,
				config.adaptive_window,
				config.latency_target,
			),
			compressor: Compressor::new(
				config.compression_enabled,
				config.compression_threshold,
				config.compression_probe,
			),
			delta: DeltaCalculator::default(),
			retry: config.retry.clone(),
			auth: AuthState::new(config.auth_refresh_margin),
			permits: Arc::new(Semaphore::new(config.concurrency_limit.max(1))),
			metrics: None,
			shutdown: CancellationToken::new(),
			tasks: Mutex::new(Vec::new()),
			parked: Mutex::new(Vec::new()),
			adapter,
			registry,
			store,
			config,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn register_entity(&self, config: SyncEntityConfig) -> SyncResultOf<Arc<SyncEntityConfig>> {
		let config = self.registry.register(config)?;
		self.scheduler.register(&config.name, config.priority);
		Ok(config)
	}

	pub async fn set_auth_context(&self, ctx: AuthContext) {
		self.auth.set(ctx).await;
		let parked: Vec<SyncOperation> = std::mem::take(&mut *self.parked.lock());
		if !parked.is_empty() {
			info!("Re-queueing {} operations held for authentication", parked.len());
		}
		for op in parked {
			self.queue.push(op);
		}
		self.update_queue_gauges();
	}

	pub async fn clear_auth_context(&self) {
		self.auth.clear().await;
	}

	pub async fn set_token_manager(&self, manager: Arc<dyn TokenManager>) {
		self.auth.set_token_manager(manager).await;
	}

	pub fn set_conditions(&self, conditions: SystemConditions) {
		self.scheduler.set_conditions(conditions);
	}

	/// Apply a local mutation and queue it for sync.
	///
	/// An operation that already carries a version (for instance one taken
	/// from the dead-letter queue) is queued as is, without touching the
	/// local store.
	pub async fn enqueue(&self, mut op: SyncOperation) -> SyncResultOf<SyncOperation> {
		let cfg = self.registry.get(&op.entity)?;
		if !cfg.sync_direction.uploads() {
			return Err(SyncError::Validation(format!(
				"entity '{}' is download-only",
				cfg.name
			)));
		}

		if op.version == 0 {
			let _guard = self.locks.acquire(&op.key()).await;
			let snapshot =
				self.store
					.apply_local_change(&op.entity, &op.record_id, op.kind, op.payload.as_ref())?;
			op.version = snapshot.version;
		} else {
			op.attempts = 0;
			op.force_full = false;
			op.last_error = None;
		}

		debug!(
			"Enqueued {:?} {}/{} v{} at {}",
			op.kind, op.entity, op.record_id, op.version, op.priority
		);
		self.queue.push(op.clone());
		self.update_queue_gauges();
		Ok(op)
	}

	pub async fn sync_entity(&self, name: &str) -> SyncResult {
		self.sync_entity_with_cancel(name, self.shutdown.child_token()).await
	}

	/// Push queued operations of `name`, then pull remote changes. The
	/// cancellation signal is checked between records.
	pub async fn sync_entity_with_cancel(&self, name: &str, cancel: CancellationToken) -> SyncResult {
		let started = Instant::now();
		let cfg = match self.registry.get(name) {
			Ok(cfg) => cfg,
			Err(e) => return SyncResult::failure(name, e),
		};

		self.events.publish(SyncEvent::SyncStarted {
			entity: cfg.name.clone(),
		});
		let mut result = SyncResult::ok(name);

		if let Some(pushed) = self.push_phase(&cfg, &cancel).await {
			result.absorb(pushed);
		}

		if !result.cancelled && cfg.sync_direction.downloads() && self.adapter.capabilities().query {
			if self.gated(&cfg).await {
				result.note_error(awaiting_auth());
			} else {
				match self.pull(&cfg, &cancel).await {
					Ok(pulled) => result.absorb(pulled),
					Err(e) => {
						warn!("Pull of '{}' failed: {}", cfg.name, e);
						self.publish_error(&cfg.name, None, &e, 0, None, false);
						result.note_error(e);
					}
				}
			}
		}

		result.duration = started.elapsed();
		self.scheduler
			.record_sync(&cfg.name, result.duration, result.affected, !result.success);

		if result.cancelled {
			self.events.publish(SyncEvent::SyncCancelled {
				entity: cfg.name.clone(),
				remaining: self.queue.len_for(&cfg.name),
			});
		} else {
			self.events.publish(SyncEvent::SyncCompleted {
				entity: cfg.name.clone(),
				affected: result.affected,
			});
		}
		self.update_queue_gauges();

		info!(
			"Synced '{}': success={} affected={} conflicts={} retried={} dead_lettered={} in {:?}",
			cfg.name,
			result.success,
			result.affected,
			result.conflicts,
			result.retried,
			result.dead_lettered,
			result.duration
		);
		result
	}

	/// Sync every registered entity, highest priority first.
	pub async fn sync_all(&self) -> HashMap<String, SyncResult> {
		let mut results = HashMap::new();
		for cfg in self.registry.all() {
			let result = self.sync_entity(&cfg.name).await;
			results.insert(cfg.name.clone(), result);
		}
		results
	}

	/// Process queued operations until the queue is empty, waiting out
	/// retry backoff. Does not pull.
	pub async fn flush(&self) -> SyncResult {
		let started = Instant::now();
		let cancel = self.shutdown.child_token();
		let mut result = SyncResult {
			success: true,
			..SyncResult::default()
		};

		loop {
			if cancel.is_cancelled() {
				result.cancelled = true;
				break;
			}
			let mut ran = false;
			for name in self.queue.pending_entities() {
				let cfg = match self.registry.get(&name) {
					Ok(cfg) => cfg,
					Err(e) => {
						for entry in self.queue.drain_ready_for(&name) {
							self.queue.dead_letter(entry.operation, e.clone());
						}
						continue;
					}
				};
				if let Some(pushed) = self.push_phase(&cfg, &cancel).await {
					ran = true;
					result.absorb(pushed);
				}
			}
			if ran {
				continue;
			}
			match self.queue.next_ready_at(None) {
				Some(at) => tokio::time::sleep_until(at).await,
				None => break,
			}
		}

		result.duration = started.elapsed();
		self.update_queue_gauges();
		result
	}

	/// Subscribe to remote changes of `name` and feed them through the
	/// record pipeline until shutdown.
	pub async fn watch_entity(self: &Arc<Self>, name: &str) -> SyncResultOf<()> {
		let cfg = self.registry.get(name)?;
		if !self.adapter.capabilities().subscribe {
			return Err(SyncError::Unsupported(format!("subscribe on backend '{}'", self.adapter.name())));
		}
		let ctx = self.auth_context(&cfg).await?;
		let mut changes = self.adapter.subscribe(&ctx, &cfg.name, &Filter::all()).await?;
		info!("Watching remote changes of '{}'", cfg.name);

		let this = Arc::clone(self);
		let shutdown = self.shutdown.clone();
		let handle = tokio::spawn(async move {
			loop {
				let change = tokio::select! {
					_ = shutdown.cancelled() => break,
					change = changes.next() => change,
				};
				let Some(change) = change else { break };

				let key = RecordKey::new(&change.entity, &change.record_id);
				let provided = match (change.kind, change.record) {
					(_, Some(record)) => Some(Some(record)),
					(ChangeKind::Deleted, None) => Some(None),
					(_, None) => None,
				};
				this.events.publish(SyncEvent::SyncStarted {
					entity: cfg.name.clone(),
				});
				match this.sync_record(&cfg, &key, Attempt::pull(), provided).await {
					Ok(outcome) => {
						this.events.publish(SyncEvent::SyncCompleted {
							entity: cfg.name.clone(),
							affected: outcome.affected,
						});
					}
					Err(e) => {
						warn!("Change event for {} failed: {}", key, e);
						this.publish_error(&cfg.name, Some(key.record_id.as_str()), &e, 0, None, false);
					}
				}
			}
			debug!("Watch on '{}' ended", cfg.name);
		});
		self.tasks.lock().push(handle);
		Ok(())
	}

	/// Start the background dispatcher and scheduler loops.
	pub async fn start(self: Arc<Self>) {
		info!("Starting sync orchestrator");

		let dispatcher = tokio::spawn(Arc::clone(&self).dispatch_loop());
		let scheduler = tokio::spawn(Arc::clone(&self).schedule_loop());
		self.tasks.lock().extend([dispatcher, scheduler]);
	}

	/// Stop background work. Records in flight finish their current call.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
		for task in tasks {
			if let Err(e) = task.await {
				warn!("Background sync task ended abnormally: {}", e);
			}
		}
		info!("Sync orchestrator stopped");
	}

	pub fn record(&self, entity: &str, id: &str) -> Option<RecordSnapshot> {
		self.store.snapshot(entity, id)
	}

	pub fn record_state(&self, entity: &str, id: &str) -> Option<SyncRecordState> {
		self.store.state(entity, id)
	}

	pub fn dead_letters(&self) -> Vec<DeadLetter> {
		self.queue.dead_letters()
	}

	pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
		self.queue.drain_dead_letters()
	}

	/// Dead-letter queue as a JSON array.
	pub fn export_dead_letters(&self) -> SyncResultOf<String> {
		Ok(serde_json::to_string_pretty(&self.queue.dead_letters())?)
	}

	pub fn conflict_history(&self) -> &ConflictHistory {
		&self.history
	}

	pub fn subscribe_events(&self) -> EventSubscription {
		self.events.subscribe()
	}

	pub fn event_stream(&self) -> BoxStream<'static, SyncEvent> {
		self.events.stream()
	}

	pub fn pending_operations(&self) -> usize {
		self.queue.len()
	}

	pub fn parked_operations(&self) -> usize {
		self.parked.lock().len()
	}

	pub fn registry(&self) -> &EntityRegistry {
		&self.registry
	}

	pub fn store(&self) -> &LocalStore {
		&self.store
	}

	pub fn scheduler(&self) -> &SmartScheduler {
		&self.scheduler
	}

	async fn dispatch_loop(self: Arc<Self>) {
		debug!("Sync dispatcher started");
		'outer: loop {
			while let Some(entry) = self.queue.pop_ready() {
				let permit = tokio::select! {
					_ = self.shutdown.cancelled() => {
						self.queue.push(entry.operation);
						break 'outer;
					}
					permit = Arc::clone(&self.permits).acquire_owned() => permit,
				};
				let Ok(permit) = permit else {
					self.queue.push(entry.operation);
					break 'outer;
				};
				let this = Arc::clone(&self);
				tokio::spawn(async move {
					this.dispatch_one(entry.operation).await;
					drop(permit);
				});
			}
			self.update_queue_gauges();

			let wait = self
				.queue
				.next_ready_at(None)
				.map(|at| at.saturating_duration_since(Instant::now()))
				.unwrap_or(self.config.scheduler_tick);
			tokio::select! {
				_ = self.shutdown.cancelled() => break,
				_ = self.queue.notified() => {}
				_ = tokio::time::sleep(wait) => {}
			}
		}
		debug!("Sync dispatcher stopped");
	}

	async fn dispatch_one(&self, op: SyncOperation) {
		let cfg = match self.registry.get(&op.entity) {
			Ok(cfg) => cfg,
			Err(e) => {
				self.queue.dead_letter(op, e);
				return;
			}
		};
		if self.gated(&cfg).await {
			self.park(op);
			return;
		}
		self.events.publish(SyncEvent::SyncStarted {
			entity: cfg.name.clone(),
		});
		let result = self.run_operation(&cfg, op).await;
		// Failures were already reported as error events.
		if result.success {
			self.events.publish(SyncEvent::SyncCompleted {
				entity: cfg.name.clone(),
				affected: result.affected,
			});
		}
	}

	async fn schedule_loop(self: Arc<Self>) {
		loop {
			// Wake for the earliest due entity, and at least once per tick
			// for queue aging.
			let wait = self
				.scheduler
				.next_due_in()
				.map_or(self.config.scheduler_tick, |due| due.min(self.config.scheduler_tick));
			tokio::select! {
				_ = self.shutdown.cancelled() => break,
				_ = tokio::time::sleep(wait) => {}
			}
			let promoted = self.queue.promote_aged();
			if promoted > 0 {
				debug!("Promoted {} aged operations", promoted);
			}
			for name in self.scheduler.take_due() {
				if self.shutdown.is_cancelled() {
					break;
				}
				self.sync_entity(&name).await;
			}
		}
		debug!("Sync scheduler stopped");
	}

	/// Run every ready operation of one entity. `None` when nothing was
	/// ready.
	async fn push_phase(&self, cfg: &Arc<SyncEntityConfig>, cancel: &CancellationToken) -> Option<SyncResult> {
		let ops: Vec<SyncOperation> = self
			.queue
			.drain_ready_for(&cfg.name)
			.into_iter()
			.map(|entry| entry.operation)
			.collect();
		if ops.is_empty() {
			return None;
		}

		if self.gated(cfg).await {
			info!("Holding {} '{}' operations until an auth context is set", ops.len(), cfg.name);
			for op in ops {
				self.park(op);
			}
			return Some(SyncResult::failure(&cfg.name, awaiting_auth()));
		}

		let caps = self.adapter.capabilities();
		let plan = self.batcher.plan(ops, &caps, cfg);
		let mut result = SyncResult::ok(&cfg.name);
		let mut progress = Progress::new(&cfg.name, plan.operation_count());

		for op in &plan.superseded {
			debug!("{}/{} v{} superseded by a later operation", op.entity, op.record_id, op.version);
			if let Some(m) = &self.metrics {
				m.operation(&cfg.name, "superseded");
			}
		}

		match plan.strategy {
			BatchStrategy::Sequential => {
				for op in plan.units.into_iter().flatten() {
					if cancel.is_cancelled() {
						self.queue.push(op);
						result.cancelled = true;
						continue;
					}
					let Ok(_permit) = self.permits.acquire().await else {
						self.queue.push(op);
						result.note_error(limiter_closed());
						continue;
					};
					result.absorb(self.run_operation(cfg, op).await);
					progress.step(&self.events);
				}
			}
			BatchStrategy::Chunked => {
				for unit in plan.units {
					if cancel.is_cancelled() {
						for op in unit {
							self.queue.push(op);
						}
						result.cancelled = true;
						continue;
					}
					result.absorb(self.run_chunk(cfg, unit, cancel, &mut progress).await);
				}
			}
			BatchStrategy::Parallel | BatchStrategy::Adaptive => {
				for unit in plan.units {
					result.absorb(self.run_parallel(cfg, unit, cancel, &mut progress).await);
				}
			}
		}
		Some(result)
	}

	/// Run `ops` concurrently under the shared semaphore. Permits are taken
	/// in queue order, so higher tiers start first.
	async fn run_parallel(
		&self,
		cfg: &Arc<SyncEntityConfig>,
		ops: Vec<SyncOperation>,
		cancel: &CancellationToken,
		progress: &mut Progress,
	) -> SyncResult {
		let mut result = SyncResult::ok(&cfg.name);
		let mut running = FuturesUnordered::new();

		for op in ops {
			if cancel.is_cancelled() {
				self.queue.push(op);
				result.cancelled = true;
				continue;
			}
			let permit = loop {
				tokio::select! {
					biased;
					Some(done) = running.next(), if !running.is_empty() => {
						progress.step(&self.events);
						result.absorb(done);
					}
					permit = Arc::clone(&self.permits).acquire_owned() => break permit,
				}
			};
			let Ok(permit) = permit else {
				self.queue.push(op);
				result.note_error(limiter_closed());
				continue;
			};
			running.push(async move {
				let outcome = self.run_operation(cfg, op).await;
				drop(permit);
				outcome
			});
		}

		while let Some(done) = running.next().await {
			progress.step(&self.events);
			result.absorb(done);
		}
		result
	}

	/// Submit a group of plain pushes through the adapter batch calls.
	/// Operations that need a conflict decision, deletions, and anything in
	/// a failed batch go through the per-record path afterwards.
	async fn run_chunk(
		&self,
		cfg: &Arc<SyncEntityConfig>,
		unit: Vec<SyncOperation>,
		cancel: &CancellationToken,
		progress: &mut Progress,
	) -> SyncResult {
		let mut result = SyncResult::ok(&cfg.name);
		let leftovers = self.try_chunk(cfg, unit, &mut result, progress).await;
		if !leftovers.is_empty() {
			debug!("{} '{}' operations fall back to per-record sync", leftovers.len(), cfg.name);
			result.absorb(self.run_parallel(cfg, leftovers, cancel, progress).await);
		}
		result
	}

	async fn try_chunk(
		&self,
		cfg: &Arc<SyncEntityConfig>,
		unit: Vec<SyncOperation>,
		result: &mut SyncResult,
		progress: &mut Progress,
	) -> Vec<SyncOperation> {
		let Ok(_permit) = self.permits.acquire().await else {
			return unit;
		};
		let Ok(ctx) = self.auth_context(cfg).await else {
			return unit;
		};

		// Records already being synced elsewhere take the per-record path.
		let mut guards: HashMap<RecordKey, RecordGuard> = HashMap::with_capacity(unit.len());
		let mut busy: HashSet<RecordKey> = HashSet::new();
		let mut leftovers = Vec::new();
		let mut ready = Vec::with_capacity(unit.len());
		for op in unit {
			let key = op.key();
			if busy.contains(&key) {
				leftovers.push(op);
				continue;
			}
			if !guards.contains_key(&key) {
				match self.locks.try_acquire(&key) {
					Some(guard) => {
						guards.insert(key, guard);
					}
					None => {
						busy.insert(key);
						leftovers.push(op);
						continue;
					}
				}
			}
			ready.push(op);
		}
		if ready.is_empty() {
			return leftovers;
		}

		let started = Instant::now();
		let query = Query::new(Filter::ids(ready.iter().map(|op| op.record_id.clone())));
		let remote: HashMap<String, RecordSnapshot> =
			match self.timed(self.adapter.query(&ctx, &cfg.name, &query)).await {
				Ok(records) => records.into_iter().map(|r| (r.id.clone(), r)).collect(),
				Err(e) => {
					debug!("Prefetch for '{}' chunk failed: {}", cfg.name, e);
					leftovers.extend(ready);
					return leftovers;
				}
			};

		let mut creates: (Vec<SyncOperation>, Vec<RecordSnapshot>) = (Vec::new(), Vec::new());
		let mut updates: (Vec<SyncOperation>, Vec<RecordSnapshot>) = (Vec::new(), Vec::new());
		let mut top = Priority::Low;

		for mut op in ready {
			let Some(entry) = self.store.get(&op.key()) else {
				leftovers.push(op);
				continue;
			};
			if entry.state.is_settled(op.version) {
				self.retry.on_success(&mut op);
				progress.step(&self.events);
				continue;
			}
			let current = remote.get(&op.record_id);
			let remote_version = current.map_or(0, |r| r.version);
			if !entry.state.is_dirty()
				|| entry.snapshot.tombstone
				|| remote_version > entry.state.last_synced_version()
			{
				leftovers.push(op);
				continue;
			}
			top = top.min(op.priority);
			match current {
				Some(r) if !r.tombstone => {
					updates.0.push(op);
					updates.1.push(entry.snapshot);
				}
				_ => {
					creates.0.push(op);
					creates.1.push(entry.snapshot);
				}
			}
		}

		let mut ok = true;
		for (is_create, (ops, records)) in [(true, creates), (false, updates)] {
			if records.is_empty() {
				continue;
			}
			let sent = if is_create {
				self.count_bytes(records.iter().map(RecordSnapshot::encoded_len).sum());
				self.timed(self.adapter.batch_create(&ctx, &cfg.name, &records)).await
			} else {
				self.submit_updates(&ctx, cfg, &records, top).await
			};
			match sent {
				Ok(stored) => {
					for snapshot in stored {
						self.store.commit_synced(snapshot);
					}
					for mut op in ops {
						self.retry.on_success(&mut op);
						result.affected += 1;
						progress.step(&self.events);
						if let Some(m) = &self.metrics {
							m.operation(&cfg.name, "succeeded");
						}
					}
				}
				Err(e) => {
					ok = false;
					warn!("Batch write of {} '{}' records failed: {}", records.len(), cfg.name, e);
					leftovers.extend(ops);
				}
			}
		}
		self.batcher.record(ok, started.elapsed());
		drop(guards);
		leftovers
	}

	async fn submit_updates(
		&self,
		ctx: &AuthContext,
		cfg: &SyncEntityConfig,
		records: &[RecordSnapshot],
		priority: Priority,
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		if self.adapter.capabilities().compression {
			let raw = serde_json::to_vec(records)?;
			let constrained = self.scheduler.conditions().network.is_constrained();
			let payload = self
				.compressor
				.compress(&raw, CompressionPriority::select(priority, constrained))?;
			if payload.algorithm != Algorithm::None {
				self.count_bytes(payload.compressed_len());
				if let Some(m) = &self.metrics {
					m.saved("compression", payload.saved());
				}
				return self
					.timed(self.adapter.batch_submit_compressed(ctx, &cfg.name, &payload))
					.await;
			}
		}
		self.count_bytes(records.iter().map(RecordSnapshot::encoded_len).sum());
		self.timed(self.adapter.batch_update(ctx, &cfg.name, records)).await
	}

	/// Run one queued operation through the pipeline and its state machine.
	async fn run_operation(&self, cfg: &Arc<SyncEntityConfig>, mut op: SyncOperation) -> SyncResult {
		let started = Instant::now();
		let mut result = SyncResult::ok(&cfg.name);
		op.state = OperationState::InFlight;

		let attempt = Attempt {
			version: Some(op.version),
			force_full: op.force_full,
		};
		let outcome = self.sync_record(cfg, &op.key(), attempt, None).await;
		let elapsed = started.elapsed();
		if let Some(m) = &self.metrics {
			m.sync_operation_duration_seconds.observe(elapsed.as_secs_f64());
		}

		match outcome {
			Ok(outcome) => {
				self.retry.on_success(&mut op);
				self.batcher.record(true, elapsed);
				result.affected = outcome.affected;
				result.conflicts = outcome.conflicts;
				if let Some(m) = &self.metrics {
					m.operation(&cfg.name, "succeeded");
				}
			}
			Err(e) => {
				self.batcher.record(false, elapsed);
				self.handle_failure(op, e, &mut result).await;
			}
		}
		result.duration = elapsed;
		result
	}

	async fn handle_failure(&self, mut op: SyncOperation, error: SyncError, result: &mut SyncResult) {
		let transition = self.retry.on_failure(&mut op, &error);
		let kind = error.kind();
		if let Some(m) = &self.metrics {
			m.sync_errors_total
				.with_label_values(&[format!("{:?}", kind).to_lowercase().as_str()])
				.inc();
		}

		let (retry_in, dead_lettered) = match &transition {
			Transition::Retry { delay } => (Some(*delay), false),
			Transition::RetransmitFull => (Some(Duration::ZERO), false),
			Transition::Terminal => (None, true),
			_ => (None, false),
		};
		self.publish_error(&op.entity, Some(op.record_id.as_str()), &error, op.attempts, retry_in, dead_lettered);
		result.note_error(error.clone());

		let outcome = match transition {
			Transition::Retry { delay } => {
				warn!(
					"{}/{} attempt {} failed ({}), retrying in {:?}",
					op.entity, op.record_id, op.attempts, error, delay
				);
				result.retried += 1;
				if let Some(m) = &self.metrics {
					m.sync_retries_total.inc();
				}
				self.queue.push_delayed(op.clone(), delay);
				"retried"
			}
			Transition::RetransmitFull => {
				warn!("{}/{} failed integrity check, retransmitting full record", op.entity, op.record_id);
				result.retried += 1;
				if let Some(m) = &self.metrics {
					m.sync_retries_total.inc();
				}
				self.queue.push(op.clone());
				"retried"
			}
			Transition::AwaitAuth => {
				if kind == ErrorKind::Authentication {
					self.auth.clear().await;
				}
				self.park(op.clone());
				"awaiting_auth"
			}
			Transition::Terminal => {
				error!("{}/{} failed terminally: {}", op.entity, op.record_id, error);
				result.dead_lettered += 1;
				if let Some(m) = &self.metrics {
					m.sync_dead_letters_total.inc();
				}
				self.queue.dead_letter(op.clone(), error);
				"dead_lettered"
			}
			Transition::Cancelled => {
				result.cancelled = true;
				self.queue.push(op.clone());
				"cancelled"
			}
			Transition::Succeeded => "succeeded",
		};
		if let Some(m) = &self.metrics {
			m.operation(&op.entity, outcome);
		}
	}

	/// The per-record pipeline. Holds the record lock for its whole run.
	///
	/// `provided` carries a remote copy that is already known (pull or
	/// change event); `Some(None)` means the remote record is gone.
	async fn sync_record(
		&self,
		cfg: &Arc<SyncEntityConfig>,
		key: &RecordKey,
		attempt: Attempt,
		provided: Option<Option<RecordSnapshot>>,
	) -> SyncResultOf<RecordOutcome> {
		let _guard = self.locks.acquire(key).await;

		if let Some(version) = attempt.version {
			let settled = self
				.store
				.state(&key.entity, &key.record_id)
				.is_some_and(|s| s.is_settled(version));
			if settled {
				debug!("{} already synced at v{}", key, version);
				return Ok(RecordOutcome::default());
			}
		}

		let ctx = self.auth_context(cfg).await?;
		let mut remote = match provided {
			Some(remote) => remote,
			None => self.read_remote(&ctx, key).await?,
		};

		let mut rounds = 0;
		loop {
			match self.reconcile(cfg, &ctx, key, remote, attempt.force_full).await {
				Err(SyncError::Conflict { .. }) if rounds < self.config.max_conflict_rounds => {
					rounds += 1;
					debug!("{} changed remotely during write, re-resolving (round {})", key, rounds);
					remote = self.read_remote(&ctx, key).await?;
				}
				other => return other,
			}
		}
	}

	/// Compare local and remote versions and act on the difference.
	async fn reconcile(
		&self,
		cfg: &Arc<SyncEntityConfig>,
		ctx: &AuthContext,
		key: &RecordKey,
		remote: Option<RecordSnapshot>,
		force_full: bool,
	) -> SyncResultOf<RecordOutcome> {
		let downloads = cfg.sync_direction.downloads();

		let Some(entry) = self.store.get(key) else {
			return Ok(match remote {
				Some(r) if downloads => {
					let changed = !r.tombstone;
					self.store.commit_synced(r);
					RecordOutcome::applied(changed)
				}
				_ => RecordOutcome::default(),
			});
		};

		let local = entry.snapshot;
		let synced = entry.state.last_synced_version();
		let remote_version = remote.as_ref().map_or(0, |r| r.version);

		if !entry.state.is_dirty() {
			return Ok(match remote {
				Some(r) if r.version > synced && downloads => {
					debug!("{} behind remote (v{} < v{}), applying", key, synced, r.version);
					self.store.commit_synced(r);
					RecordOutcome::applied(true)
				}
				None if synced > 0 && !local.tombstone && downloads => {
					debug!("{} removed remotely", key);
					let mut gone = local;
					gone.tombstone = true;
					self.store.commit_synced(gone);
					RecordOutcome::applied(true)
				}
				_ => RecordOutcome::default(),
			});
		}

		if remote_version <= synced {
			let stored = self.write_record(ctx, remote.as_ref(), &local, force_full).await?;
			self.store.commit_synced(stored);
			return Ok(RecordOutcome::applied(true));
		}

		match remote {
			Some(r) => self.resolve_conflict(cfg, ctx, &local, r, force_full).await,
			None => Ok(RecordOutcome::default()),
		}
	}

	async fn resolve_conflict(
		&self,
		cfg: &SyncEntityConfig,
		ctx: &AuthContext,
		local: &RecordSnapshot,
		remote: RecordSnapshot,
		force_full: bool,
	) -> SyncResultOf<RecordOutcome> {
		let fields: Vec<String> = self
			.conflicts
			.detect(cfg, local, &remote)
			.into_iter()
			.map(|(field, _)| field)
			.collect();
		self.events.publish(SyncEvent::ConflictDetected {
			entity: local.entity.clone(),
			record_id: local.id.clone(),
			fields,
		});

		let resolution = self.conflicts.resolve(cfg, local, &remote);
		let committed = if resolution.adopts_remote(&remote) {
			remote.clone()
		} else {
			self.write_record(ctx, Some(&remote), &resolution.record, force_full)
				.await?
		};
		self.store.commit_synced(committed);

		if !resolution.review.is_empty() {
			info!(
				"{}/{} resolved with {} below confidence: {:?}",
				local.entity,
				local.id,
				resolution.strategy.name(),
				resolution.review
			);
		}
		if let Some(m) = &self.metrics {
			m.conflicts_total
				.with_label_values(&[resolution.strategy.name()])
				.inc();
			m.conflict_fields_flagged_total
				.inc_by(resolution.review.len() as u64);
		}
		self.history.record(
			SyncConflict::new(local, &remote, &resolution),
			cfg.audit_sensitive,
			resolution.confidence,
		);
		self.events.publish(SyncEvent::ConflictResolved {
			entity: local.entity.clone(),
			record_id: local.id.clone(),
			strategy: resolution.strategy,
			review: resolution.review,
		});
		Ok(RecordOutcome {
			affected: 1,
			conflicts: 1,
		})
	}

	/// Make the remote hold `next`, given that it currently holds `remote`.
	async fn write_record(
		&self,
		ctx: &AuthContext,
		remote: Option<&RecordSnapshot>,
		next: &RecordSnapshot,
		force_full: bool,
	) -> SyncResultOf<RecordSnapshot> {
		if next.tombstone {
			if let Some(r) = remote.filter(|r| !r.tombstone) {
				match self
					.timed(self.adapter.delete(ctx, &r.entity, &r.id, next.version))
					.await
				{
					Ok(()) | Err(SyncError::NotFound { .. }) => {}
					Err(e) => return Err(e),
				}
			}
			return Ok(next.clone());
		}

		let current = match remote {
			Some(r) if !r.tombstone => r,
			_ => {
				self.count_bytes(next.encoded_len());
				return self.timed(self.adapter.create(ctx, next)).await;
			}
		};

		let full_len = next.encoded_len();
		let mut payload = WritePayload::Full(next.clone());
		if self.adapter.capabilities().delta && !force_full {
			let patch = self.delta.diff(&current.props, &next.props);
			if self.delta.is_worthwhile(&patch, &next.props) {
				let sent = patch.encoded_len();
				if let Some(m) = &self.metrics {
					m.saved("delta", full_len.saturating_sub(sent));
				}
				payload = WritePayload::Patch {
					entity: next.entity.clone(),
					id: next.id.clone(),
					base_version: current.version,
					version: next.version,
					updated_at: next.updated_at,
					patch,
				};
			}
		}
		self.count_bytes(match &payload {
			WritePayload::Patch { patch, .. } => patch.encoded_len(),
			WritePayload::Full(_) => full_len,
		});

		match self.timed(self.adapter.update(ctx, &payload)).await {
			// Gone between read and write: re-read and create.
			Err(SyncError::NotFound { entity, record_id }) => Err(SyncError::Conflict { entity, record_id }),
			other => other,
		}
	}

	async fn read_remote(&self, ctx: &AuthContext, key: &RecordKey) -> SyncResultOf<Option<RecordSnapshot>> {
		self.timed(self.adapter.read(ctx, &key.entity, &key.record_id))
			.await
	}

	async fn timed<T, F>(&self, call: F) -> SyncResultOf<T>
	where
		F: Future<Output = SyncResultOf<T>>,
	{
		let limit = self.config.operation_timeout;
		match tokio::time::timeout(limit, call).await {
			Ok(result) => result,
			Err(_) => Err(SyncError::Timeout(limit)),
		}
	}

	/// Context for one adapter call. A present context is refreshed when it
	/// is near expiry, whether or not the entity requires authentication.
	async fn auth_context(&self, cfg: &SyncEntityConfig) -> SyncResultOf<AuthContext> {
		if !cfg.requires_authentication && !self.auth.is_present().await {
			return Ok(AuthContext::anonymous());
		}
		match self.auth.ensure_fresh().await {
			Err(e) if !cfg.requires_authentication => {
				debug!("No usable auth context for '{}', calling anonymously: {}", cfg.name, e);
				Ok(AuthContext::anonymous())
			}
			other => other,
		}
	}

	async fn gated(&self, cfg: &SyncEntityConfig) -> bool {
		cfg.requires_authentication && !self.auth.is_present().await
	}

	fn park(&self, mut op: SyncOperation) {
		op.state = OperationState::RecoverableFailure;
		debug!("{}/{} held until re-authentication", op.entity, op.record_id);
		self.parked.lock().push(op);
	}

	fn publish_error(
		&self,
		entity: &str,
		record_id: Option<&str>,
		error: &SyncError,
		attempt: u32,
		retry_in: Option<Duration>,
		dead_lettered: bool,
	) {
		self.events.publish(SyncEvent::SyncError {
			entity: entity.to_string(),
			record_id: record_id.map(str::to_string),
			error: error.clone(),
			kind: error.kind(),
			attempt,
			retry_in,
			dead_lettered,
		});
	}

	fn count_bytes(&self, bytes: usize) {
		if let Some(m) = &self.metrics {
			m.bytes_transmitted_total.inc_by(bytes as u64);
		}
	}

	fn update_queue_gauges(&self) {
		if let Some(m) = &self.metrics {
			for (priority, depth) in self.queue.depth_by_tier() {
				m.queue_depth
					.with_label_values(&[priority.name()])
					.set(depth as i64);
			}
		}
	}

	/// Pull remote records changed since the entity's cursor.
	///
	/// The cursor bound is inclusive, so records sharing the cursor's
	/// timestamp are fetched again and settle through the version check.
	/// Records without a modification time are fetched on every pull.
	async fn pull(&self, cfg: &Arc<SyncEntityConfig>, cancel: &CancellationToken) -> SyncResultOf<SyncResult> {
		let ctx = self.auth_context(cfg).await?;
		let mut changed = match self.store.cursor(&cfg.name) {
			Some(since) => {
				let recent = Query::new(Filter::all().updated_since(since))
					.sorted_by(FIELD_UPDATED_AT, SortDirection::Asc);
				let undated = Query::new(Filter::all().missing(FIELD_UPDATED_AT));
				let mut records = self
					.timed(self.adapter.query(&ctx, &cfg.name, &undated))
					.await?;
				records.extend(
					self.timed(self.adapter.query(&ctx, &cfg.name, &recent))
						.await?,
				);
				records
			}
			None => {
				let all = Query::new(Filter::all()).sorted_by(FIELD_UPDATED_AT, SortDirection::Asc);
				self.timed(self.adapter.query(&ctx, &cfg.name, &all))
					.await?
			}
		};
		// Undated records sort first, then ascending modification time.
		changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

		let mut result = SyncResult::ok(&cfg.name);
		let mut cursor: Option<DateTime<Utc>> = None;
		let mut blocked = false;
		let fetched = changed.len();

		for remote in changed {
			if cancel.is_cancelled() {
				result.cancelled = true;
				break;
			}
			let key = remote.key();
			let updated_at = remote.updated_at;
			match self
				.sync_record(cfg, &key, Attempt::pull(), Some(Some(remote)))
				.await
			{
				Ok(outcome) => {
					result.affected += outcome.affected;
					result.conflicts += outcome.conflicts;
					if !blocked {
						cursor = cursor.max(updated_at);
					}
				}
				Err(e) => {
					// The cursor stays at or before this record so the next pull retries it.
					blocked = true;
					warn!("Pulling {} failed: {}", key, e);
					self.publish_error(&cfg.name, Some(key.record_id.as_str()), &e, 0, None, false);
					result.note_error(e);
				}
			}
		}

		if let Some(cursor) = cursor {
			self.store.advance_cursor(&cfg.name, cursor);
		}
		debug!("Pulled {} '{}' records, {} applied", fetched, cfg.name, result.affected);
		Ok(result)
	}
}

fn awaiting_auth() -> SyncError {
	SyncError::Authentication("waiting for an auth context".to_string())
}

fn limiter_closed() -> SyncError {
	SyncError::Internal("concurrency limiter closed".to_string())
}

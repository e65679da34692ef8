//! In-process backend used by the test-suite and the `simulate` command.
//!
//! Behaves like a well-behaved remote service with optimistic concurrency:
//! writes carrying a version that is not newer than the stored one are
//! rejected with [`SyncError::Conflict`], and patches must be based on the
//! stored version. Faults and latency can be injected per call type.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{
	AuthContext, BackendAdapter, Capabilities, ChangeEvent, ChangeKind, ChangeStream, Filter, Query,
	WritePayload,
};
use crate::error::{SyncError, SyncResultOf};
use crate::model::{RecordKey, RecordSnapshot};
use crate::sync::compression::CompressedPayload;

/// Adapter entry points, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterCall {
	Create,
	Read,
	Update,
	UpdatePatch,
	Delete,
	Query,
	BatchCreate,
	BatchUpdate,
	BatchCompressed,
	Subscribe,
}

/// One observed adapter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
	pub call: AdapterCall,
	pub entity: String,
	pub record_id: Option<String>,
}

#[derive(Debug)]
struct Fault {
	call: AdapterCall,
	record_id: Option<String>,
	error: SyncError,
	remaining: u32,
}

#[derive(Default)]
struct Inner {
	records: HashMap<RecordKey, RecordSnapshot>,
	faults: Vec<Fault>,
	calls: Vec<CallRecord>,
	in_flight: HashMap<RecordKey, usize>,
}

pub struct MemoryAdapter {
	name: String,
	capabilities: Capabilities,
	latency: Duration,
	required_token: Option<String>,
	inner: Mutex<Inner>,
	changes: broadcast::Sender<ChangeEvent>,
	active: AtomicUsize,
	max_active: AtomicUsize,
	overlap: AtomicBool,
}

impl MemoryAdapter {
	pub fn new(capabilities: Capabilities) -> Self {
		let (changes, _) = broadcast::channel(256);
		Self {
			name: "memory".to_string(),
			capabilities,
			latency: Duration::ZERO,
			required_token: None,
			inner: Mutex::new(Inner::default()),
			changes,
			active: AtomicUsize::new(0),
			max_active: AtomicUsize::new(0),
			overlap: AtomicBool::new(false),
		}
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	/// Every call sleeps for `latency` before touching the store.
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}

	/// Reject calls whose auth context does not carry `token`.
	pub fn with_required_token(mut self, token: impl Into<String>) -> Self {
		self.required_token = Some(token.into());
		self
	}

	/// Insert a record without notifying subscribers.
	pub fn seed(&self, record: RecordSnapshot) {
		self.inner.lock().records.insert(record.key(), record);
	}

	/// Simulate a write by another client: stored unconditionally and
	/// broadcast to subscribers.
	pub fn put_remote(&self, record: RecordSnapshot) {
		let kind = if record.tombstone {
			ChangeKind::Deleted
		} else {
			ChangeKind::Updated
		};
		let event = ChangeEvent {
			entity: record.entity.clone(),
			record_id: record.id.clone(),
			kind,
			record: Some(record.clone()),
		};
		self.inner.lock().records.insert(record.key(), record);
		// No subscribers is not an error.
		let _ = self.changes.send(event);
	}

	/// Stored copy of a record, bypassing call accounting.
	pub fn get(&self, entity: &str, id: &str) -> Option<RecordSnapshot> {
		self.inner.lock().records.get(&RecordKey::new(entity, id)).cloned()
	}

	pub fn record_count(&self, entity: &str) -> usize {
		self.inner
			.lock()
			.records
			.values()
			.filter(|r| r.entity == entity && !r.tombstone)
			.count()
	}

	/// Fail the next `times` invocations of `call` with `error`.
	pub fn inject_fault(&self, call: AdapterCall, error: SyncError, times: u32) {
		self.inner.lock().faults.push(Fault {
			call,
			record_id: None,
			error,
			remaining: times,
		});
	}

	/// Like [`inject_fault`](Self::inject_fault) but only for one record id.
	pub fn inject_fault_for(&self, call: AdapterCall, record_id: &str, error: SyncError, times: u32) {
		self.inner.lock().faults.push(Fault {
			call,
			record_id: Some(record_id.to_string()),
			error,
			remaining: times,
		});
	}

	pub fn calls(&self) -> Vec<CallRecord> {
		self.inner.lock().calls.clone()
	}

	pub fn call_count(&self, call: AdapterCall) -> usize {
		self.inner.lock().calls.iter().filter(|c| c.call == call).count()
	}

	pub fn call_count_for(&self, call: AdapterCall, record_id: &str) -> usize {
		self.inner
			.lock()
			.calls
			.iter()
			.filter(|c| c.call == call && c.record_id.as_deref() == Some(record_id))
			.count()
	}

	/// Calls that write to the backend.
	pub fn write_count(&self) -> usize {
		self.inner
			.lock()
			.calls
			.iter()
			.filter(|c| {
				!matches!(c.call, AdapterCall::Read | AdapterCall::Query | AdapterCall::Subscribe)
			})
			.count()
	}

	pub fn reset_calls(&self) {
		self.inner.lock().calls.clear();
	}

	/// Highest number of calls observed executing at the same time.
	pub fn max_concurrency(&self) -> usize {
		self.max_active.load(Ordering::SeqCst)
	}

	/// True if two calls for the same record were ever in flight together.
	pub fn overlap_detected(&self) -> bool {
		self.overlap.load(Ordering::SeqCst)
	}

	/// Log, authorize, fault-check and time one call, then run `op` against
	/// the store.
	async fn track<T>(
		&self,
		ctx: &AuthContext,
		call: AdapterCall,
		entity: &str,
		record_id: Option<&str>,
		op: impl FnOnce(&mut Inner) -> SyncResultOf<T>,
	) -> SyncResultOf<T> {
		let key = record_id.map(|id| RecordKey::new(entity, id));
		{
			let mut inner = self.inner.lock();
			inner.calls.push(CallRecord {
				call,
				entity: entity.to_string(),
				record_id: record_id.map(str::to_string),
			});
			if let Some(k) = &key {
				let n = inner.in_flight.entry(k.clone()).or_insert(0);
				*n += 1;
				if *n > 1 {
					self.overlap.store(true, Ordering::SeqCst);
				}
			}
		}
		let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_active.fetch_max(active, Ordering::SeqCst);

		if !self.latency.is_zero() {
			tokio::time::sleep(self.latency).await;
		}

		let result = {
			let mut inner = self.inner.lock();
			let outcome = match self.check_token(ctx) {
				Err(e) => Err(e),
				Ok(()) => match take_fault(&mut inner, call, record_id) {
					Some(e) => Err(e),
					None => op(&mut inner),
				},
			};
			if let Some(k) = &key {
				if let Some(n) = inner.in_flight.get_mut(k) {
					*n -= 1;
					if *n == 0 {
						inner.in_flight.remove(k);
					}
				}
			}
			outcome
		};
		self.active.fetch_sub(1, Ordering::SeqCst);

		if let Err(e) = &result {
			debug!("memory adapter {:?} {}/{:?} failed: {}", call, entity, record_id, e);
		}
		result
	}

	fn check_token(&self, ctx: &AuthContext) -> SyncResultOf<()> {
		match &self.required_token {
			Some(expected) if &ctx.token != expected => {
				Err(SyncError::Authentication("missing or invalid token".into()))
			}
			_ => Ok(()),
		}
	}

	fn batch_guard(&self, len: usize) -> SyncResultOf<()> {
		if !self.capabilities.batch {
			return Err(SyncError::Unsupported("batch writes".into()));
		}
		if len > self.capabilities.max_batch_size {
			return Err(SyncError::Validation(format!(
				"batch of {} exceeds maximum of {}",
				len, self.capabilities.max_batch_size
			)));
		}
		Ok(())
	}
}

fn take_fault(inner: &mut Inner, call: AdapterCall, record_id: Option<&str>) -> Option<SyncError> {
	let idx = inner.faults.iter().position(|f| {
		f.call == call
			&& f.remaining > 0
			&& f.record_id.as_deref().is_none_or(|id| Some(id) == record_id)
	})?;
	let fault = &mut inner.faults[idx];
	fault.remaining -= 1;
	let error = fault.error.clone();
	if fault.remaining == 0 {
		inner.faults.remove(idx);
	}
	Some(error)
}

fn conflict(record: &RecordSnapshot) -> SyncError {
	SyncError::Conflict {
		entity: record.entity.clone(),
		record_id: record.id.clone(),
	}
}

fn stamp(mut record: RecordSnapshot) -> RecordSnapshot {
	if record.updated_at.is_none() {
		record.updated_at = Some(Utc::now());
	}
	record
}

/// Optimistic-concurrency upsert shared by the single and batch paths.
fn check_upsert(inner: &Inner, record: &RecordSnapshot) -> SyncResultOf<()> {
	match inner.records.get(&record.key()) {
		Some(existing) if record.version <= existing.version => Err(conflict(record)),
		_ => Ok(()),
	}
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
	fn name(&self) -> &str {
		&self.name
	}

	fn capabilities(&self) -> Capabilities {
		self.capabilities.clone()
	}

	async fn create(&self, ctx: &AuthContext, record: &RecordSnapshot) -> SyncResultOf<RecordSnapshot> {
		self.track(ctx, AdapterCall::Create, &record.entity, Some(&record.id), |inner| {
			if let Some(existing) = inner.records.get(&record.key()) {
				if !existing.tombstone || record.version <= existing.version {
					return Err(conflict(record));
				}
			}
			let stored = stamp(record.clone());
			inner.records.insert(stored.key(), stored.clone());
			Ok(stored)
		})
		.await
	}

	async fn read(
		&self,
		ctx: &AuthContext,
		entity: &str,
		id: &str,
	) -> SyncResultOf<Option<RecordSnapshot>> {
		self.track(ctx, AdapterCall::Read, entity, Some(id), |inner| {
			Ok(inner.records.get(&RecordKey::new(entity, id)).cloned())
		})
		.await
	}

	async fn update(&self, ctx: &AuthContext, payload: &WritePayload) -> SyncResultOf<RecordSnapshot> {
		let call = if payload.is_patch() {
			AdapterCall::UpdatePatch
		} else {
			AdapterCall::Update
		};
		let entity = payload.entity().to_string();
		let id = payload.id().to_string();

		self.track(ctx, call, &entity, Some(&id), |inner| {
			let key = RecordKey::new(entity.as_str(), id.as_str());
			let existing = inner.records.get(&key).cloned().ok_or_else(|| SyncError::NotFound {
				entity: entity.clone(),
				record_id: id.clone(),
			})?;

			let stored = match payload {
				WritePayload::Full(record) => {
					check_upsert(inner, record)?;
					stamp(record.clone())
				}
				WritePayload::Patch {
					base_version,
					version,
					updated_at,
					patch,
					..
				} => {
					if existing.version != *base_version || *version <= existing.version {
						return Err(conflict(&existing));
					}
					if !self.capabilities.delta {
						return Err(SyncError::Unsupported("delta updates".into()));
					}
					let props = patch.apply(&existing.props)?;
					let mut next = RecordSnapshot::new(entity.clone(), id.clone(), props, *version);
					next.updated_at = *updated_at;
					stamp(next)
				}
			};
			inner.records.insert(key, stored.clone());
			Ok(stored)
		})
		.await
	}

	async fn delete(&self, ctx: &AuthContext, entity: &str, id: &str, version: u64) -> SyncResultOf<()> {
		self.track(ctx, AdapterCall::Delete, entity, Some(id), |inner| {
			let key = RecordKey::new(entity, id);
			let existing = inner.records.get(&key).cloned().ok_or_else(|| SyncError::NotFound {
				entity: entity.to_string(),
				record_id: id.to_string(),
			})?;
			if version <= existing.version {
				return Err(conflict(&existing));
			}
			let tombstone = RecordSnapshot::new(entity, id, existing.props, version)
				.with_updated_at(Utc::now())
				.with_tombstone(true);
			inner.records.insert(key, tombstone);
			Ok(())
		})
		.await
	}

	async fn query(
		&self,
		ctx: &AuthContext,
		entity: &str,
		query: &Query,
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		self.track(ctx, AdapterCall::Query, entity, None, |inner| {
			let matching = inner.records.values().filter(|r| r.entity == entity).cloned();
			Ok(query.apply(matching))
		})
		.await
	}

	async fn batch_create(
		&self,
		ctx: &AuthContext,
		entity: &str,
		records: &[RecordSnapshot],
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		self.batch_guard(records.len())?;
		self.track(ctx, AdapterCall::BatchCreate, entity, None, |inner| {
			for r in records {
				if inner.records.get(&r.key()).is_some_and(|e| !e.tombstone) {
					return Err(conflict(r));
				}
			}
			Ok(upsert_all(inner, records))
		})
		.await
	}

	async fn batch_update(
		&self,
		ctx: &AuthContext,
		entity: &str,
		records: &[RecordSnapshot],
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		self.batch_guard(records.len())?;
		self.track(ctx, AdapterCall::BatchUpdate, entity, None, |inner| {
			for r in records {
				check_upsert(inner, r)?;
			}
			Ok(upsert_all(inner, records))
		})
		.await
	}

	async fn batch_submit_compressed(
		&self,
		ctx: &AuthContext,
		entity: &str,
		payload: &CompressedPayload,
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		if !self.capabilities.compression {
			return Err(SyncError::Unsupported("compressed batches".into()));
		}
		let raw = payload.decompress()?;
		let records: Vec<RecordSnapshot> = serde_json::from_slice(&raw)?;
		self.batch_guard(records.len())?;

		self.track(ctx, AdapterCall::BatchCompressed, entity, None, |inner| {
			for r in &records {
				check_upsert(inner, r)?;
			}
			Ok(upsert_all(inner, &records))
		})
		.await
	}

	async fn subscribe(
		&self,
		ctx: &AuthContext,
		entity: &str,
		filter: &Filter,
	) -> SyncResultOf<ChangeStream> {
		if !self.capabilities.subscribe {
			return Err(SyncError::Unsupported("subscribe".into()));
		}
		let rx = self
			.track(ctx, AdapterCall::Subscribe, entity, None, |_| Ok(self.changes.subscribe()))
			.await?;

		let entity = entity.to_string();
		let filter = filter.clone();
		let stream = BroadcastStream::new(rx).filter_map(move |item| {
			let keep = match &item {
				Ok(ev) => {
					ev.entity == entity && ev.record.as_ref().is_none_or(|r| filter.matches(r))
				}
				Err(_) => false,
			};
			futures_util::future::ready(if keep { item.ok() } else { None })
		});
		Ok(stream.boxed())
	}
}

fn upsert_all(inner: &mut Inner, records: &[RecordSnapshot]) -> Vec<RecordSnapshot> {
	records
		.iter()
		.map(|r| {
			let stored = stamp(r.clone());
			inner.records.insert(stored.key(), stored.clone());
			stored
		})
		.collect()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::sync::compression::{CompressionPriority, Compressor};
	use crate::sync::delta::DeltaCalculator;
	use serde_json::json;

	fn ctx() -> AuthContext {
		AuthContext::anonymous()
	}

	#[tokio::test]
	async fn test_crud_and_optimistic_concurrency() {
		let adapter = MemoryAdapter::new(Capabilities::full());
		let rec = RecordSnapshot::new("notes", "1", json!({"title": "A"}), 1);

		adapter.create(&ctx(), &rec).await.expect("create");
		assert!(matches!(
			adapter.create(&ctx(), &rec).await,
			Err(SyncError::Conflict { .. })
		));

		let stale = WritePayload::Full(RecordSnapshot::new("notes", "1", json!({"title": "B"}), 1));
		assert!(matches!(
			adapter.update(&ctx(), &stale).await,
			Err(SyncError::Conflict { .. })
		));

		let fresh = WritePayload::Full(RecordSnapshot::new("notes", "1", json!({"title": "B"}), 2));
		let stored = adapter.update(&ctx(), &fresh).await.expect("update");
		assert_eq!(stored.version, 2);
		assert!(stored.updated_at.is_some());

		adapter.delete(&ctx(), "notes", "1", 3).await.expect("delete");
		let read = adapter.read(&ctx(), "notes", "1").await.expect("read");
		assert!(read.is_some_and(|r| r.tombstone));
		assert_eq!(adapter.record_count("notes"), 0);
	}

	#[tokio::test]
	async fn test_patch_update_verifies_checksum() {
		let adapter = MemoryAdapter::new(Capabilities::full());
		let base = RecordSnapshot::new("notes", "1", json!({"title": "A", "body": "x"}), 1);
		adapter.seed(base.clone());

		let target = json!({"title": "B", "body": "x"});
		let patch = DeltaCalculator::default().diff(&base.props, &target);
		let payload = WritePayload::Patch {
			entity: "notes".into(),
			id: "1".into(),
			base_version: 1,
			version: 2,
			updated_at: None,
			patch: patch.clone(),
		};
		let stored = adapter.update(&ctx(), &payload).await.expect("patch");
		assert_eq!(stored.props, target);

		// Remote drifted since the patch base: same version, different body.
		adapter.seed(RecordSnapshot::new("notes", "2", json!({"title": "A", "body": "y"}), 1));
		let drifted = WritePayload::Patch {
			entity: "notes".into(),
			id: "2".into(),
			base_version: 1,
			version: 2,
			updated_at: None,
			patch,
		};
		assert!(matches!(
			adapter.update(&ctx(), &drifted).await,
			Err(SyncError::Integrity(_))
		));
		assert_eq!(adapter.call_count(AdapterCall::UpdatePatch), 2);
	}

	#[tokio::test]
	async fn test_fault_injection_is_consumed() {
		let adapter = MemoryAdapter::new(Capabilities::minimal());
		adapter.inject_fault(AdapterCall::Read, SyncError::Network("down".into()), 2);

		assert!(adapter.read(&ctx(), "notes", "1").await.is_err());
		assert!(adapter.read(&ctx(), "notes", "1").await.is_err());
		assert!(adapter.read(&ctx(), "notes", "1").await.is_ok());
		assert_eq!(adapter.call_count_for(AdapterCall::Read, "1"), 3);
	}

	#[tokio::test]
	async fn test_fault_for_single_record() {
		let adapter = MemoryAdapter::new(Capabilities::minimal());
		adapter.inject_fault_for(AdapterCall::Read, "2", SyncError::Timeout(Duration::from_secs(1)), 1);

		assert!(adapter.read(&ctx(), "notes", "1").await.is_ok());
		assert!(adapter.read(&ctx(), "notes", "2").await.is_err());
		assert!(adapter.read(&ctx(), "notes", "2").await.is_ok());
	}

	#[tokio::test]
	async fn test_batch_limits_and_capabilities() {
		let adapter = MemoryAdapter::new(Capabilities::minimal());
		let recs = vec![RecordSnapshot::new("notes", "1", json!({}), 1)];
		assert!(matches!(
			adapter.batch_create(&ctx(), "notes", &recs).await,
			Err(SyncError::Unsupported(_))
		));

		let mut caps = Capabilities::full();
		caps.max_batch_size = 1;
		let adapter = MemoryAdapter::new(caps);
		let two = vec![
			RecordSnapshot::new("notes", "1", json!({}), 1),
			RecordSnapshot::new("notes", "2", json!({}), 1),
		];
		assert!(matches!(
			adapter.batch_create(&ctx(), "notes", &two).await,
			Err(SyncError::Validation(_))
		));
		assert_eq!(adapter.batch_create(&ctx(), "notes", &recs).await.expect("batch").len(), 1);
	}

	#[tokio::test]
	async fn test_compressed_batch_upserts() {
		let adapter = MemoryAdapter::new(Capabilities::full());
		let records: Vec<RecordSnapshot> = (0..40)
			.map(|i| RecordSnapshot::new("notes", i.to_string(), json!({"body": "lorem ipsum ".repeat(20)}), 1))
			.collect();
		let raw = serde_json::to_vec(&records).expect("encode");
		let payload = Compressor::default()
			.compress(&raw, CompressionPriority::Balanced)
			.expect("compress");

		let stored = adapter
			.batch_submit_compressed(&ctx(), "notes", &payload)
			.await
			.expect("submit");
		assert_eq!(stored.len(), 40);
		assert_eq!(adapter.record_count("notes"), 40);
	}

	#[tokio::test]
	async fn test_required_token() {
		let adapter = MemoryAdapter::new(Capabilities::minimal()).with_required_token("t0k");
		assert!(matches!(
			adapter.read(&ctx(), "notes", "1").await,
			Err(SyncError::Authentication(_))
		));
		assert!(adapter.read(&AuthContext::new("u", "t0k"), "notes", "1").await.is_ok());
	}

	#[tokio::test]
	async fn test_subscribe_filters_by_entity() {
		let adapter = MemoryAdapter::new(Capabilities::full());
		let mut stream = adapter.subscribe(&ctx(), "notes", &Filter::all()).await.expect("subscribe");

		adapter.put_remote(RecordSnapshot::new("tasks", "9", json!({}), 1));
		adapter.put_remote(RecordSnapshot::new("notes", "1", json!({"t": 1}), 4));

		let ev = stream.next().await.expect("event");
		assert_eq!(ev.entity, "notes");
		assert_eq!(ev.record_id, "1");
		assert_eq!(ev.kind, ChangeKind::Updated);
	}
}

//! Backend adapter contract.
//!
//! Every remote backend is reached through [`BackendAdapter`]. Adapters carry
//! no synchronization logic: they translate the calls below into their
//! native API and map native failures into [`SyncError`] so the orchestrator
//! can tell recoverable failures (network, timeout, rate limiting) from
//! terminal ones (validation, auth). Adapters must tolerate concurrent calls
//! for distinct records; the orchestrator guarantees that a single record is
//! never written concurrently.

pub mod memory;
pub mod query;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResultOf};
use crate::model::RecordSnapshot;
use crate::sync::compression::CompressedPayload;
use crate::sync::delta::DeltaPatch;

pub use memory::{AdapterCall, MemoryAdapter};
pub use query::{Condition, Filter, Operator, Query, Sort, SortDirection};

/// Feature set a backend advertises. The orchestrator skips optimizations a
/// backend does not support instead of probing at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
	/// `batch_create` / `batch_update` are available.
	pub batch: bool,
	/// Largest batch the backend accepts.
	pub max_batch_size: usize,
	/// `update` accepts [`WritePayload::Patch`].
	pub delta: bool,
	/// `batch_submit_compressed` is available.
	pub compression: bool,
	/// `query` supports filters on record ids and modification time.
	pub query: bool,
	/// `subscribe` delivers change events.
	pub subscribe: bool,
	/// Writes to distinct records may run in parallel.
	pub concurrent_writes: bool,
}

impl Capabilities {
	/// Plain CRUD only.
	pub fn minimal() -> Self {
		Self {
			batch: false,
			max_batch_size: 1,
			delta: false,
			compression: false,
			query: true,
			subscribe: false,
			concurrent_writes: false,
		}
	}

	pub fn full() -> Self {
		Self {
			batch: true,
			max_batch_size: 100,
			delta: true,
			compression: true,
			query: true,
			subscribe: true,
			concurrent_writes: true,
		}
	}
}

impl Default for Capabilities {
	fn default() -> Self {
		Self::minimal()
	}
}

/// Opaque caller identity passed to the adapter on every call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
	pub user_id: String,
	pub organization_id: Option<String>,
	pub token: String,
	pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
	pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			organization_id: None,
			token: token.into(),
			expires_at: None,
		}
	}

	/// Context used for entities that do not require authentication.
	pub fn anonymous() -> Self {
		Self::new("", "")
	}

	pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
		self.organization_id = Some(organization_id.into());
		self
	}

	pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn is_anonymous(&self) -> bool {
		self.token.is_empty()
	}

	/// True when the token expires within `margin` of `now`.
	pub fn expires_within(&self, margin: chrono::Duration, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|exp| exp - now <= margin)
	}
}

impl fmt::Debug for AuthContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AuthContext")
			.field("user_id", &self.user_id)
			.field("organization_id", &self.organization_id)
			.field("token", &"<redacted>")
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Body of an update call: the whole record or a verified delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum WritePayload {
	Full(RecordSnapshot),
	Patch {
		entity: String,
		id: String,
		/// Version the patch was computed against.
		base_version: u64,
		/// Version the record has after the patch.
		version: u64,
		updated_at: Option<DateTime<Utc>>,
		patch: DeltaPatch,
	},
}

impl WritePayload {
	pub fn entity(&self) -> &str {
		match self {
			WritePayload::Full(r) => &r.entity,
			WritePayload::Patch { entity, .. } => entity,
		}
	}

	pub fn id(&self) -> &str {
		match self {
			WritePayload::Full(r) => &r.id,
			WritePayload::Patch { id, .. } => id,
		}
	}

	pub fn version(&self) -> u64 {
		match self {
			WritePayload::Full(r) => r.version,
			WritePayload::Patch { version, .. } => *version,
		}
	}

	pub fn is_patch(&self) -> bool {
		matches!(self, WritePayload::Patch { .. })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Created,
	Updated,
	Deleted,
}

/// Remote change delivered by `subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub entity: String,
	pub record_id: String,
	pub kind: ChangeKind,
	/// Post-change record, when the backend ships it with the event.
	pub record: Option<RecordSnapshot>,
}

pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Contract every remote backend satisfies.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
	/// Human-readable backend name for logs.
	fn name(&self) -> &str;

	fn capabilities(&self) -> Capabilities;

	async fn create(&self, ctx: &AuthContext, record: &RecordSnapshot) -> SyncResultOf<RecordSnapshot>;

	/// Current remote copy, `None` when the record does not exist. Deleted
	/// records may be returned as tombstones.
	async fn read(
		&self,
		ctx: &AuthContext,
		entity: &str,
		id: &str,
	) -> SyncResultOf<Option<RecordSnapshot>>;

	async fn update(&self, ctx: &AuthContext, payload: &WritePayload) -> SyncResultOf<RecordSnapshot>;

	async fn delete(&self, ctx: &AuthContext, entity: &str, id: &str, version: u64) -> SyncResultOf<()>;

	async fn query(
		&self,
		ctx: &AuthContext,
		entity: &str,
		query: &Query,
	) -> SyncResultOf<Vec<RecordSnapshot>>;

	async fn batch_create(
		&self,
		_ctx: &AuthContext,
		_entity: &str,
		_records: &[RecordSnapshot],
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		Err(SyncError::Unsupported("batch_create".into()))
	}

	async fn batch_update(
		&self,
		_ctx: &AuthContext,
		_entity: &str,
		_records: &[RecordSnapshot],
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		Err(SyncError::Unsupported("batch_update".into()))
	}

	/// Upsert a compressed JSON array of records in one call.
	async fn batch_submit_compressed(
		&self,
		_ctx: &AuthContext,
		_entity: &str,
		_payload: &CompressedPayload,
	) -> SyncResultOf<Vec<RecordSnapshot>> {
		Err(SyncError::Unsupported("compressed batches".into()))
	}

	async fn subscribe(
		&self,
		_ctx: &AuthContext,
		_entity: &str,
		_filter: &Filter,
	) -> SyncResultOf<ChangeStream> {
		Err(SyncError::Unsupported("subscribe".into()))
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_auth_context_debug_redacts_token() {
		let ctx = AuthContext::new("u1", "super-secret").with_organization("org");
		let dbg = format!("{:?}", ctx);
		assert!(dbg.contains("u1"));
		assert!(!dbg.contains("super-secret"));
	}

	#[test]
	fn test_auth_context_expiry() {
		let now = Utc::now();
		let ctx = AuthContext::new("u1", "t").with_expiry(now + chrono::Duration::seconds(30));
		assert!(ctx.expires_within(chrono::Duration::seconds(60), now));
		assert!(!ctx.expires_within(chrono::Duration::seconds(10), now));
		assert!(!AuthContext::anonymous().expires_within(chrono::Duration::seconds(60), now));
		assert!(AuthContext::anonymous().is_anonymous());
	}

	#[test]
	fn test_write_payload_accessors() {
		let rec = RecordSnapshot::new("notes", "1", json!({"t": 1}), 3);
		let full = WritePayload::Full(rec);
		assert_eq!(full.entity(), "notes");
		assert_eq!(full.id(), "1");
		assert_eq!(full.version(), 3);
		assert!(!full.is_patch());
	}
}

mod common;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vanopticon_bifrost::adapter::{AdapterCall, AuthContext, Capabilities, MemoryAdapter};
use vanopticon_bifrost::model::{ConflictStrategy, OperationState, RecordSnapshot, SyncEntityConfig, SyncOperation};
use vanopticon_bifrost::sync::{SyncEvent, TokenManager};
use vanopticon_bifrost::{SyncError, SyncResultOf};

/// Token manager that hands out `token` with a short lifetime, so every
/// auth lookup refreshes, and optionally cancels a sync on its Nth call.
struct ShortLivedTokens {
	token: &'static str,
	lifetime: chrono::Duration,
	calls: AtomicUsize,
	cancel: Option<(usize, CancellationToken)>,
}

impl ShortLivedTokens {
	fn new(token: &'static str, lifetime: chrono::Duration) -> Self {
		Self {
			token,
			lifetime,
			calls: AtomicUsize::new(0),
			cancel: None,
		}
	}

	fn cancelling_on(mut self, call: usize, cancel: CancellationToken) -> Self {
		self.cancel = Some((call, cancel));
		self
	}

	fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl TokenManager for ShortLivedTokens {
	async fn refresh(&self, current: &AuthContext) -> SyncResultOf<AuthContext> {
		let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
		if let Some((at, cancel)) = &self.cancel {
			if n == *at {
				cancel.cancel();
			}
		}
		Ok(AuthContext::new(current.user_id.clone(), self.token).with_expiry(Utc::now() + self.lifetime))
	}
}

/// Equal timestamps resolve to the remote snapshot under TimestampWins.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_timestamp_tie_prefers_remote() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes").with_conflict_strategy(ConflictStrategy::TimestampWins))?;

	let base = RecordSnapshot::new("notes", "1", json!({"title": "base"}), 1).with_updated_at(Utc::now());
	adapter.seed(base.clone());
	orch.store().seed(base);

	orch.enqueue(SyncOperation::update("notes", "1", json!({"title": "A"})))
		.await?;
	let local = orch.record("notes", "1").ok_or("missing local")?;
	assert_eq!(local.version, 2);

	adapter.put_remote(RecordSnapshot {
		props: json!({"title": "B"}),
		version: 2,
		..local.clone()
	});

	let mut events = orch.subscribe_events();
	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);
	assert_eq!(result.conflicts, 1);

	let resolved = orch.record("notes", "1").ok_or("missing local")?;
	assert_eq!(resolved.field("title"), Some(&json!("B")));
	assert_eq!(resolved.version, 2);
	// Remote already held the winner; nothing was written back.
	assert_eq!(adapter.call_count(AdapterCall::Update), 0);

	let state = orch.record_state("notes", "1").ok_or("missing state")?;
	assert!(!state.is_dirty());

	let events = events.drain();
	assert!(events.iter().any(|e| matches!(e, SyncEvent::ConflictDetected { fields, .. } if fields == &vec!["title".to_string()])));
	assert!(events.iter().any(|e| matches!(
		e,
		SyncEvent::ConflictResolved { strategy: ConflictStrategy::TimestampWins, .. }
	)));
	Ok(())
}

/// Three network failures then success: retried with growing backoff, never
/// dead-lettered.
#[cfg(feature = "unit-tests")]
#[tokio::test(start_paused = true)]
async fn test_network_errors_retry_then_succeed() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	adapter.inject_fault(AdapterCall::Create, SyncError::Network("connection reset".into()), 3);
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	let mut events = orch.subscribe_events();
	let result = orch.flush().await;

	assert_eq!(result.retried, 3);
	assert_eq!(result.dead_lettered, 0);
	assert!(orch.dead_letters().is_empty());
	assert_eq!(adapter.call_count(AdapterCall::Create), 4);
	assert!(adapter.get("notes", "1").is_some());

	let delays: Vec<Duration> = events
		.drain()
		.into_iter()
		.filter_map(|e| match e {
			SyncEvent::SyncError {
				retry_in: Some(d),
				dead_lettered: false,
				..
			} => Some(d),
			_ => None,
		})
		.collect();
	assert_eq!(delays.len(), 3);
	assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);

	let state = orch.record_state("notes", "1").ok_or("missing state")?;
	assert_eq!(state.local_version(), state.last_synced_version());
	assert!(!state.is_dirty());
	Ok(())
}

/// Exhausting the attempt ceiling moves the operation to the dead-letter
/// queue.
#[cfg(feature = "unit-tests")]
#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_dead_letters() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	adapter.inject_fault(AdapterCall::Create, SyncError::Timeout(Duration::from_secs(1)), 10);
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	let result = orch.flush().await;

	assert_eq!(result.dead_lettered, 1);
	assert_eq!(adapter.call_count(AdapterCall::Create), 5);
	let dead = orch.dead_letters();
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].operation.attempts, 5);
	assert_eq!(dead[0].operation.state, OperationState::DeadLetter);
	assert_eq!(orch.pending_operations(), 0);
	// Still dirty: the change never reached the backend.
	assert!(orch.record_state("notes", "1").ok_or("missing state")?.is_dirty());
	Ok(())
}

fn delta_fixture() -> (Arc<MemoryAdapter>, RecordSnapshot) {
	let caps = Capabilities {
		delta: true,
		..Capabilities::minimal()
	};
	let adapter = Arc::new(MemoryAdapter::new(caps));
	let base = RecordSnapshot::new(
		"docs",
		"d1",
		json!({
			"title": "quarterly report",
			"body": "lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor",
			"owner": "ops",
			"tags": ["finance", "q3"]
		}),
		1,
	)
	.with_updated_at(Utc::now());
	adapter.seed(base.clone());
	(adapter, base)
}

/// A patch failing integrity is retransmitted as the full record.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_integrity_failure_retransmits_full_record() -> Result<(), Box<dyn std::error::Error>> {
	let (adapter, base) = delta_fixture();
	adapter.inject_fault(AdapterCall::UpdatePatch, SyncError::Integrity("checksum mismatch".into()), 1);
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("docs"))?;
	orch.store().seed(base);

	let mut props = orch.record("docs", "d1").ok_or("missing")?.props;
	props["owner"] = json!("finance");
	orch.enqueue(SyncOperation::update("docs", "d1", props)).await?;

	let result = orch.flush().await;
	assert!(result.dead_lettered == 0, "{:?}", result.error);
	assert_eq!(adapter.call_count(AdapterCall::UpdatePatch), 1);
	assert_eq!(adapter.call_count(AdapterCall::Update), 1);

	let remote = adapter.get("docs", "d1").ok_or("missing remote")?;
	assert_eq!(remote.field("owner"), Some(&json!("finance")));
	assert_eq!(remote.version, 2);
	Ok(())
}

/// A second integrity failure on the full retransmission is terminal.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_repeated_integrity_failure_is_terminal() -> Result<(), Box<dyn std::error::Error>> {
	let (adapter, base) = delta_fixture();
	adapter.inject_fault(AdapterCall::UpdatePatch, SyncError::Integrity("checksum mismatch".into()), 1);
	adapter.inject_fault(AdapterCall::Update, SyncError::Integrity("checksum mismatch".into()), 1);
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("docs"))?;
	orch.store().seed(base);

	let mut props = orch.record("docs", "d1").ok_or("missing")?.props;
	props["owner"] = json!("finance");
	orch.enqueue(SyncOperation::update("docs", "d1", props)).await?;

	let result = orch.flush().await;
	assert_eq!(result.dead_lettered, 1);
	assert_eq!(result.retried, 1);
	let dead = orch.dead_letters();
	assert_eq!(dead.len(), 1);
	assert!(matches!(dead[0].error, SyncError::Integrity(_)));
	assert!(dead[0].operation.force_full);
	Ok(())
}

/// Replaying an operation that already synced makes no network call.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_replayed_operation_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	let op = orch
		.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	assert!(orch.flush().await.success);
	let before = orch.record_state("notes", "1").ok_or("missing state")?;

	adapter.reset_calls();
	orch.enqueue(op).await?;
	let result = orch.flush().await;
	assert!(result.success);
	assert_eq!(result.affected, 0);
	assert!(adapter.calls().is_empty(), "{:?}", adapter.calls());
	assert_eq!(orch.record_state("notes", "1").ok_or("missing state")?.local_version(), before.local_version());
	Ok(())
}

/// Entities requiring authentication hold their operations until a context
/// arrives.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_auth_gated_entity_parks_and_resumes() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()).with_required_token("secret"));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("accounts").requiring_authentication())?;

	orch.enqueue(SyncOperation::create("accounts", "a1", json!({"name": "Ada"})))
		.await?;
	let result = orch.sync_entity("accounts").await;
	assert!(!result.success);
	assert!(matches!(result.error, Some(SyncError::Authentication(_))));
	assert_eq!(orch.parked_operations(), 1);
	assert_eq!(adapter.write_count(), 0);

	orch.set_auth_context(AuthContext::new("ada", "secret")).await;
	assert_eq!(orch.parked_operations(), 0);
	let result = orch.sync_entity("accounts").await;
	assert!(result.success, "{:?}", result.error);
	assert!(adapter.get("accounts", "a1").is_some());
	Ok(())
}

/// A rejected token clears the context and parks the operation rather than
/// dead-lettering it.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_rejected_token_parks_operation() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()).with_required_token("secret"));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("accounts").requiring_authentication())?;
	orch.set_auth_context(AuthContext::new("ada", "stale")).await;

	orch.enqueue(SyncOperation::create("accounts", "a1", json!({"name": "Ada"})))
		.await?;
	let result = orch.flush().await;
	assert!(matches!(result.error, Some(SyncError::Authentication(_))));
	assert!(orch.dead_letters().is_empty());
	assert_eq!(orch.parked_operations(), 1);

	orch.set_auth_context(AuthContext::new("ada", "secret")).await;
	assert!(orch.flush().await.success);
	assert!(adapter.get("accounts", "a1").is_some());
	Ok(())
}

/// A cancelled sync leaves its operations queued and reports how many remain.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_cancelled_sync_keeps_operations() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	for i in 0..3 {
		orch.enqueue(SyncOperation::create("notes", format!("{}", i), json!({"n": i})))
			.await?;
	}

	let mut events = orch.subscribe_events();
	let cancel = CancellationToken::new();
	cancel.cancel();
	let result = orch.sync_entity_with_cancel("notes", cancel).await;

	assert!(result.cancelled);
	assert_eq!(orch.pending_operations(), 3);
	assert_eq!(adapter.write_count(), 0);
	assert!(events
		.drain()
		.iter()
		.any(|e| matches!(e, SyncEvent::SyncCancelled { remaining: 3, .. })));
	Ok(())
}

/// Deletions propagate as remote tombstones.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_local_delete_reaches_remote() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	assert!(orch.flush().await.success);
	orch.enqueue(SyncOperation::delete("notes", "1")).await?;
	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);

	assert_eq!(adapter.call_count(AdapterCall::Delete), 1);
	assert!(adapter.get("notes", "1").is_none_or(|r| r.tombstone));
	let state = orch.record_state("notes", "1").ok_or("missing state")?;
	assert!(!state.is_dirty());
	Ok(())
}

/// A near-expiry context is refreshed before use even when the entity does
/// not require authentication.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_near_expiry_token_refreshed_for_open_entity() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()).with_required_token("fresh"));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	let tokens = Arc::new(ShortLivedTokens::new("fresh", chrono::Duration::hours(1)));
	orch.set_token_manager(tokens.clone()).await;
	orch.set_auth_context(AuthContext::new("ada", "stale").with_expiry(Utc::now() + chrono::Duration::seconds(10)))
		.await;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	let result = orch.sync_entity("notes").await;

	assert!(result.success, "{:?}", result.error);
	assert_eq!(tokens.calls(), 1);
	assert!(adapter.get("notes", "1").is_some());
	Ok(())
}

/// Records sharing a timestamp with the pull cursor are not skipped when a
/// pull stops between them, and undated records are still pulled once a
/// cursor exists.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_pull_cursor_keeps_tied_and_undated_records() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	let at = Utc::now();
	adapter.seed(RecordSnapshot::new("notes", "r1", json!({"n": 1}), 1).with_updated_at(at));
	adapter.seed(RecordSnapshot::new("notes", "r2", json!({"n": 2}), 1).with_updated_at(at));

	// Refresh 1 happens at the start of the pull, refresh 2 while r1 is
	// processed, so the pull stops before r2.
	let cancel = CancellationToken::new();
	let tokens = Arc::new(ShortLivedTokens::new("t", chrono::Duration::seconds(10)).cancelling_on(2, cancel.clone()));
	orch.set_token_manager(tokens).await;
	orch.set_auth_context(AuthContext::new("ada", "t").with_expiry(Utc::now() + chrono::Duration::seconds(10)))
		.await;

	let first = orch.sync_entity_with_cancel("notes", cancel).await;
	assert!(first.cancelled);
	assert_eq!(first.affected, 1);
	assert!(orch.record("notes", "r1").is_some());
	assert!(orch.record("notes", "r2").is_none());

	let second = orch.sync_entity("notes").await;
	assert!(second.success, "{:?}", second.error);
	assert_eq!(second.affected, 1);
	assert!(orch.record("notes", "r2").is_some());

	adapter.seed(RecordSnapshot::new("notes", "r3", json!({"n": 3}), 1));
	let third = orch.sync_entity("notes").await;
	assert!(third.success, "{:?}", third.error);
	assert_eq!(third.affected, 1);
	assert!(orch.record("notes", "r3").is_some());
	Ok(())
}

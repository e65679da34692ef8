mod common;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vanopticon_bifrost::adapter::{AdapterCall, Capabilities, MemoryAdapter};
use vanopticon_bifrost::model::{Priority, RecordSnapshot, SyncEntityConfig, SyncOperation};
use vanopticon_bifrost::sync::{
	BatchStrategy, NetworkCondition, OrchestratorConfig, SchedulerConfig, SyncEvent, SystemConditions,
};

fn parallel_caps() -> Capabilities {
	Capabilities {
		concurrent_writes: true,
		..Capabilities::minimal()
	}
}

/// 3 critical and 5 normal operations at a concurrency limit of 2: every
/// critical operation starts before any normal one, two at a time.
#[cfg(feature = "unit-tests")]
#[tokio::test(start_paused = true)]
async fn test_critical_operations_run_first() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(parallel_caps()).with_latency(Duration::from_millis(50)));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	for i in 0..5 {
		orch.enqueue(SyncOperation::create("notes", format!("n{}", i), json!({"i": i})))
			.await?;
	}
	for i in 0..3 {
		orch.enqueue(
			SyncOperation::create("notes", format!("c{}", i), json!({"i": i})).with_priority(Priority::Critical),
		)
		.await?;
	}

	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);
	assert_eq!(result.affected, 8);

	let started: Vec<String> = adapter
		.calls()
		.into_iter()
		.filter(|c| c.call == AdapterCall::Read)
		.filter_map(|c| c.record_id)
		.collect();
	assert_eq!(started.len(), 8);
	let last_critical = started
		.iter()
		.rposition(|id| id.starts_with('c'))
		.ok_or("no critical reads")?;
	let first_normal = started
		.iter()
		.position(|id| id.starts_with('n'))
		.ok_or("no normal reads")?;
	assert!(last_critical < first_normal, "{:?}", started);
	assert_eq!(adapter.max_concurrency(), 2);
	Ok(())
}

/// Two queued operations for one record never reach the backend at the
/// same time, even through the background dispatcher.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_at_most_one_in_flight_per_record() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(parallel_caps()).with_latency(Duration::from_millis(20)));
	let orch = common::orchestrator(adapter.clone(), 4);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "first"})))
		.await?;
	orch.enqueue(SyncOperation::update("notes", "1", json!({"title": "second"})))
		.await?;
	orch.enqueue(SyncOperation::create("notes", "2", json!({"title": "other"})))
		.await?;

	Arc::clone(&orch).start().await;
	let settled = common::wait_until(300, || {
		orch.pending_operations() == 0
			&& ["1", "2"]
				.iter()
				.all(|id| orch.record_state("notes", id).is_some_and(|s| !s.is_dirty()))
	})
	.await;
	orch.shutdown().await;

	assert!(settled, "records did not settle");
	assert!(!adapter.overlap_detected());
	let remote = adapter.get("notes", "1").ok_or("missing remote")?;
	assert_eq!(remote.field("title"), Some(&json!("second")));
	Ok(())
}

/// Several operations on one record collapse into a single write.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_operations_on_one_record_are_coalesced() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(parallel_caps()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "a"})))
		.await?;
	orch.enqueue(SyncOperation::update("notes", "1", json!({"title": "b"})))
		.await?;
	orch.enqueue(SyncOperation::update("notes", "1", json!({"title": "c"})))
		.await?;

	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);
	assert_eq!(adapter.write_count(), 1);
	let remote = adapter.get("notes", "1").ok_or("missing remote")?;
	assert_eq!(remote.field("title"), Some(&json!("c")));
	assert_eq!(remote.version, 3);
	Ok(())
}

/// After a successful cycle every record is clean and its versions agree.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_successful_cycle_leaves_records_clean() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(parallel_caps()));
	let orch = common::orchestrator(adapter.clone(), 3);
	orch.register_entity(SyncEntityConfig::new("notes"))?;

	for i in 0..12 {
		orch.enqueue(SyncOperation::create("notes", format!("{}", i), json!({"i": i})))
			.await?;
	}
	for i in 0..4 {
		orch.enqueue(SyncOperation::update("notes", format!("{}", i), json!({"i": i * 10})))
			.await?;
	}
	let result = orch.sync_entity("notes").await;
	assert!(result.success, "{:?}", result.error);

	for key in orch.store().keys_for("notes") {
		let state = orch
			.record_state(&key.entity, &key.record_id)
			.ok_or("missing state")?;
		assert!(state.is_consistent());
		assert!(!state.is_dirty(), "{} still dirty", key);
		assert_eq!(state.local_version(), state.last_synced_version());
	}
	assert!(orch.store().dirty_keys("notes").is_empty());
	Ok(())
}

/// Chunked mode sends new records through one batch call.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_chunked_creates_use_batch_call() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::full()));
	let orch = common::orchestrator_with(
		adapter.clone(),
		OrchestratorConfig {
			batch_strategy: BatchStrategy::Chunked,
			..common::test_config(2)
		},
	);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	for i in 0..10 {
		orch.enqueue(SyncOperation::create("notes", format!("{}", i), json!({"i": i})))
			.await?;
	}

	let mut events = orch.subscribe_events();
	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);
	assert_eq!(result.affected, 10);
	let percents: Vec<u8> = events
		.drain()
		.into_iter()
		.filter_map(|e| match e {
			SyncEvent::SyncProgress { percent, .. } => Some(percent),
			_ => None,
		})
		.collect();
	assert_eq!(percents.len(), 10);
	assert!(percents.windows(2).all(|w| w[0] <= w[1]));
	assert_eq!(percents.last(), Some(&100));
	assert_eq!(adapter.call_count(AdapterCall::BatchCreate), 1);
	assert_eq!(adapter.call_count(AdapterCall::Create), 0);
	assert_eq!(adapter.record_count("notes"), 10);
	assert!(orch.store().dirty_keys("notes").is_empty());
	Ok(())
}

/// Large batched updates are sent compressed when the backend accepts it.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_chunked_updates_are_compressed() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::full()));
	let orch = common::orchestrator_with(
		adapter.clone(),
		OrchestratorConfig {
			batch_strategy: BatchStrategy::Chunked,
			..common::test_config(2)
		},
	);
	orch.register_entity(SyncEntityConfig::new("docs"))?;

	let body = "the quick brown fox jumps over the lazy dog ".repeat(40);
	for i in 0..10 {
		let base = RecordSnapshot::new("docs", format!("{}", i), json!({"body": body, "rev": 0}), 1)
			.with_updated_at(Utc::now());
		adapter.seed(base.clone());
		orch.store().seed(base);
	}
	for i in 0..10 {
		orch.enqueue(SyncOperation::update("docs", format!("{}", i), json!({"body": body, "rev": 1})))
			.await?;
	}

	let result = orch.flush().await;
	assert!(result.success, "{:?}", result.error);
	assert_eq!(adapter.call_count(AdapterCall::BatchCompressed), 1);
	for i in 0..10 {
		let remote = adapter.get("docs", &format!("{}", i)).ok_or("missing remote")?;
		assert_eq!(remote.field("rev"), Some(&json!(1)));
		assert_eq!(remote.version, 2);
	}
	Ok(())
}

/// Remote changes pushed through a subscription land in the local store.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_watch_applies_remote_changes() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::full()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	orch.watch_entity("notes").await?;

	adapter.put_remote(RecordSnapshot::new("notes", "w1", json!({"title": "from elsewhere"}), 4).with_updated_at(Utc::now()));

	let applied = common::wait_until(200, || orch.record("notes", "w1").is_some()).await;
	orch.shutdown().await;

	assert!(applied, "change event was not applied");
	let local = orch.record("notes", "w1").ok_or("missing local")?;
	assert_eq!(local.version, 4);
	assert_eq!(orch.record_state("notes", "w1").ok_or("missing state")?.last_synced_version(), 4);
	Ok(())
}

/// Operations run by the background dispatcher are bracketed by start and
/// completion events.
#[cfg(feature = "unit-tests")]
#[tokio::test]
async fn test_dispatcher_publishes_started_before_completed() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator(adapter.clone(), 2);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	// Suspend scheduled syncs so only the dispatcher runs the operation.
	orch.set_conditions(SystemConditions {
		network: NetworkCondition::Offline,
		..SystemConditions::default()
	});
	let mut events = orch.subscribe_events();

	orch.enqueue(SyncOperation::create("notes", "1", json!({"title": "A"})))
		.await?;
	Arc::clone(&orch).start().await;

	let mut seen = Vec::new();
	let completed = common::wait_until(300, || {
		seen.extend(events.drain());
		seen.iter()
			.any(|e| matches!(e, SyncEvent::SyncCompleted { affected: 1, .. }))
	})
	.await;
	orch.shutdown().await;

	assert!(completed, "no completion event: {:?}", seen);
	let started = seen
		.iter()
		.position(|e| matches!(e, SyncEvent::SyncStarted { .. }))
		.ok_or("no start event")?;
	let done = seen
		.iter()
		.position(|e| matches!(e, SyncEvent::SyncCompleted { affected: 1, .. }))
		.ok_or("no completion for the write")?;
	assert!(started < done, "{:?}", seen);
	Ok(())
}

/// The scheduler loop wakes when an entity falls due, not only on the
/// coarse tick.
#[cfg(feature = "unit-tests")]
#[tokio::test(start_paused = true)]
async fn test_scheduled_pull_runs_when_entity_is_due() -> Result<(), Box<dyn std::error::Error>> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::minimal()));
	let orch = common::orchestrator_with(
		adapter.clone(),
		OrchestratorConfig {
			scheduler: SchedulerConfig {
				base_interval: Duration::from_secs(2),
				min_interval: Duration::from_secs(1),
				max_interval: Duration::from_secs(10),
				metrics_window: 5,
			},
			scheduler_tick: Duration::from_secs(3600),
			..common::test_config(2)
		},
	);
	orch.register_entity(SyncEntityConfig::new("notes"))?;
	Arc::clone(&orch).start().await;

	// A newly registered entity is synced straight away.
	let first = common::wait_until(100, || {
		orch.scheduler()
			.metrics("notes")
			.is_some_and(|m| m.samples >= 1)
	})
	.await;
	assert!(first, "first scheduled sync did not run");

	adapter.seed(RecordSnapshot::new("notes", "late", json!({"n": 1}), 1).with_updated_at(Utc::now()));
	let pulled = common::wait_until(2000, || orch.record("notes", "late").is_some()).await;
	orch.shutdown().await;

	assert!(pulled, "due entity was not synced again");
	Ok(())
}

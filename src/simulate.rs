//! Scripted run against the in-process backend, used by `bifrost simulate`.

use chrono::{Duration as ChronoDuration, Utc};
use log::info;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapter::{AdapterCall, Capabilities, MemoryAdapter};
use crate::config::Settings;
use crate::error::SyncError;
use crate::model::{
	ConflictStrategy, FieldKind, FieldRule, NumericMerge, Priority, RecordSnapshot, SyncEntityConfig,
	SyncOperation, SyncResult,
};
use crate::observability::MetricsRegistry;
use crate::sync::{DeadLetter, EntityRegistry, LocalStore, SyncOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationOptions {
	/// New local records per entity.
	pub records: usize,
	/// Records edited on both sides before the sync.
	pub conflicts: usize,
	/// Network failures injected into record creation.
	pub failures: u32,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
	pub results: BTreeMap<String, SyncResult>,
	pub drained: SyncResult,
	pub conflicts_recorded: usize,
	pub dead_letters: Vec<DeadLetter>,
	#[serde(skip)]
	pub metrics: String,
}

pub async fn simulate(
	settings: &Settings,
	opts: SimulationOptions,
	metrics: Arc<MetricsRegistry>,
) -> anyhow::Result<SimulationReport> {
	let adapter = Arc::new(MemoryAdapter::new(Capabilities::full()).with_name("memory-sim"));
	let registry = Arc::new(EntityRegistry::new());
	let store = Arc::new(LocalStore::new());

	registry.register(
		SyncEntityConfig::new("tasks")
			.with_priority(Priority::High)
			.with_conflict_strategy(ConflictStrategy::IntelligentMerge)
			.with_field_rule("estimate", FieldRule::of(FieldKind::Number(NumericMerge::Max)))
			.with_semantic_field("status"),
	)?;
	registry.register(SyncEntityConfig::new("notes").with_conflict_strategy(ConflictStrategy::TimestampWins))?;

	let orchestrator = SyncOrchestrator::new(
		adapter.clone(),
		registry,
		store.clone(),
		settings.orchestrator_config(),
	)
	.with_metrics(metrics.clone());

	// Shared history: both sides start from the same synced copies.
	let base_time = Utc::now() - ChronoDuration::minutes(10);
	for i in 0..opts.conflicts {
		let base = RecordSnapshot::new(
			"tasks",
			format!("task-{}", i),
			json!({"title": format!("task {}", i), "estimate": 3, "status": "open", "tags": ["a"]}),
			1,
		)
		.with_updated_at(base_time);
		adapter.seed(base.clone());
		store.seed(base);
	}

	for i in 0..opts.conflicts {
		let id = format!("task-{}", i);
		orchestrator
			.enqueue(SyncOperation::update(
				"tasks",
				id.clone(),
				json!({"title": format!("task {} (local)", i), "estimate": 5, "status": "open", "tags": ["a", "b"]}),
			))
			.await?;
		adapter.put_remote(
			RecordSnapshot::new(
				"tasks",
				id,
				json!({"title": format!("task {}", i), "estimate": 8, "status": "closed", "tags": ["a", "c"]}),
				2,
			)
			.with_updated_at(Utc::now()),
		);
	}

	for i in 0..opts.records {
		orchestrator
			.enqueue(SyncOperation::create(
				"notes",
				format!("note-{}", i),
				json!({"body": format!("note {}", i)}),
			))
			.await?;
	}

	if opts.failures > 0 {
		for call in [AdapterCall::Create, AdapterCall::BatchCreate] {
			adapter.inject_fault(call, SyncError::Network("simulated outage".to_string()), opts.failures);
		}
	}

	info!(
		"Simulating {} records, {} conflicts, {} injected failures",
		opts.records, opts.conflicts, opts.failures
	);
	let results: BTreeMap<String, SyncResult> = orchestrator.sync_all().await.into_iter().collect();
	let drained = orchestrator.flush().await;

	Ok(SimulationReport {
		results,
		drained,
		conflicts_recorded: orchestrator.conflict_history().len(),
		dead_letters: orchestrator.dead_letters(),
		metrics: metrics.encode(),
	})
}

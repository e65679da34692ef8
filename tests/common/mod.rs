#![allow(dead_code)]
/// Common test utilities and helpers for integration tests.
use std::sync::Arc;
use std::time::Duration;

use vanopticon_bifrost::adapter::MemoryAdapter;
use vanopticon_bifrost::sync::{EntityRegistry, LocalStore, OrchestratorConfig, RetryPolicy, SyncOrchestrator};

/// Orchestrator config with deterministic backoff (no jitter).
pub fn test_config(concurrency_limit: usize) -> OrchestratorConfig {
	OrchestratorConfig {
		concurrency_limit,
		retry: RetryPolicy {
			jitter: false,
			..RetryPolicy::default()
		},
		..OrchestratorConfig::default()
	}
}

pub fn orchestrator(adapter: Arc<MemoryAdapter>, concurrency_limit: usize) -> Arc<SyncOrchestrator> {
	orchestrator_with(adapter, test_config(concurrency_limit))
}

pub fn orchestrator_with(adapter: Arc<MemoryAdapter>, config: OrchestratorConfig) -> Arc<SyncOrchestrator> {
	Arc::new(SyncOrchestrator::new(
		adapter,
		Arc::new(EntityRegistry::new()),
		Arc::new(LocalStore::new()),
		config,
	))
}

/// Poll `check` until it holds or `max_polls` polls of 10ms elapse.
pub async fn wait_until(max_polls: u32, mut check: impl FnMut() -> bool) -> bool {
	for _ in 0..max_polls {
		if check() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	check()
}

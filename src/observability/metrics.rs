use prometheus::{
	Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

const NAMESPACE: &str = "bifrost";

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Operation metrics
	/// Labels: entity, outcome (succeeded, retried, dead_lettered, cancelled, awaiting_auth, superseded)
	pub sync_operations_total: IntCounterVec,
	/// Labels: kind
	pub sync_errors_total: IntCounterVec,
	pub sync_retries_total: IntCounter,
	pub sync_dead_letters_total: IntCounter,
	pub sync_operation_duration_seconds: Histogram,

	// Queue metrics
	/// Labels: priority
	pub queue_depth: IntGaugeVec,

	// Conflict metrics
	/// Labels: strategy
	pub conflicts_total: IntCounterVec,
	pub conflict_fields_flagged_total: IntCounter,

	// Transfer metrics
	pub bytes_transmitted_total: IntCounter,
	/// Labels: source (delta, compression)
	pub bytes_saved_total: IntCounterVec,
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let sync_operations_total = IntCounterVec::new(
			Opts::new("sync_operations_total", "Sync operations by final outcome").namespace(NAMESPACE),
			&["entity", "outcome"],
		)?;

		let sync_errors_total = IntCounterVec::new(
			Opts::new("sync_errors_total", "Failed adapter attempts by error kind").namespace(NAMESPACE),
			&["kind"],
		)?;

		let sync_retries_total = IntCounter::with_opts(
			Opts::new("sync_retries_total", "Operations re-queued for another attempt").namespace(NAMESPACE),
		)?;

		let sync_dead_letters_total = IntCounter::with_opts(
			Opts::new("sync_dead_letters_total", "Operations moved to the dead-letter queue").namespace(NAMESPACE),
		)?;

		let sync_operation_duration_seconds = Histogram::with_opts(
			HistogramOpts::new(
				"sync_operation_duration_seconds",
				"Duration of one record sync in seconds",
			)
			.namespace(NAMESPACE)
			.buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
		)?;

		let queue_depth = IntGaugeVec::new(
			Opts::new("queue_depth", "Queued operations per priority tier").namespace(NAMESPACE),
			&["priority"],
		)?;

		let conflicts_total = IntCounterVec::new(
			Opts::new("conflicts_total", "Conflicts resolved by strategy").namespace(NAMESPACE),
			&["strategy"],
		)?;

		let conflict_fields_flagged_total = IntCounter::with_opts(
			Opts::new(
				"conflict_fields_flagged_total",
				"Fields resolved below the confidence threshold",
			)
			.namespace(NAMESPACE),
		)?;

		let bytes_transmitted_total = IntCounter::with_opts(
			Opts::new("bytes_transmitted_total", "Payload bytes sent to backends").namespace(NAMESPACE),
		)?;

		let bytes_saved_total = IntCounterVec::new(
			Opts::new(
				"bytes_saved_total",
				"Payload bytes avoided through delta encoding and compression",
			)
			.namespace(NAMESPACE),
			&["source"],
		)?;

		registry.register(Box::new(sync_operations_total.clone()))?;
		registry.register(Box::new(sync_errors_total.clone()))?;
		registry.register(Box::new(sync_retries_total.clone()))?;
		registry.register(Box::new(sync_dead_letters_total.clone()))?;
		registry.register(Box::new(sync_operation_duration_seconds.clone()))?;
		registry.register(Box::new(queue_depth.clone()))?;
		registry.register(Box::new(conflicts_total.clone()))?;
		registry.register(Box::new(conflict_fields_flagged_total.clone()))?;
		registry.register(Box::new(bytes_transmitted_total.clone()))?;
		registry.register(Box::new(bytes_saved_total.clone()))?;

		Ok(Self {
			registry,
			sync_operations_total,
			sync_errors_total,
			sync_retries_total,
			sync_dead_letters_total,
			sync_operation_duration_seconds,
			queue_depth,
			conflicts_total,
			conflict_fields_flagged_total,
			bytes_transmitted_total,
			bytes_saved_total,
		})
	}

	pub fn operation(&self, entity: &str, outcome: &str) {
		self.sync_operations_total.with_label_values(&[entity, outcome]).inc();
	}

	pub fn saved(&self, source: &str, bytes: usize) {
		self.bytes_saved_total.with_label_values(&[source]).inc_by(bytes as u64);
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Build the metrics registry handed to the orchestrator
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()?))
}

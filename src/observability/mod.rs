pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use std::path::Path;
use std::sync::Arc;

/// Process-wide observability handles
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Initialize logging and the metrics registry
pub fn init_observability(level: &str, log_file: Option<&Path>) -> anyhow::Result<ObservabilityState> {
	init_logging(level, log_file)?;
	let metrics = init_metrics()?;

	log::info!("Observability initialized: logging at {}, metrics enabled", level);

	Ok(ObservabilityState { metrics })
}

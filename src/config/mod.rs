use log::Level;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::{BatchStrategy, OrchestratorConfig, RetryPolicy, SchedulerConfig};

const CONFIG_FILE: &str = "bifrost.json";

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): `/etc/vanopticon/bifrost.json`, the
/// user config folder (optional), and environment variables prefixed with
/// `BFR_` (nested keys separated by `__`, e.g. `BFR_RETRY__MAX_ATTEMPTS`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	#[serde(deserialize_with = "deserialize_level")]
	pub log_level: Level,
	pub log_file: Option<PathBuf>,
	pub concurrency_limit: usize,
	pub operation_timeout_ms: u64,
	pub queue: QueueSettings,
	pub retry: RetrySettings,
	pub batch: BatchSettings,
	pub compression: CompressionSettings,
	pub conflict: ConflictSettings,
	pub scheduler: SchedulerSettings,
	pub events: EventSettings,
	pub auth: AuthSettings,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			log_level: Level::Info,
			log_file: None,
			concurrency_limit: 4,
			operation_timeout_ms: 30_000,
			queue: QueueSettings::default(),
			retry: RetrySettings::default(),
			batch: BatchSettings::default(),
			compression: CompressionSettings::default(),
			conflict: ConflictSettings::default(),
			scheduler: SchedulerSettings::default(),
			events: EventSettings::default(),
			auth: AuthSettings::default(),
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct QueueSettings {
	/// Wait after which a queued operation is promoted one priority tier.
	pub aging_threshold_ms: u64,
}

impl Default for QueueSettings {
	fn default() -> Self {
		Self {
			aging_threshold_ms: 60_000,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct RetrySettings {
	pub max_attempts: u32,
	pub initial_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub jitter: bool,
}

impl Default for RetrySettings {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_backoff_ms: 500,
			max_backoff_ms: 60_000,
			jitter: true,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct BatchSettings {
	pub strategy: BatchStrategy,
	pub chunk_size: usize,
	/// Recent batch outcomes the adaptive strategy looks at.
	pub adaptive_window: usize,
	pub latency_target_ms: u64,
}

impl Default for BatchSettings {
	fn default() -> Self {
		Self {
			strategy: BatchStrategy::Adaptive,
			chunk_size: 50,
			adaptive_window: 20,
			latency_target_ms: 750,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct CompressionSettings {
	pub enabled: bool,
	/// Payloads smaller than this are sent as is.
	pub threshold_bytes: usize,
	pub probe_bytes: usize,
}

impl Default for CompressionSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			threshold_bytes: 4096,
			probe_bytes: 4096,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct ConflictSettings {
	pub confidence_threshold: f64,
	pub history_capacity: usize,
}

impl Default for ConflictSettings {
	fn default() -> Self {
		Self {
			confidence_threshold: 0.5,
			history_capacity: 256,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
	pub base_interval_ms: u64,
	pub min_interval_ms: u64,
	pub max_interval_ms: u64,
	pub metrics_window: usize,
	pub tick_ms: u64,
}

impl Default for SchedulerSettings {
	fn default() -> Self {
		Self {
			base_interval_ms: 300_000,
			min_interval_ms: 15_000,
			max_interval_ms: 3_600_000,
			metrics_window: 10,
			tick_ms: 1000,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct EventSettings {
	pub buffer_capacity: usize,
}

impl Default for EventSettings {
	fn default() -> Self {
		Self {
			buffer_capacity: 1024,
		}
	}
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct AuthSettings {
	/// Tokens expiring within this window are refreshed before use.
	pub refresh_margin_secs: u64,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			refresh_margin_secs: 60,
		}
	}
}

impl Settings {
	pub fn orchestrator_config(&self) -> OrchestratorConfig {
		OrchestratorConfig {
			concurrency_limit: self.concurrency_limit.max(1),
			operation_timeout: Duration::from_millis(self.operation_timeout_ms),
			aging_threshold: Duration::from_millis(self.queue.aging_threshold_ms),
			retry: RetryPolicy {
				max_attempts: self.retry.max_attempts,
				initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
				max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
				jitter: self.retry.jitter,
			},
			batch_strategy: self.batch.strategy,
			chunk_size: self.batch.chunk_size.max(1),
			adaptive_window: self.batch.adaptive_window,
			latency_target: Duration::from_millis(self.batch.latency_target_ms),
			compression_enabled: self.compression.enabled,
			compression_threshold: self.compression.threshold_bytes,
			compression_probe: self.compression.probe_bytes,
			confidence_threshold: self.conflict.confidence_threshold,
			history_capacity: self.conflict.history_capacity,
			scheduler: SchedulerConfig {
				base_interval: Duration::from_millis(self.scheduler.base_interval_ms),
				min_interval: Duration::from_millis(self.scheduler.min_interval_ms),
				max_interval: Duration::from_millis(self.scheduler.max_interval_ms),
				metrics_window: self.scheduler.metrics_window,
			},
			scheduler_tick: Duration::from_millis(self.scheduler.tick_ms.max(1)),
			event_capacity: self.events.buffer_capacity.max(1),
			auth_refresh_margin: Duration::from_secs(self.auth.refresh_margin_secs),
			..OrchestratorConfig::default()
		}
	}
}

impl From<&Settings> for OrchestratorConfig {
	fn from(settings: &Settings) -> Self {
		settings.orchestrator_config()
	}
}

// Case-insensitive, so `debug` from the environment parses like `DEBUG`.
fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: serde::Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;
	raw.parse::<Level>().map_err(serde::de::Error::custom)
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join(CONFIG_FILE);
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join(CONFIG_FILE);
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("BFR")
			.prefix_separator("_")
			.separator("__")
			.try_parsing(true),
	);

	let mut s: Settings = builder.build()?.try_deserialize()?;
	apply_env_overrides(&mut s);
	Ok(s)
}

/// Load a single file on top of the defaults. Environment variables are not
/// consulted.
pub fn load_from(path: &Path) -> Result<Settings, SettingsError> {
	let cfg = config::Config::builder()
		.add_source(config::File::from(path.to_path_buf()).required(true))
		.build()?;
	Ok(cfg.try_deserialize()?)
}

// Direct variables win over everything the builder produced.
fn apply_env_overrides(s: &mut Settings) {
	if let Ok(l) = std::env::var("BFR_LOG_LEVEL") {
		if let Ok(parsed) = l.parse::<Level>() {
			s.log_level = parsed;
		}
	}
	if let Ok(c) = std::env::var("BFR_CONCURRENCY_LIMIT") {
		if let Ok(parsed) = c.parse::<usize>() {
			s.concurrency_limit = parsed;
		}
	}
	if let Ok(a) = std::env::var("BFR_RETRY_MAX_ATTEMPTS") {
		if let Ok(parsed) = a.parse::<u32>() {
			s.retry.max_attempts = parsed;
		}
	}
	if let Ok(t) = std::env::var("BFR_OPERATION_TIMEOUT_MS") {
		if let Ok(parsed) = t.parse::<u64>() {
			s.operation_timeout_ms = parsed;
		}
	}
}

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::model::Priority;

/// Link quality reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkCondition {
	Excellent,
	Good,
	/// Slow or metered link.
	Constrained,
	Offline,
}

impl NetworkCondition {
	/// Interval multiplier; `None` suspends scheduled syncs.
	fn factor(self) -> Option<f64> {
		match self {
			NetworkCondition::Excellent => Some(0.75),
			NetworkCondition::Good => Some(1.0),
			NetworkCondition::Constrained => Some(2.5),
			NetworkCondition::Offline => None,
		}
	}

	pub fn is_constrained(self) -> bool {
		matches!(self, NetworkCondition::Constrained)
	}
}

impl Default for NetworkCondition {
	fn default() -> Self {
		NetworkCondition::Good
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
	Normal,
	Elevated,
	Critical,
}

impl MemoryPressure {
	fn factor(self) -> f64 {
		match self {
			MemoryPressure::Normal => 1.0,
			MemoryPressure::Elevated => 1.5,
			MemoryPressure::Critical => 3.0,
		}
	}
}

impl Default for MemoryPressure {
	fn default() -> Self {
		MemoryPressure::Normal
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemConditions {
	pub network: NetworkCondition,
	pub memory: MemoryPressure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
	pub base_interval: Duration,
	pub min_interval: Duration,
	pub max_interval: Duration,
	/// Rolling window of syncs kept per entity.
	pub metrics_window: usize,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			base_interval: Duration::from_secs(300),
			min_interval: Duration::from_secs(15),
			max_interval: Duration::from_secs(3600),
			metrics_window: 10,
		}
	}
}

#[derive(Debug, Clone, Copy)]
struct Sample {
	duration: Duration,
	changes: usize,
	failed: bool,
}

/// Rolling per-entity statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetrics {
	pub samples: usize,
	pub mean_duration: Duration,
	/// Mean records changed per sync.
	pub change_frequency: f64,
	pub failure_rate: f64,
	/// Consecutive most recent syncs that found nothing to do.
	pub idle_streak: usize,
	pub interval: Duration,
}

struct Schedule {
	priority: Priority,
	samples: VecDeque<Sample>,
	interval: Duration,
	next_due: Instant,
}

/// Decides when each entity is released for a scheduled sync. Never holds
/// the queue; it only hands out entity names.
pub struct SmartScheduler {
	config: SchedulerConfig,
	entities: Mutex<HashMap<String, Schedule>>,
	conditions: Mutex<SystemConditions>,
}

impl SmartScheduler {
	pub fn new(config: SchedulerConfig) -> Self {
		Self {
			config,
			entities: Mutex::new(HashMap::new()),
			conditions: Mutex::new(SystemConditions::default()),
		}
	}

	/// Track `entity`. A newly registered entity is due immediately.
	pub fn register(&self, entity: &str, priority: Priority) {
		let interval = self.compute(priority, &VecDeque::new());
		self.entities.lock().insert(
			entity.to_string(),
			Schedule {
				priority,
				samples: VecDeque::new(),
				interval,
				next_due: Instant::now(),
			},
		);
	}

	pub fn set_conditions(&self, conditions: SystemConditions) {
		info!(
			"scheduler conditions: network {:?}, memory {:?}",
			conditions.network, conditions.memory
		);
		*self.conditions.lock() = conditions;
		let mut entities = self.entities.lock();
		for s in entities.values_mut() {
			s.interval = self.compute(s.priority, &s.samples);
		}
	}

	pub fn conditions(&self) -> SystemConditions {
		*self.conditions.lock()
	}

	/// Feed the outcome of one sync and reschedule the entity.
	pub fn record_sync(&self, entity: &str, duration: Duration, changes: usize, failed: bool) {
		let mut entities = self.entities.lock();
		let Some(s) = entities.get_mut(entity) else {
			return;
		};
		if s.samples.len() >= self.config.metrics_window.max(1) {
			s.samples.pop_front();
		}
		s.samples.push_back(Sample {
			duration,
			changes,
			failed,
		});
		s.interval = self.compute(s.priority, &s.samples);
		s.next_due = Instant::now() + s.interval;
		debug!("scheduler: {} next sync in {:?}", entity, s.interval);
	}

	/// Entities whose interval elapsed, highest priority first. Each
	/// returned entity is leased until its next interval so it is not
	/// released twice while its sync runs.
	pub fn take_due(&self) -> Vec<String> {
		if self.conditions().network.factor().is_none() {
			return Vec::new();
		}
		let now = Instant::now();
		let mut entities = self.entities.lock();
		let mut due: Vec<(Priority, String)> = entities
			.iter_mut()
			.filter(|(_, s)| s.next_due <= now)
			.map(|(name, s)| {
				s.next_due = now + s.interval;
				(s.priority, name.clone())
			})
			.collect();
		due.sort();
		due.into_iter().map(|(_, name)| name).collect()
	}

	/// Time until the earliest entity is due.
	pub fn next_due_in(&self) -> Option<Duration> {
		self.conditions().network.factor()?;
		let now = Instant::now();
		self.entities
			.lock()
			.values()
			.map(|s| s.next_due.saturating_duration_since(now))
			.min()
	}

	pub fn interval(&self, entity: &str) -> Option<Duration> {
		self.entities.lock().get(entity).map(|s| s.interval)
	}

	pub fn metrics(&self, entity: &str) -> Option<EntityMetrics> {
		let entities = self.entities.lock();
		let s = entities.get(entity)?;
		let n = s.samples.len();
		let (mean_duration, change_frequency, failure_rate) = if n == 0 {
			(Duration::ZERO, 0.0, 0.0)
		} else {
			(
				s.samples.iter().map(|x| x.duration).sum::<Duration>() / n as u32,
				s.samples.iter().map(|x| x.changes).sum::<usize>() as f64 / n as f64,
				s.samples.iter().filter(|x| x.failed).count() as f64 / n as f64,
			)
		};
		Some(EntityMetrics {
			samples: n,
			mean_duration,
			change_frequency,
			failure_rate,
			idle_streak: idle_streak(&s.samples),
			interval: s.interval,
		})
	}

	fn compute(&self, priority: Priority, samples: &VecDeque<Sample>) -> Duration {
		let conditions = self.conditions();
		let tier = match priority {
			Priority::Critical => 0.25,
			Priority::High => 0.5,
			Priority::Normal => 1.0,
			Priority::Low => 2.0,
		};

		let mut factor = tier;
		if !samples.is_empty() {
			let n = samples.len() as f64;
			let churn = samples.iter().map(|s| s.changes).sum::<usize>() as f64 / n;
			let failures = samples.iter().filter(|s| s.failed).count() as f64 / n;
			let idle = idle_streak(samples);

			if churn >= 10.0 {
				factor *= 0.25;
			} else if churn >= 1.0 {
				factor *= 0.5;
			}
			if idle > 0 {
				factor *= 1.5f64.powi(idle.min(4) as i32);
			}
			factor *= 1.0 + 2.0 * failures;
		}

		factor *= conditions.network.factor().unwrap_or(1.0);
		factor *= conditions.memory.factor();

		self.config
			.base_interval
			.mul_f64(factor)
			.clamp(self.config.min_interval, self.config.max_interval.max(self.config.min_interval))
	}
}

fn idle_streak(samples: &VecDeque<Sample>) -> usize {
	samples
		.iter()
		.rev()
		.take_while(|s| s.changes == 0 && !s.failed)
		.count()
}

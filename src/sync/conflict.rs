use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::merge::{FieldMerge, MergeContext, Outcome, Recency};
use crate::model::{ConflictStrategy, RecordSnapshot, SyncEntityConfig};

/// Confidence attached to wholesale (LocalWins / ServerWins) decisions.
const WHOLESALE_CONFIDENCE: f64 = 0.8;
/// Confidence for a timestamp decision with a strict ordering.
const TIMESTAMP_CONFIDENCE: f64 = 0.9;
/// Confidence for a timestamp tie broken toward the remote.
const TIE_CONFIDENCE: f64 = 0.5;
/// Business-rule fields never resolve with high confidence.
const SEMANTIC_CONFIDENCE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
	ValueDifference,
	LocalOnly,
	RemoteOnly,
	TypeMismatch,
	SemanticConflict,
}

/// One field on which the two snapshots disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
	pub field: String,
	pub kind: ConflictKind,
	pub local: Option<Value>,
	pub remote: Option<Value>,
	/// Resolutions that were on the table: each side, plus the merged value
	/// when it differs from both.
	pub candidates: Vec<Value>,
	pub confidence: f64,
	pub outcome: Outcome,
}

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
	pub record: RecordSnapshot,
	/// Strategy that produced `record` (the fallback when the primary could
	/// not decide).
	pub strategy: ConflictStrategy,
	pub fields: Vec<FieldConflict>,
	/// Fields whose resolved value is one side's value, discarding the other.
	pub overridden: Vec<String>,
	/// Fields resolved below the confidence threshold, or flagged for audit.
	pub review: Vec<String>,
	/// Lowest field confidence, 1.0 when nothing conflicted.
	pub confidence: f64,
}

impl Resolution {
	/// The resolved record is exactly the remote one; nothing to push.
	pub fn adopts_remote(&self, remote: &RecordSnapshot) -> bool {
		self.record.same_content(remote)
	}
}

/// Snapshot copy of a resolved conflict, retained for analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
	pub id: String,
	pub entity: String,
	pub record_id: String,
	pub local: RecordSnapshot,
	pub remote: RecordSnapshot,
	pub fields: Vec<FieldConflict>,
	pub strategy: ConflictStrategy,
	pub resolved: RecordSnapshot,
	pub overridden: Vec<String>,
	pub review: Vec<String>,
	pub detected_at: DateTime<Utc>,
	/// Field values and candidates retained.
	pub detailed: bool,
}

impl SyncConflict {
	pub fn new(local: &RecordSnapshot, remote: &RecordSnapshot, resolution: &Resolution) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			entity: local.entity.clone(),
			record_id: local.id.clone(),
			local: local.clone(),
			remote: remote.clone(),
			fields: resolution.fields.clone(),
			strategy: resolution.strategy,
			resolved: resolution.record.clone(),
			overridden: resolution.overridden.clone(),
			review: resolution.review.clone(),
			detected_at: Utc::now(),
			detailed: true,
		}
	}

	/// Drop per-field values and candidates, keeping names, kinds and
	/// confidences.
	pub fn summarized(mut self) -> Self {
		for f in &mut self.fields {
			f.local = None;
			f.remote = None;
			f.candidates.clear();
		}
		self.detailed = false;
		self
	}
}

/// Stateless resolver. Everything it needs arrives as arguments; it never
/// touches shared state.
#[derive(Debug, Clone)]
pub struct ConflictEngine {
	confidence_threshold: f64,
}

impl Default for ConflictEngine {
	fn default() -> Self {
		Self::new(0.5)
	}
}

impl ConflictEngine {
	pub fn new(confidence_threshold: f64) -> Self {
		Self {
			confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
		}
	}

	/// Classify every field present in either snapshot that differs.
	pub fn detect(
		&self,
		config: &SyncEntityConfig,
		local: &RecordSnapshot,
		remote: &RecordSnapshot,
	) -> Vec<(String, ConflictKind)> {
		let empty = Map::new();
		let l = local.fields().unwrap_or(&empty);
		let r = remote.fields().unwrap_or(&empty);
		let names: BTreeSet<&String> = l.keys().chain(r.keys()).collect();

		names
			.into_iter()
			.filter_map(|name| {
				let kind = match (l.get(name), r.get(name)) {
					(Some(a), Some(b)) if a == b => return None,
					(Some(_), None) => ConflictKind::LocalOnly,
					(None, Some(_)) => ConflictKind::RemoteOnly,
					(None, None) => return None,
					(Some(_), Some(_)) if config.is_semantic(name) => ConflictKind::SemanticConflict,
					(Some(a), Some(b)) if json_type(a) != json_type(b) => ConflictKind::TypeMismatch,
					_ => ConflictKind::ValueDifference,
				};
				Some((name.clone(), kind))
			})
			.collect()
	}

	/// Resolve two divergent snapshots of the same record.
	pub fn resolve(
		&self,
		config: &SyncEntityConfig,
		local: &RecordSnapshot,
		remote: &RecordSnapshot,
	) -> Resolution {
		let recency = Recency::of(local.updated_at, remote.updated_at);
		let detected = self.detect(config, local, remote);

		let (strategy, fields, props, tombstone) = match config.conflict_strategy {
			ConflictStrategy::IntelligentMerge if !local.tombstone && !remote.tombstone => {
				let (fields, props) = self.intelligent(config, recency, local, remote, &detected);
				(ConflictStrategy::IntelligentMerge, fields, props, false)
			}
			// Deletion against an edit is never merged field by field.
			ConflictStrategy::IntelligentMerge => {
				self.wholesale(config.fallback_strategy, recency, local, remote, &detected)
			}
			ConflictStrategy::TimestampWins if local.updated_at.is_none() || remote.updated_at.is_none() => {
				let fallback = match config.fallback_strategy {
					ConflictStrategy::TimestampWins => ConflictStrategy::ServerWins,
					other => other,
				};
				debug!("{}/{} missing timestamps, falling back to {}", local.entity, local.id, fallback.name());
				self.wholesale(fallback, recency, local, remote, &detected)
			}
			ConflictStrategy::FieldLevelDetection => {
				let (_, fields, props, tombstone) =
					self.wholesale(ConflictStrategy::ServerWins, recency, local, remote, &detected);
				(ConflictStrategy::FieldLevelDetection, fields, props, tombstone)
			}
			strategy => self.wholesale(strategy, recency, local, remote, &detected),
		};

		let threshold = config.confidence_threshold.unwrap_or(self.confidence_threshold);
		let flag_all = config.conflict_strategy == ConflictStrategy::FieldLevelDetection;
		let review: Vec<String> = fields
			.iter()
			.filter(|f| flag_all || f.confidence < threshold)
			.map(|f| f.field.clone())
			.collect();
		let overridden: Vec<String> = fields
			.iter()
			.filter(|f| {
				f.outcome != Outcome::Merged
					&& !matches!(f.kind, ConflictKind::LocalOnly | ConflictKind::RemoteOnly)
			})
			.map(|f| f.field.clone())
			.collect();
		let confidence = fields.iter().map(|f| f.confidence).fold(1.0, f64::min);

		let record = self.build_record(local, remote, props, tombstone);
		info!(
			"Resolved conflict on {}/{} with {} ({} fields, {} for review)",
			local.entity,
			local.id,
			strategy.name(),
			fields.len(),
			review.len()
		);

		Resolution {
			record,
			strategy,
			fields,
			overridden,
			review,
			confidence,
		}
	}

	/// One side wins every field.
	fn wholesale(
		&self,
		strategy: ConflictStrategy,
		recency: Recency,
		local: &RecordSnapshot,
		remote: &RecordSnapshot,
		detected: &[(String, ConflictKind)],
	) -> (ConflictStrategy, Vec<FieldConflict>, Value, bool) {
		let (local_wins, confidence) = match strategy {
			ConflictStrategy::LocalWins => (true, WHOLESALE_CONFIDENCE),
			ConflictStrategy::TimestampWins => match recency {
				Recency::LocalNewer => (true, TIMESTAMP_CONFIDENCE),
				Recency::RemoteNewer => (false, TIMESTAMP_CONFIDENCE),
				Recency::Tie => (false, TIE_CONFIDENCE),
			},
			_ => (false, WHOLESALE_CONFIDENCE),
		};
		let outcome = if local_wins { Outcome::Local } else { Outcome::Remote };

		let fields = detected
			.iter()
			.map(|(name, kind)| {
				let confidence = if *kind == ConflictKind::SemanticConflict {
					SEMANTIC_CONFIDENCE
				} else {
					confidence
				};
				field_conflict(local, remote, name, *kind, confidence, outcome, None)
			})
			.collect();

		let winner = if local_wins { local } else { remote };
		(strategy, fields, winner.props.clone(), winner.tombstone)
	}

	fn intelligent(
		&self,
		config: &SyncEntityConfig,
		recency: Recency,
		local: &RecordSnapshot,
		remote: &RecordSnapshot,
		detected: &[(String, ConflictKind)],
	) -> (Vec<FieldConflict>, Value) {
		let ctx = MergeContext { config, recency };
		let mut out = remote.fields().cloned().unwrap_or_default();
		let mut fields = Vec::with_capacity(detected.len());

		for (name, kind) in detected {
			let lv = local.field(name);
			let rv = remote.field(name);
			let merged = match (*kind, lv, rv) {
				(ConflictKind::LocalOnly, Some(v), _) => FieldMerge {
					value: v.clone(),
					confidence: 1.0,
					outcome: Outcome::Local,
				},
				(ConflictKind::RemoteOnly, _, Some(v)) => FieldMerge {
					value: v.clone(),
					confidence: 1.0,
					outcome: Outcome::Remote,
				},
				(ConflictKind::SemanticConflict, Some(l), Some(r)) => ctx.fallback(l, r, SEMANTIC_CONFIDENCE),
				(_, Some(l), Some(r)) => ctx.merge(name, l, r),
				_ => continue,
			};
			out.insert(name.clone(), merged.value.clone());
			fields.push(field_conflict(
				local,
				remote,
				name,
				*kind,
				merged.confidence,
				merged.outcome,
				Some(merged.value),
			));
		}

		(fields, Value::Object(out))
	}

	/// Version and timestamp for the resolved record. A result identical to
	/// the remote keeps the remote version so nothing needs to be pushed.
	fn build_record(
		&self,
		local: &RecordSnapshot,
		remote: &RecordSnapshot,
		props: Value,
		tombstone: bool,
	) -> RecordSnapshot {
		let same_as_remote = props == remote.props && tombstone == remote.tombstone;
		let version = if same_as_remote {
			remote.version
		} else {
			local.version.max(remote.version) + 1
		};
		let updated_at = if same_as_remote {
			remote.updated_at
		} else {
			local.updated_at.max(remote.updated_at)
		};
		RecordSnapshot {
			entity: remote.entity.clone(),
			id: remote.id.clone(),
			version,
			updated_at,
			props,
			tombstone,
		}
	}
}

fn field_conflict(
	local: &RecordSnapshot,
	remote: &RecordSnapshot,
	name: &str,
	kind: ConflictKind,
	confidence: f64,
	outcome: Outcome,
	merged: Option<Value>,
) -> FieldConflict {
	let lv = local.field(name).cloned();
	let rv = remote.field(name).cloned();
	let mut candidates: Vec<Value> = lv.iter().chain(rv.iter()).cloned().collect();
	if let Some(m) = merged {
		if !candidates.contains(&m) {
			candidates.push(m);
		}
	}
	FieldConflict {
		field: name.to_string(),
		kind,
		local: lv,
		remote: rv,
		candidates,
		confidence,
		outcome,
	}
}

fn json_type(v: &Value) -> &'static str {
	match v {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

/// Per-strategy counters kept alongside the history ring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
	pub resolved: u64,
	pub fields: u64,
	pub flagged_for_review: u64,
	pub confidence_sum: f64,
}

impl StrategyStats {
	pub fn mean_confidence(&self) -> f64 {
		if self.resolved == 0 {
			0.0
		} else {
			self.confidence_sum / self.resolved as f64
		}
	}
}

/// Bounded ring of resolved conflicts. Entries are copies; nothing in here
/// points back into live record state.
pub struct ConflictHistory {
	capacity: usize,
	inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
	entries: VecDeque<SyncConflict>,
	stats: HashMap<ConflictStrategy, StrategyStats>,
}

impl ConflictHistory {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			inner: Mutex::new(HistoryInner::default()),
		}
	}

	/// Record a conflict. Entities that are not audit sensitive keep only
	/// the summary.
	pub fn record(&self, conflict: SyncConflict, audit_sensitive: bool, confidence: f64) {
		let conflict = if audit_sensitive { conflict } else { conflict.summarized() };
		let mut inner = self.inner.lock();

		let stats = inner.stats.entry(conflict.strategy).or_default();
		stats.resolved += 1;
		stats.fields += conflict.fields.len() as u64;
		stats.flagged_for_review += conflict.review.len() as u64;
		stats.confidence_sum += confidence;

		if self.capacity == 0 {
			return;
		}
		while inner.entries.len() >= self.capacity {
			inner.entries.pop_front();
		}
		inner.entries.push_back(conflict);
	}

	/// Oldest first.
	pub fn entries(&self) -> Vec<SyncConflict> {
		self.inner.lock().entries.iter().cloned().collect()
	}

	pub fn for_record(&self, entity: &str, record_id: &str) -> Vec<SyncConflict> {
		self.inner
			.lock()
			.entries
			.iter()
			.filter(|c| c.entity == entity && c.record_id == record_id)
			.cloned()
			.collect()
	}

	pub fn stats(&self) -> HashMap<ConflictStrategy, StrategyStats> {
		self.inner.lock().stats.clone()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

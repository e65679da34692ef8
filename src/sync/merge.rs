//! Per-field merge rules used by the IntelligentMerge strategy.
//!
//! Every function here is pure: two values in, one value plus a confidence
//! out. Ties are always broken toward the remote value so that clients
//! resolving independently converge on the same result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

use crate::model::{ConflictStrategy, FieldKind, NumericMerge, SyncEntityConfig, TextMerge};

/// Nested objects deeper than this are resolved by the fallback strategy.
const MAX_MERGE_DEPTH: usize = 16;

/// Which snapshot carries the newer `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recency {
	LocalNewer,
	RemoteNewer,
	/// Equal timestamps, or at least one side has none.
	Tie,
}

impl Recency {
	pub fn of(local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> Self {
		match (local, remote) {
			(Some(l), Some(r)) => match l.cmp(&r) {
				Ordering::Greater => Recency::LocalNewer,
				Ordering::Less => Recency::RemoteNewer,
				Ordering::Equal => Recency::Tie,
			},
			_ => Recency::Tie,
		}
	}
}

/// Where a resolved field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
	Local,
	Remote,
	/// Combined from both sides.
	Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMerge {
	pub value: Value,
	pub confidence: f64,
	pub outcome: Outcome,
}

impl FieldMerge {
	fn local(value: &Value, confidence: f64) -> Self {
		Self {
			value: value.clone(),
			confidence,
			outcome: Outcome::Local,
		}
	}

	fn remote(value: &Value, confidence: f64) -> Self {
		Self {
			value: value.clone(),
			confidence,
			outcome: Outcome::Remote,
		}
	}

	/// Label a combined value, collapsing to a side when it equals one.
	fn combined(value: Value, local: &Value, remote: &Value, confidence: f64) -> Self {
		let outcome = if &value == remote {
			Outcome::Remote
		} else if &value == local {
			Outcome::Local
		} else {
			Outcome::Merged
		};
		Self {
			value,
			confidence,
			outcome,
		}
	}
}

/// Context shared by every field of one record merge.
pub struct MergeContext<'a> {
	pub config: &'a SyncEntityConfig,
	pub recency: Recency,
}

impl MergeContext<'_> {
	/// Pick a side using the entity's fallback strategy.
	pub fn fallback(&self, local: &Value, remote: &Value, confidence: f64) -> FieldMerge {
		match self.config.fallback_strategy {
			ConflictStrategy::LocalWins => FieldMerge::local(local, confidence),
			ConflictStrategy::TimestampWins if self.recency == Recency::LocalNewer => {
				FieldMerge::local(local, confidence)
			}
			_ => FieldMerge::remote(remote, confidence),
		}
	}

	/// Merge two differing values of the field at `path` (dotted for nested
	/// objects).
	pub fn merge(&self, path: &str, local: &Value, remote: &Value) -> FieldMerge {
		self.merge_at(path, local, remote, 0)
	}

	fn merge_at(&self, path: &str, local: &Value, remote: &Value, depth: usize) -> FieldMerge {
		if local == remote {
			return FieldMerge::remote(remote, 1.0);
		}

		match (local, remote) {
			(Value::Null, v) => return FieldMerge::remote(v, 0.7),
			(v, Value::Null) => return FieldMerge::local(v, 0.7),
			_ => {}
		}

		let rule = self.config.field_rule(path);
		let kind = match rule.and_then(|r| r.kind) {
			Some(k) => k,
			None => match infer_kind(path, local, remote) {
				Some(k) => k,
				None => return self.fallback(local, remote, 0.3),
			},
		};
		let important = rule.is_some_and(|r| r.important);

		match kind {
			FieldKind::Array => match (local, remote) {
				(Value::Array(l), Value::Array(r)) => {
					FieldMerge::combined(Value::Array(union(r, l)), local, remote, 0.95)
				}
				_ => self.fallback(local, remote, 0.3),
			},
			FieldKind::Number(mode) => self.merge_number(path, mode, local, remote, rule.is_some()),
			FieldKind::Text(mode) => self.merge_text(mode, local, remote),
			FieldKind::Boolean => match (local.as_bool(), remote.as_bool()) {
				(Some(l), Some(r)) => {
					let v = if important { l || r } else { l && r };
					FieldMerge::combined(Value::Bool(v), local, remote, 0.8)
				}
				_ => self.fallback(local, remote, 0.3),
			},
			FieldKind::Timestamp => merge_timestamp(local, remote)
				.unwrap_or_else(|| self.fallback(local, remote, 0.3)),
			FieldKind::Object => match (local, remote) {
				(Value::Object(l), Value::Object(r)) if depth < MAX_MERGE_DEPTH => {
					self.merge_object(path, l, r, depth)
				}
				_ => self.fallback(local, remote, 0.3),
			},
		}
	}

	fn merge_number(
		&self,
		path: &str,
		declared: NumericMerge,
		local: &Value,
		remote: &Value,
		is_declared: bool,
	) -> FieldMerge {
		let (Some(l), Some(r)) = (local.as_f64(), remote.as_f64()) else {
			return self.fallback(local, remote, 0.3);
		};
		let mode = if is_declared {
			declared
		} else {
			numeric_hint(path).unwrap_or(declared)
		};
		let integral = local.is_i64() && remote.is_i64() || local.is_u64() && remote.is_u64();

		let (value, confidence) = match mode {
			NumericMerge::Max => (if l >= r { local.clone() } else { remote.clone() }, 0.85),
			NumericMerge::Min => (if l <= r { local.clone() } else { remote.clone() }, 0.85),
			NumericMerge::Sum => (number(l + r, integral), 0.75),
			NumericMerge::Average => {
				let avg = (l + r) / 2.0;
				(number(avg, integral && avg.fract() == 0.0), 0.7)
			}
		};
		// Unhinted numbers fall back to max with less certainty.
		let confidence = if is_declared || numeric_hint(path).is_some() {
			confidence
		} else {
			0.6
		};
		FieldMerge::combined(value, local, remote, confidence)
	}

	fn merge_text(&self, mode: TextMerge, local: &Value, remote: &Value) -> FieldMerge {
		let (Some(l), Some(r)) = (local.as_str(), remote.as_str()) else {
			return self.fallback(local, remote, 0.3);
		};
		match mode {
			TextMerge::Newer => match self.recency {
				Recency::LocalNewer => FieldMerge::local(local, 0.75),
				Recency::RemoteNewer => FieldMerge::remote(remote, 0.75),
				Recency::Tie => FieldMerge::remote(remote, 0.5),
			},
			TextMerge::Longer => {
				if l.chars().count() > r.chars().count() {
					FieldMerge::local(local, 0.65)
				} else {
					FieldMerge::remote(remote, 0.65)
				}
			}
			TextMerge::Concatenate => {
				if l.contains(r) {
					FieldMerge::local(local, 0.6)
				} else if r.contains(l) {
					FieldMerge::remote(remote, 0.6)
				} else {
					FieldMerge::combined(Value::String(format!("{}\n{}", r, l)), local, remote, 0.6)
				}
			}
		}
	}

	fn merge_object(
		&self,
		path: &str,
		local: &Map<String, Value>,
		remote: &Map<String, Value>,
		depth: usize,
	) -> FieldMerge {
		let mut out = remote.clone();
		let mut confidence: f64 = 1.0;

		for (key, lv) in local {
			match remote.get(key) {
				None => {
					out.insert(key.clone(), lv.clone());
				}
				Some(rv) if rv == lv => {}
				Some(rv) => {
					let child = format!("{}.{}", path, key);
					let merged = self.merge_at(&child, lv, rv, depth + 1);
					confidence = confidence.min(merged.confidence);
					out.insert(key.clone(), merged.value);
				}
			}
		}

		FieldMerge::combined(
			Value::Object(out),
			&Value::Object(local.clone()),
			&Value::Object(remote.clone()),
			confidence,
		)
	}
}

/// Merge kind implied by the values (and, for numbers, the field name).
fn infer_kind(path: &str, local: &Value, remote: &Value) -> Option<FieldKind> {
	match (local, remote) {
		(Value::Array(_), Value::Array(_)) => Some(FieldKind::Array),
		(Value::Number(_), Value::Number(_)) => Some(FieldKind::Number(
			numeric_hint(path).unwrap_or(NumericMerge::Max),
		)),
		(Value::String(l), Value::String(r)) => {
			if parse_ts(l).is_some() && parse_ts(r).is_some() {
				Some(FieldKind::Timestamp)
			} else {
				Some(FieldKind::Text(TextMerge::Newer))
			}
		}
		(Value::Bool(_), Value::Bool(_)) => Some(FieldKind::Boolean),
		(Value::Object(_), Value::Object(_)) => Some(FieldKind::Object),
		_ => None,
	}
}

/// Contextual numeric rule from the field name.
fn numeric_hint(path: &str) -> Option<NumericMerge> {
	let name = path.rsplit('.').next().unwrap_or(path).to_ascii_lowercase();
	const MAX_HINTS: [&str; 5] = ["count", "total", "quantity", "qty", "version"];
	const AVG_HINTS: [&str; 4] = ["rating", "score", "average", "avg"];
	if MAX_HINTS.iter().any(|h| name.contains(h)) {
		Some(NumericMerge::Max)
	} else if AVG_HINTS.iter().any(|h| name.contains(h)) {
		Some(NumericMerge::Average)
	} else {
		None
	}
}

fn number(v: f64, integral: bool) -> Value {
	if integral && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
		Value::from(v as i64)
	} else {
		Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
	}
}

/// Remote items first, then local items the remote lacks.
fn union(remote: &[Value], local: &[Value]) -> Vec<Value> {
	let mut out: Vec<Value> = Vec::with_capacity(remote.len() + local.len());
	for v in remote.iter().chain(local) {
		if !out.contains(v) {
			out.push(v.clone());
		}
	}
	out
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

fn merge_timestamp(local: &Value, remote: &Value) -> Option<FieldMerge> {
	let ordering = match (local, remote) {
		(Value::String(l), Value::String(r)) => parse_ts(l)?.cmp(&parse_ts(r)?),
		(Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?)?,
		_ => return None,
	};
	Some(match ordering {
		Ordering::Greater => FieldMerge::local(local, 0.9),
		Ordering::Less => FieldMerge::remote(remote, 0.9),
		Ordering::Equal => FieldMerge::remote(remote, 0.9),
	})
}

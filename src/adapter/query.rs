use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::model::RecordSnapshot;

/// Pseudo-field addressing the record id.
pub const FIELD_ID: &str = "_id";
/// Pseudo-field addressing the record version.
pub const FIELD_VERSION: &str = "_version";
/// Pseudo-field addressing the record modification time (RFC 3339).
pub const FIELD_UPDATED_AT: &str = "_updated_at";
/// Pseudo-field addressing the deletion marker.
pub const FIELD_TOMBSTONE: &str = "_tombstone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
	Eq,
	Ne,
	Gt,
	Gte,
	Lt,
	Lte,
	/// Field value is one of the elements of an array operand.
	In,
	/// Array field contains the operand, or string field contains the substring.
	Contains,
	/// Field presence equals the boolean operand.
	Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
	/// Top-level field, dotted path into nested objects, or a `_` pseudo-field.
	pub field: String,
	pub op: Operator,
	pub value: Value,
}

impl Condition {
	pub fn matches(&self, record: &RecordSnapshot) -> bool {
		let actual = field_value(record, &self.field);
		match self.op {
			Operator::Eq => actual.as_ref() == Some(&self.value),
			Operator::Ne => actual.as_ref() != Some(&self.value),
			Operator::Gt => cmp(actual.as_ref(), &self.value) == Some(Ordering::Greater),
			Operator::Gte => matches!(
				cmp(actual.as_ref(), &self.value),
				Some(Ordering::Greater | Ordering::Equal)
			),
			Operator::Lt => cmp(actual.as_ref(), &self.value) == Some(Ordering::Less),
			Operator::Lte => matches!(
				cmp(actual.as_ref(), &self.value),
				Some(Ordering::Less | Ordering::Equal)
			),
			Operator::In => match (&self.value, actual) {
				(Value::Array(options), Some(v)) => options.contains(&v),
				_ => false,
			},
			Operator::Contains => match actual {
				Some(Value::Array(items)) => items.contains(&self.value),
				Some(Value::String(s)) => self.value.as_str().is_some_and(|needle| s.contains(needle)),
				_ => false,
			},
			Operator::Exists => actual.is_some() == self.value.as_bool().unwrap_or(true),
		}
	}
}

/// Conjunction of conditions. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
	#[serde(default)]
	pub conditions: Vec<Condition>,
}

impl Filter {
	pub fn all() -> Self {
		Self::default()
	}

	pub fn with(mut self, field: impl Into<String>, op: Operator, value: Value) -> Self {
		self.conditions.push(Condition {
			field: field.into(),
			op,
			value,
		});
		self
	}

	pub fn eq(self, field: impl Into<String>, value: Value) -> Self {
		self.with(field, Operator::Eq, value)
	}

	/// Records whose id is one of `ids`.
	pub fn ids<I, S>(ids: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let ids: Vec<Value> = ids.into_iter().map(|s| Value::String(s.into())).collect();
		Self::default().with(FIELD_ID, Operator::In, Value::Array(ids))
	}

	/// Records modified at or after `since`.
	pub fn updated_since(self, since: DateTime<Utc>) -> Self {
		self.with(
			FIELD_UPDATED_AT,
			Operator::Gte,
			Value::String(since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)),
		)
	}

	/// Records that do not carry `field`.
	pub fn missing(self, field: impl Into<String>) -> Self {
		self.with(field, Operator::Exists, Value::Bool(false))
	}

	pub fn matches(&self, record: &RecordSnapshot) -> bool {
		self.conditions.iter().all(|c| c.matches(record))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
	Asc,
	Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
	pub field: String,
	pub direction: SortDirection,
}

/// `query(filter, sort, limit, offset)` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
	#[serde(default)]
	pub filter: Filter,
	#[serde(default)]
	pub sort: Option<Sort>,
	#[serde(default)]
	pub limit: Option<usize>,
	#[serde(default)]
	pub offset: usize,
}

impl Query {
	pub fn new(filter: Filter) -> Self {
		Self {
			filter,
			..Self::default()
		}
	}

	pub fn sorted_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
		self.sort = Some(Sort {
			field: field.into(),
			direction,
		});
		self
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn offset(mut self, offset: usize) -> Self {
		self.offset = offset;
		self
	}

	/// Evaluate the query over an in-memory record set.
	pub fn apply<I>(&self, records: I) -> Vec<RecordSnapshot>
	where
		I: IntoIterator<Item = RecordSnapshot>,
	{
		let mut out: Vec<RecordSnapshot> =
			records.into_iter().filter(|r| self.filter.matches(r)).collect();

		match &self.sort {
			Some(sort) => {
				out.sort_by(|a, b| {
					let av = field_value(a, &sort.field);
					let bv = field_value(b, &sort.field);
					let ord = match (av.as_ref(), bv.as_ref()) {
						(Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
						(Some(_), None) => Ordering::Greater,
						(None, Some(_)) => Ordering::Less,
						(None, None) => Ordering::Equal,
					};
					let ord = ord.then_with(|| a.id.cmp(&b.id));
					match sort.direction {
						SortDirection::Asc => ord,
						SortDirection::Desc => ord.reverse(),
					}
				});
			}
			None => out.sort_by(|a, b| a.id.cmp(&b.id)),
		}

		let iter = out.into_iter().skip(self.offset);
		match self.limit {
			Some(n) => iter.take(n).collect(),
			None => iter.collect(),
		}
	}
}

fn field_value(record: &RecordSnapshot, field: &str) -> Option<Value> {
	match field {
		FIELD_ID => Some(Value::String(record.id.clone())),
		FIELD_VERSION => Some(Value::from(record.version)),
		FIELD_UPDATED_AT => record
			.updated_at
			.map(|t| Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))),
		FIELD_TOMBSTONE => Some(Value::Bool(record.tombstone)),
		path => {
			let mut cursor = &record.props;
			for seg in path.split('.') {
				cursor = cursor.get(seg)?;
			}
			Some(cursor.clone())
		}
	}
}

fn cmp(actual: Option<&Value>, operand: &Value) -> Option<Ordering> {
	compare_values(actual?, operand)
}

/// Order two JSON scalars of the same type. Mixed types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		(Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use serde_json::json;

	fn rec(id: &str, props: Value, version: u64) -> RecordSnapshot {
		RecordSnapshot::new("notes", id, props, version)
	}

	#[test]
	fn test_filter_operators() {
		let r = rec("1", json!({"n": 5, "tags": ["a", "b"], "title": "hello world", "meta": {"k": "v"}}), 3);

		assert!(Filter::all().matches(&r));
		assert!(Filter::all().eq("n", json!(5)).matches(&r));
		assert!(Filter::all().with("n", Operator::Gt, json!(4)).matches(&r));
		assert!(!Filter::all().with("n", Operator::Lt, json!(5)).matches(&r));
		assert!(Filter::all().with("n", Operator::Lte, json!(5)).matches(&r));
		assert!(Filter::all().with("tags", Operator::Contains, json!("b")).matches(&r));
		assert!(Filter::all().with("title", Operator::Contains, json!("world")).matches(&r));
		assert!(Filter::all().eq("meta.k", json!("v")).matches(&r));
		assert!(Filter::all().with(FIELD_VERSION, Operator::Gte, json!(3)).matches(&r));
		assert!(Filter::ids(["1", "2"]).matches(&r));
		assert!(!Filter::ids(["2"]).matches(&r));
	}

	#[test]
	fn test_updated_since() {
		let t0 = Utc::now();
		let older = rec("1", json!({}), 1).with_updated_at(t0 - chrono::Duration::seconds(10));
		let newer = rec("2", json!({}), 1).with_updated_at(t0 + chrono::Duration::seconds(10));
		let tied = rec("4", json!({}), 1).with_updated_at(t0);
		let never = rec("3", json!({}), 1);

		let f = Filter::all().updated_since(t0);
		assert!(!f.matches(&older));
		assert!(f.matches(&newer));
		assert!(f.matches(&tied));
		assert!(!f.matches(&never));

		let undated = Filter::all().missing(FIELD_UPDATED_AT);
		assert!(undated.matches(&never));
		assert!(!undated.matches(&newer));
	}

	#[test]
	fn test_sort_limit_offset() {
		let records = vec![
			rec("a", json!({"n": 3}), 1),
			rec("b", json!({"n": 1}), 1),
			rec("c", json!({"n": 2}), 1),
		];
		let q = Query::new(Filter::all())
			.sorted_by("n", SortDirection::Desc)
			.offset(1)
			.limit(1);
		let out = q.apply(records);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].id, "c");
	}
}

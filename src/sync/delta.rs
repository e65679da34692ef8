use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::SyncError;

/// Old and new value of one changed path. `None` means absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
	pub old: Option<Value>,
	pub new: Option<Value>,
}

/// Minimal field-level difference between two record versions.
///
/// Keys are JSON pointers (`/title`, `/address/city`). `checksum` covers the
/// full post-patch record so the receiver can verify the reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPatch {
	pub changes: BTreeMap<String, FieldChange>,
	pub checksum: String,
}

impl DeltaPatch {
	pub fn is_empty(&self) -> bool {
		self.changes.is_empty()
	}

	pub fn len(&self) -> usize {
		self.changes.len()
	}

	/// Top-level field names touched by this patch.
	pub fn fields(&self) -> Vec<String> {
		let mut out: Vec<String> = self
			.changes
			.keys()
			.filter_map(|p| split_pointer(p).into_iter().next())
			.collect();
		out.sort();
		out.dedup();
		out
	}

	/// Serialized size of the change set.
	pub fn encoded_len(&self) -> usize {
		serde_json::to_vec(&self.changes).map(|v| v.len()).unwrap_or(usize::MAX)
	}

	/// Apply the patch to `base` and verify the result against the checksum.
	///
	/// A mismatch yields [`SyncError::Integrity`]; the caller must fall back
	/// to transmitting the full record.
	pub fn apply(&self, base: &Value) -> Result<Value, SyncError> {
		let mut out = base.clone();
		for (path, change) in &self.changes {
			let segments = split_pointer(path);
			match &change.new {
				Some(v) => set_at(&mut out, &segments, v.clone())?,
				None => remove_at(&mut out, &segments),
			}
		}

		let actual = checksum(&out);
		if actual != self.checksum {
			return Err(SyncError::Integrity(format!(
				"patch checksum mismatch: expected {}, got {}",
				self.checksum, actual
			)));
		}
		Ok(out)
	}
}

/// Structural differ for record snapshots.
#[derive(Debug, Clone)]
pub struct DeltaCalculator {
	/// Objects nested deeper than this are replaced wholesale.
	max_depth: usize,
	/// A patch is only worth sending when it is at most this fraction of
	/// the full record size.
	max_patch_ratio: f64,
}

impl Default for DeltaCalculator {
	fn default() -> Self {
		Self {
			max_depth: 8,
			max_patch_ratio: 0.8,
		}
	}
}

impl DeltaCalculator {
	pub fn new(max_depth: usize, max_patch_ratio: f64) -> Self {
		Self {
			max_depth,
			max_patch_ratio,
		}
	}

	/// Compute the patch turning `old` into `new`.
	pub fn diff(&self, old: &Value, new: &Value) -> DeltaPatch {
		let mut changes = BTreeMap::new();
		self.diff_into(String::new(), old, new, 0, &mut changes);
		DeltaPatch {
			changes,
			checksum: checksum(new),
		}
	}

	/// True when sending `patch` is cheaper than sending `full`.
	pub fn is_worthwhile(&self, patch: &DeltaPatch, full: &Value) -> bool {
		if patch.is_empty() {
			return false;
		}
		let full_len = serde_json::to_vec(full).map(|v| v.len()).unwrap_or(0);
		if full_len == 0 {
			return false;
		}
		(patch.encoded_len() as f64) <= (full_len as f64) * self.max_patch_ratio
	}

	fn diff_into(
		&self,
		prefix: String,
		old: &Value,
		new: &Value,
		depth: usize,
		out: &mut BTreeMap<String, FieldChange>,
	) {
		if old == new {
			return;
		}

		match (old, new) {
			(Value::Object(a), Value::Object(b)) if depth < self.max_depth => {
				for (key, old_v) in a {
					let path = format!("{}/{}", prefix, escape_segment(key));
					match b.get(key) {
						Some(new_v) => self.diff_into(path, old_v, new_v, depth + 1, out),
						None => {
							out.insert(
								path,
								FieldChange {
									old: Some(old_v.clone()),
									new: None,
								},
							);
						}
					}
				}
				for (key, new_v) in b {
					if !a.contains_key(key) {
						out.insert(
							format!("{}/{}", prefix, escape_segment(key)),
							FieldChange {
								old: None,
								new: Some(new_v.clone()),
							},
						);
					}
				}
			}
			_ => {
				out.insert(
					prefix,
					FieldChange {
						old: Some(old.clone()),
						new: Some(new.clone()),
					},
				);
			}
		}
	}
}

/// SHA-256 over the canonical (key-sorted) JSON encoding of `value`.
pub fn checksum(value: &Value) -> String {
	let canonical = canonicalize(value);
	let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
	let digest = Sha256::digest(&bytes);
	digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonicalize(value: &Value) -> Value {
	match value {
		Value::Object(map) => {
			let mut keys: Vec<&String> = map.keys().collect();
			keys.sort();
			let mut out = Map::new();
			for k in keys {
				out.insert(k.clone(), canonicalize(&map[k]));
			}
			Value::Object(out)
		}
		Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
		other => other.clone(),
	}
}

fn escape_segment(key: &str) -> String {
	key.replace('~', "~0").replace('/', "~1")
}

fn split_pointer(path: &str) -> Vec<String> {
	if path.is_empty() {
		return Vec::new();
	}
	path.trim_start_matches('/')
		.split('/')
		.map(|s| s.replace("~1", "/").replace("~0", "~"))
		.collect()
}

fn set_at(target: &mut Value, segments: &[String], value: Value) -> Result<(), SyncError> {
	let Some((last, parents)) = segments.split_last() else {
		*target = value;
		return Ok(());
	};

	let mut cursor = target;
	for seg in parents {
		if !cursor.is_object() {
			*cursor = Value::Object(Map::new());
		}
		let map = cursor
			.as_object_mut()
			.ok_or_else(|| SyncError::Integrity("patch path does not address an object".into()))?;
		cursor = map.entry(seg.clone()).or_insert_with(|| Value::Object(Map::new()));
	}

	if !cursor.is_object() {
		*cursor = Value::Object(Map::new());
	}
	let map = cursor
		.as_object_mut()
		.ok_or_else(|| SyncError::Integrity("patch path does not address an object".into()))?;
	map.insert(last.clone(), value);
	Ok(())
}

fn remove_at(target: &mut Value, segments: &[String]) {
	let Some((last, parents)) = segments.split_last() else {
		*target = Value::Null;
		return;
	};

	let mut cursor = target;
	for seg in parents {
		match cursor.get_mut(seg.as_str()) {
			Some(next) => cursor = next,
			None => return,
		}
	}
	if let Some(map) = cursor.as_object_mut() {
		map.remove(last);
	}
}

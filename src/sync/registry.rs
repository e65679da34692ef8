use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::model::{OperationKind, RecordKey, RecordSnapshot, SyncEntityConfig, SyncRecordState};

/// Registered entity configurations. Configurations are immutable once
/// registered and handed out as shared references.
#[derive(Default)]
pub struct EntityRegistry {
	entities: RwLock<HashMap<String, Arc<SyncEntityConfig>>>,
}

impl EntityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, config: SyncEntityConfig) -> Result<Arc<SyncEntityConfig>, SyncError> {
		config.validate()?;
		let mut entities = self.entities.write();
		if entities.contains_key(&config.name) {
			return Err(SyncError::AlreadyRegistered(config.name));
		}
		info!(
			"Registered entity '{}' ({}, {:?}, {})",
			config.name,
			config.conflict_strategy.name(),
			config.sync_direction,
			config.priority
		);
		let config = Arc::new(config);
		entities.insert(config.name.clone(), Arc::clone(&config));
		Ok(config)
	}

	pub fn get(&self, name: &str) -> Result<Arc<SyncEntityConfig>, SyncError> {
		self.entities
			.read()
			.get(name)
			.cloned()
			.ok_or_else(|| SyncError::UnknownEntity(name.to_string()))
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entities.read().contains_key(name)
	}

	/// Registered entities, highest priority first, then by name.
	pub fn all(&self) -> Vec<Arc<SyncEntityConfig>> {
		let mut all: Vec<Arc<SyncEntityConfig>> = self.entities.read().values().cloned().collect();
		all.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
		all
	}

	pub fn names(&self) -> Vec<String> {
		self.all().iter().map(|c| c.name.clone()).collect()
	}

	pub fn len(&self) -> usize {
		self.entities.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Local copy of one record plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntry {
	pub snapshot: RecordSnapshot,
	pub state: SyncRecordState,
}

/// Local record store and per-entity pull cursors.
///
/// Mutations of one record happen only while the orchestrator holds that
/// record's lock; the store itself only guarantees map-level consistency.
#[derive(Default)]
pub struct LocalStore {
	records: RwLock<HashMap<RecordKey, LocalEntry>>,
	cursors: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl LocalStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Apply a local mutation and return the new local snapshot.
	pub fn apply_local_change(
		&self,
		entity: &str,
		id: &str,
		kind: OperationKind,
		payload: Option<&Value>,
	) -> Result<RecordSnapshot, SyncError> {
		let key = RecordKey::new(entity, id);
		let mut records = self.records.write();

		let props = match (kind, payload) {
			(OperationKind::Delete, _) => None,
			(_, Some(p)) if p.is_object() => Some(p.clone()),
			(_, Some(_)) => {
				return Err(SyncError::Validation(format!(
					"payload for {} must be a JSON object",
					key
				)));
			}
			(_, None) => {
				return Err(SyncError::Validation(format!("missing payload for {}", key)));
			}
		};

		let entry = records.entry(key.clone()).or_insert_with(|| LocalEntry {
			snapshot: RecordSnapshot::new(entity, id, Value::Object(Default::default()), 0),
			state: SyncRecordState::new(),
		});

		let version = entry.state.record_local_change();
		entry.snapshot.version = version;
		entry.snapshot.updated_at = Some(Utc::now());
		match props {
			Some(p) => {
				entry.snapshot.props = p;
				entry.snapshot.tombstone = false;
			}
			None => entry.snapshot.tombstone = true,
		}
		Ok(entry.snapshot.clone())
	}

	pub fn get(&self, key: &RecordKey) -> Option<LocalEntry> {
		self.records.read().get(key).cloned()
	}

	pub fn snapshot(&self, entity: &str, id: &str) -> Option<RecordSnapshot> {
		self.get(&RecordKey::new(entity, id)).map(|e| e.snapshot)
	}

	pub fn state(&self, entity: &str, id: &str) -> Option<SyncRecordState> {
		self.get(&RecordKey::new(entity, id)).map(|e| e.state)
	}

	/// Both sides now hold `snapshot`.
	pub fn commit_synced(&self, snapshot: RecordSnapshot) {
		let mut records = self.records.write();
		let entry = records.entry(snapshot.key()).or_insert_with(|| LocalEntry {
			snapshot: snapshot.clone(),
			state: SyncRecordState::new(),
		});
		entry.state.mark_synced(snapshot.version, Utc::now());
		entry.snapshot = snapshot;
	}

	/// Load a record that is known to match the remote.
	pub fn seed(&self, snapshot: RecordSnapshot) {
		self.commit_synced(snapshot);
	}

	pub fn keys_for(&self, entity: &str) -> Vec<RecordKey> {
		let mut keys: Vec<RecordKey> = self
			.records
			.read()
			.keys()
			.filter(|k| k.entity == entity)
			.cloned()
			.collect();
		keys.sort();
		keys
	}

	pub fn dirty_keys(&self, entity: &str) -> Vec<RecordKey> {
		let mut keys: Vec<RecordKey> = self
			.records
			.read()
			.iter()
			.filter(|(k, e)| k.entity == entity && e.state.is_dirty())
			.map(|(k, _)| k.clone())
			.collect();
		keys.sort();
		keys
	}

	pub fn len(&self) -> usize {
		self.records.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn cursor(&self, entity: &str) -> Option<DateTime<Utc>> {
		self.cursors.read().get(entity).copied()
	}

	/// Move the pull cursor forward; it never moves back.
	pub fn advance_cursor(&self, entity: &str, to: DateTime<Utc>) {
		let mut cursors = self.cursors.write();
		let slot = cursors.entry(entity.to_string()).or_insert(to);
		if to > *slot {
			*slot = to;
		}
	}
}

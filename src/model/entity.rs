use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::operation::Priority;
use crate::error::SyncError;

/// Conflict resolution strategy applied when local and remote diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
	/// Local snapshot wins wholesale.
	LocalWins,
	/// Remote snapshot wins wholesale.
	ServerWins,
	/// The snapshot with the newer `updated_at` wins; ties go to the remote.
	TimestampWins,
	/// Every conflicting field is flagged; remote values are applied.
	FieldLevelDetection,
	/// Per-field merge driven by the declared (or inferred) field type.
	IntelligentMerge,
}

impl ConflictStrategy {
	/// Strategies that always produce a decision and can serve as fallback.
	pub fn is_decisive(self) -> bool {
		matches!(
			self,
			ConflictStrategy::LocalWins | ConflictStrategy::ServerWins | ConflictStrategy::TimestampWins
		)
	}

	pub fn name(self) -> &'static str {
		match self {
			ConflictStrategy::LocalWins => "local_wins",
			ConflictStrategy::ServerWins => "server_wins",
			ConflictStrategy::TimestampWins => "timestamp_wins",
			ConflictStrategy::FieldLevelDetection => "field_level_detection",
			ConflictStrategy::IntelligentMerge => "intelligent_merge",
		}
	}
}

impl Default for ConflictStrategy {
	fn default() -> Self {
		ConflictStrategy::TimestampWins
	}
}

/// Which way data flows for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
	Bidirectional,
	UploadOnly,
	DownloadOnly,
}

impl SyncDirection {
	pub fn uploads(self) -> bool {
		!matches!(self, SyncDirection::DownloadOnly)
	}

	pub fn downloads(self) -> bool {
		!matches!(self, SyncDirection::UploadOnly)
	}
}

impl Default for SyncDirection {
	fn default() -> Self {
		SyncDirection::Bidirectional
	}
}

/// How two numeric values are combined by IntelligentMerge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericMerge {
	Max,
	Min,
	Average,
	Sum,
}

/// How two text values are combined by IntelligentMerge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMerge {
	Longer,
	Newer,
	Concatenate,
}

/// Declared type of a field, steering IntelligentMerge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "mode", rename_all = "snake_case")]
pub enum FieldKind {
	Array,
	Number(NumericMerge),
	Text(TextMerge),
	Boolean,
	Timestamp,
	Object,
}

/// Per-field merge rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
	/// Declared type. When absent the type is inferred from the values.
	#[serde(default)]
	pub kind: Option<FieldKind>,
	/// Important boolean flags merge with OR; others with AND.
	#[serde(default)]
	pub important: bool,
	/// Business-rule-flagged field: divergence is a semantic conflict.
	#[serde(default)]
	pub semantic: bool,
}

impl FieldRule {
	pub fn of(kind: FieldKind) -> Self {
		Self {
			kind: Some(kind),
			important: false,
			semantic: false,
		}
	}

	pub fn semantic() -> Self {
		Self {
			kind: None,
			important: false,
			semantic: true,
		}
	}

	pub fn important(mut self) -> Self {
		self.important = true;
		self
	}
}

/// Registration record of one syncable collection. Immutable once
/// registered with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntityConfig {
	pub name: String,
	#[serde(default)]
	pub conflict_strategy: ConflictStrategy,
	/// Used for fields the primary strategy cannot decide.
	#[serde(default = "default_fallback")]
	pub fallback_strategy: ConflictStrategy,
	#[serde(default)]
	pub priority: Priority,
	#[serde(default)]
	pub requires_authentication: bool,
	#[serde(default)]
	pub sync_direction: SyncDirection,
	#[serde(default)]
	pub field_rules: BTreeMap<String, FieldRule>,
	/// Keep full conflict detail in history for audit.
	#[serde(default)]
	pub audit_sensitive: bool,
	/// Operations must reach the backend one at a time, in queue order.
	#[serde(default)]
	pub strict_ordering: bool,
	/// Overrides the engine-wide review threshold.
	#[serde(default)]
	pub confidence_threshold: Option<f64>,
}

fn default_fallback() -> ConflictStrategy {
	ConflictStrategy::ServerWins
}

impl SyncEntityConfig {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			conflict_strategy: ConflictStrategy::default(),
			fallback_strategy: default_fallback(),
			priority: Priority::default(),
			requires_authentication: false,
			sync_direction: SyncDirection::default(),
			field_rules: BTreeMap::new(),
			audit_sensitive: false,
			strict_ordering: false,
			confidence_threshold: None,
		}
	}

	pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
		self.conflict_strategy = strategy;
		self
	}

	pub fn with_fallback_strategy(mut self, strategy: ConflictStrategy) -> Self {
		self.fallback_strategy = strategy;
		self
	}

	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	pub fn requiring_authentication(mut self) -> Self {
		self.requires_authentication = true;
		self
	}

	pub fn with_direction(mut self, direction: SyncDirection) -> Self {
		self.sync_direction = direction;
		self
	}

	pub fn with_field_rule(mut self, field: impl Into<String>, rule: FieldRule) -> Self {
		self.field_rules.insert(field.into(), rule);
		self
	}

	/// Flag a field as governed by a business rule.
	pub fn with_semantic_field(mut self, field: impl Into<String>) -> Self {
		self.field_rules
			.entry(field.into())
			.and_modify(|r| r.semantic = true)
			.or_insert_with(FieldRule::semantic);
		self
	}

	pub fn audit_sensitive(mut self) -> Self {
		self.audit_sensitive = true;
		self
	}

	pub fn with_strict_ordering(mut self) -> Self {
		self.strict_ordering = true;
		self
	}

	pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
		self.confidence_threshold = Some(threshold);
		self
	}

	pub fn field_rule(&self, field: &str) -> Option<&FieldRule> {
		self.field_rules.get(field)
	}

	pub fn is_semantic(&self, field: &str) -> bool {
		self.field_rules.get(field).is_some_and(|r| r.semantic)
	}

	/// Reject configurations the engine cannot honor.
	pub fn validate(&self) -> Result<(), SyncError> {
		if self.name.trim().is_empty() {
			return Err(SyncError::Validation("entity name must not be empty".into()));
		}
		if !self.fallback_strategy.is_decisive() {
			return Err(SyncError::Validation(format!(
				"fallback strategy for '{}' must be local_wins, server_wins or timestamp_wins, got {}",
				self.name,
				self.fallback_strategy.name()
			)));
		}
		if let Some(t) = self.confidence_threshold {
			if !(0.0..=1.0).contains(&t) {
				return Err(SyncError::Validation(format!(
					"confidence threshold for '{}' must be within 0..=1, got {}",
					self.name, t
				)));
			}
		}
		Ok(())
	}
}

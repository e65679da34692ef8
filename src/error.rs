use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Broad classification of a [`SyncError`], used to decide retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Network,
	Timeout,
	RateLimited,
	Authentication,
	Authorization,
	Validation,
	Conflict,
	Integrity,
	Unsupported,
	Configuration,
	Cancelled,
	Internal,
}

impl ErrorKind {
	/// Retryable kinds go back to the queue with backoff.
	pub fn is_retryable(self) -> bool {
		matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited)
	}

	/// Kinds that hold the operation until a new auth context is supplied.
	pub fn requires_reauth(self) -> bool {
		matches!(self, ErrorKind::Authentication | ErrorKind::Authorization)
	}
}

/// Errors produced by the synchronization core and by backend adapters.
///
/// Adapters map their native failures into these variants; the orchestrator
/// only ever looks at [`SyncError::kind`] when deciding what to do next.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum SyncError {
	#[error("network error: {0}")]
	Network(String),

	#[error("operation timed out after {0:?}")]
	Timeout(Duration),

	#[error("rate limited by backend")]
	RateLimited { retry_after: Option<Duration> },

	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("not authorized: {0}")]
	Authorization(String),

	#[error("validation failed: {0}")]
	Validation(String),

	#[error("remote write conflict on {entity}/{record_id}")]
	Conflict { entity: String, record_id: String },

	#[error("integrity check failed: {0}")]
	Integrity(String),

	#[error("backend does not support {0}")]
	Unsupported(String),

	#[error("entity not registered: {0}")]
	UnknownEntity(String),

	#[error("entity already registered: {0}")]
	AlreadyRegistered(String),

	#[error("record not found: {entity}/{record_id}")]
	NotFound { entity: String, record_id: String },

	#[error("operation cancelled")]
	Cancelled,

	#[error("internal error: {0}")]
	Internal(String),
}

impl SyncError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			SyncError::Network(_) => ErrorKind::Network,
			SyncError::Timeout(_) => ErrorKind::Timeout,
			SyncError::RateLimited { .. } => ErrorKind::RateLimited,
			SyncError::Authentication(_) => ErrorKind::Authentication,
			SyncError::Authorization(_) => ErrorKind::Authorization,
			SyncError::Validation(_) | SyncError::NotFound { .. } => ErrorKind::Validation,
			SyncError::Conflict { .. } => ErrorKind::Conflict,
			SyncError::Integrity(_) => ErrorKind::Integrity,
			SyncError::Unsupported(_) => ErrorKind::Unsupported,
			SyncError::UnknownEntity(_) | SyncError::AlreadyRegistered(_) => {
				ErrorKind::Configuration
			}
			SyncError::Cancelled => ErrorKind::Cancelled,
			SyncError::Internal(_) => ErrorKind::Internal,
		}
	}

	pub fn is_retryable(&self) -> bool {
		self.kind().is_retryable()
	}

	/// Backoff the backend asked for, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			SyncError::RateLimited { retry_after } => *retry_after,
			_ => None,
		}
	}
}

impl From<serde_json::Error> for SyncError {
	fn from(e: serde_json::Error) -> Self {
		SyncError::Validation(format!("malformed record payload: {}", e))
	}
}

pub type SyncResultOf<T> = std::result::Result<T, SyncError>;

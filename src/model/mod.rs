//! Data model shared by the adapter contract and the sync core.

pub mod entity;
pub mod operation;
pub mod record;
pub mod result;
pub mod state;

pub use entity::{
	ConflictStrategy, FieldKind, FieldRule, NumericMerge, SyncDirection, SyncEntityConfig, TextMerge,
};
pub use operation::{OperationKind, OperationState, Priority, SyncOperation};
pub use record::{RecordKey, RecordSnapshot};
pub use result::SyncResult;
pub use state::SyncRecordState;

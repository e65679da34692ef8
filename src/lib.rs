//! Offline-first record synchronization.
//!
//! Local mutations are recorded in a [`sync::LocalStore`], queued as
//! [`model::SyncOperation`]s and reconciled with a remote backend through
//! the [`adapter::BackendAdapter`] contract by the
//! [`sync::SyncOrchestrator`].

pub mod adapter;
pub mod config;
pub mod error;
pub mod model;
pub mod observability;
pub mod simulate;
pub mod sync;

pub use error::{ErrorKind, SyncError, SyncResultOf};

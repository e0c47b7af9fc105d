//! Assignment Store Port
//!
//! Defines the interface for persisting the metric→host assignment table
//! across restarts.

use crate::domain::entities::PersistedAssignment;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed assignment snapshot: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

/// Durable storage for assignment snapshots.
///
/// `save` replaces the whole snapshot; a reader never observes a partially
/// written one. `load` returns an empty list when nothing was saved yet.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn load(&self) -> Result<Vec<PersistedAssignment>, StoreError>;

    async fn save(&self, rows: &[PersistedAssignment]) -> Result<(), StoreError>;
}

//! Snapshot, checkpoint and status store contracts (C2, C4, §4.5 status sink).

use async_trait::async_trait;

use crate::checkpoint::{ProjectionCheckpoint, ProjectionStatus};
use crate::errors::StoreError;
use crate::snapshot::{Snapshot, SnapshotStats};

/// Versioned snapshots of aggregate state, keyed by aggregate id (C2, §4.2).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Inserts a snapshot row. Multiple snapshots per aggregate may coexist;
    /// retention is the caller's concern (see `SnapshotStrategy`).
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// The most recent snapshot for `aggregate_id`, or `NotFound`.
    async fn latest(&self, aggregate_id: &str) -> Result<Snapshot, StoreError>;

    /// The most recent snapshot at or before `version`, or `NotFound`.
    async fn latest_at_or_before(&self, aggregate_id: &str, version: u64) -> Result<Snapshot, StoreError>;

    /// Deletes snapshots for `aggregate_id` strictly older than `version`.
    async fn delete_older_than(&self, aggregate_id: &str, version: u64) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<SnapshotStats, StoreError>;
}

/// Per-projection cursor into the global event position (C4, §4.4).
///
/// This trait covers the standalone, non-transactional path. The
/// transactional path (`save_in_tx`/`delete_in_tx`) that the projection
/// runtime actually uses on its hot path is exposed as inherent methods on
/// each backend, since it is enlisted in a transaction whose concrete type
/// is backend-specific.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError>;
    async fn load(&self, projection_name: &str) -> Result<ProjectionCheckpoint, StoreError>;
    async fn delete(&self, projection_name: &str) -> Result<(), StoreError>;
}

/// Optional sink for operator-visible projection status (§4.5). Never read
/// on the hot path.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn save(&self, status: ProjectionStatus) -> Result<(), StoreError>;
    async fn load(&self, projection_name: &str) -> Result<ProjectionStatus, StoreError>;
}

//! The per-projection transaction backend (§4.5, §9 "Shared vs. separate
//! stores").
//!
//! A projection's "one transaction" guarantee — handler write + checkpoint
//! advance commit together — has to be expressible whatever database the
//! projection's read-model lives in, so the runtime is generic over
//! `ProjectionBackend` rather than hard-wired to one `sqlx::Transaction`
//! type. `SqliteProjectionBackend` is the durable implementation; the
//! in-memory `MemoryProjectionBackend` gives the runtime's own tests (and
//! any embedder's fixture) a zero-I/O stand-in with the same call shape.

use async_trait::async_trait;
use eventstore_core::ProjectionCheckpoint;

use crate::error::ProjectionError;

/// Begins, commits and rolls back the transaction a projection's handler
/// runs in, and persists the checkpoint as part of it.
///
/// `Tx` is owned (no borrowed lifetime) so it can be threaded through an
/// `async fn` boundary in the runtime's apply loop without a self-borrow;
/// `sqlx::Pool::begin` already returns an owned `Transaction<'static, _>`,
/// and the in-memory backend's `MemTx` is a plain value.
#[async_trait]
pub trait ProjectionBackend: Send + Sync {
    type Tx: Send;

    async fn begin_tx(&self) -> Result<Self::Tx, ProjectionError>;
    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), ProjectionError>;
    async fn rollback_tx(&self, tx: Self::Tx) -> Result<(), ProjectionError>;

    /// Writes `checkpoint` as part of `tx` (§4.5 "write the new checkpoint
    /// ... into the same transaction").
    async fn save_checkpoint_in_tx(
        &self,
        tx: &mut Self::Tx,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), ProjectionError>;

    /// Deletes the checkpoint row as part of `tx`, used by `rebuild`'s reset
    /// step (§4.5 "Rebuild" step 2).
    async fn delete_checkpoint_in_tx(&self, tx: &mut Self::Tx, projection_name: &str) -> Result<(), ProjectionError>;

    /// Standalone (non-transactional) read used once at worker startup to
    /// find where to resume.
    async fn load_checkpoint(&self, projection_name: &str) -> Result<ProjectionCheckpoint, ProjectionError>;
}

mod memory;
mod sqlite;

pub use memory::MemoryProjectionBackend;
pub use sqlite::SqliteProjectionBackend;

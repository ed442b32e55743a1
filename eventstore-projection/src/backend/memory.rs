//! Zero-I/O `ProjectionBackend` over `eventstore-backend-memory`'s
//! `MemoryStore`. There is no real transaction to enlist in, so `MemTx`
//! defers the checkpoint write until `commit_tx` is called, matching
//! `SPEC_FULL.md`'s "lightweight `MemTx` guard" note — callers written
//! against a transactional backend can target either backend uniformly.

use async_trait::async_trait;
use eventstore_backend_memory::MemoryStore;
use eventstore_core::{CheckpointStore, ProjectionCheckpoint, ProjectionStatus, StatusStore, StoreError};

use super::ProjectionBackend;
use crate::error::ProjectionError;

enum CheckpointOp {
    Save(ProjectionCheckpoint),
    Delete(String),
}

/// Deferred checkpoint write, applied on `commit_tx` and discarded on
/// `rollback_tx`.
#[derive(Default)]
pub struct MemTx {
    op: Option<CheckpointOp>,
}

#[derive(Clone, Default)]
pub struct MemoryProjectionBackend {
    store: MemoryStore,
}

impl MemoryProjectionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl ProjectionBackend for MemoryProjectionBackend {
    type Tx = MemTx;

    async fn begin_tx(&self) -> Result<Self::Tx, ProjectionError> {
        Ok(MemTx::default())
    }

    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), ProjectionError> {
        match tx.op {
            Some(CheckpointOp::Save(checkpoint)) => self.store.save_checkpoint_in_tx(checkpoint),
            Some(CheckpointOp::Delete(name)) => self.store.delete_checkpoint_in_tx(&name),
            None => {}
        }
        Ok(())
    }

    async fn rollback_tx(&self, _tx: Self::Tx) -> Result<(), ProjectionError> {
        // Nothing was applied yet; dropping the deferred op is the rollback.
        Ok(())
    }

    async fn save_checkpoint_in_tx(
        &self,
        tx: &mut Self::Tx,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), ProjectionError> {
        tx.op = Some(CheckpointOp::Save(checkpoint.clone()));
        Ok(())
    }

    async fn delete_checkpoint_in_tx(&self, tx: &mut Self::Tx, projection_name: &str) -> Result<(), ProjectionError> {
        tx.op = Some(CheckpointOp::Delete(projection_name.to_string()));
        Ok(())
    }

    async fn load_checkpoint(&self, projection_name: &str) -> Result<ProjectionCheckpoint, ProjectionError> {
        Ok(CheckpointStore::load(&self.store, projection_name).await?)
    }
}

#[async_trait]
impl CheckpointStore for MemoryProjectionBackend {
    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        CheckpointStore::save(&self.store, checkpoint).await
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionCheckpoint, StoreError> {
        CheckpointStore::load(&self.store, projection_name).await
    }

    async fn delete(&self, projection_name: &str) -> Result<(), StoreError> {
        CheckpointStore::delete(&self.store, projection_name).await
    }
}

#[async_trait]
impl StatusStore for MemoryProjectionBackend {
    async fn save(&self, status: ProjectionStatus) -> Result<(), StoreError> {
        StatusStore::save(&self.store, status).await
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionStatus, StoreError> {
        StatusStore::load(&self.store, projection_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rollback_discards_the_deferred_checkpoint_write() {
        let backend = MemoryProjectionBackend::new();
        let mut tx = backend.begin_tx().await.unwrap();
        backend
            .save_checkpoint_in_tx(&mut tx, &ProjectionCheckpoint::initial("orders"))
            .await
            .unwrap();
        backend.rollback_tx(tx).await.unwrap();

        let loaded = backend.load_checkpoint("orders").await.unwrap();
        assert_eq!(loaded.position, 0);
    }

    #[tokio::test]
    async fn commit_applies_the_deferred_checkpoint_write() {
        let backend = MemoryProjectionBackend::new();
        let mut checkpoint = ProjectionCheckpoint::initial("orders");
        checkpoint.position = 7;
        checkpoint.last_event_id = "ev-7".into();

        let mut tx = backend.begin_tx().await.unwrap();
        backend.save_checkpoint_in_tx(&mut tx, &checkpoint).await.unwrap();
        backend.commit_tx(tx).await.unwrap();

        let loaded = backend.load_checkpoint("orders").await.unwrap();
        assert_eq!(loaded.position, 7);
        assert_eq!(loaded.last_event_id, "ev-7");
    }
}

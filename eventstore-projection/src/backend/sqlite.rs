//! Durable `ProjectionBackend` over a projection's own `sqlx::SqlitePool`.
//!
//! This pool is deliberately separate from `eventstore-backend-sqlite`'s:
//! a projection's database carries only its own checkpoint/status rows and
//! whatever read-model tables the embedder's migrations create (§9 "Shared
//! vs. separate stores" — here we model the common case where the
//! projection owns its database, independent of the event log's).
//! Embedders who want the single-database variant simply point both pools
//! at the same file.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use eventstore_core::{
    CheckpointStore, ProjectionCheckpoint, ProjectionProgress, ProjectionStatus, ProjectionStatusKind, StatusStore,
    StoreError,
};
use sqlx::{Row, SqlitePool};

use super::ProjectionBackend;
use crate::error::ProjectionError;

fn store_err(e: sqlx::Error) -> ProjectionError {
    ProjectionError::Store(StoreError::Internal(anyhow::anyhow!(e)))
}

fn status_kind_str(kind: ProjectionStatusKind) -> &'static str {
    match kind {
        ProjectionStatusKind::Ready => "ready",
        ProjectionStatusKind::Rebuilding => "rebuilding",
        ProjectionStatusKind::Failed => "failed",
        ProjectionStatusKind::Paused => "paused",
    }
}

fn parse_status_kind(s: &str) -> Result<ProjectionStatusKind, ProjectionError> {
    match s {
        "ready" => Ok(ProjectionStatusKind::Ready),
        "rebuilding" => Ok(ProjectionStatusKind::Rebuilding),
        "failed" => Ok(ProjectionStatusKind::Failed),
        "paused" => Ok(ProjectionStatusKind::Paused),
        other => Err(ProjectionError::Store(StoreError::Internal(anyhow::anyhow!(
            "unknown projection status '{other}'"
        )))),
    }
}

#[derive(Clone)]
pub struct SqliteProjectionBackend {
    pool: SqlitePool,
}

impl SqliteProjectionBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ProjectionBackend for SqliteProjectionBackend {
    type Tx = sqlx::Transaction<'static, sqlx::Sqlite>;

    async fn begin_tx(&self) -> Result<Self::Tx, ProjectionError> {
        self.pool.begin().await.map_err(store_err)
    }

    async fn commit_tx(&self, tx: Self::Tx) -> Result<(), ProjectionError> {
        tx.commit().await.map_err(store_err)
    }

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<(), ProjectionError> {
        tx.rollback().await.map_err(store_err)
    }

    async fn save_checkpoint_in_tx(
        &self,
        tx: &mut Self::Tx,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), ProjectionError> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (projection_name, position, last_event_id, updated_at_unix)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (projection_name) DO UPDATE SET
                position = excluded.position,
                last_event_id = excluded.last_event_id,
                updated_at_unix = excluded.updated_at_unix",
        )
        .bind(&checkpoint.projection_name)
        .bind(checkpoint.position as i64)
        .bind(&checkpoint.last_event_id)
        .bind(checkpoint.updated_at.timestamp())
        .execute(&mut **tx)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_checkpoint_in_tx(&self, tx: &mut Self::Tx, projection_name: &str) -> Result<(), ProjectionError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = ?")
            .bind(projection_name)
            .execute(&mut **tx)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn load_checkpoint(&self, projection_name: &str) -> Result<ProjectionCheckpoint, ProjectionError> {
        Ok(CheckpointStore::load(self, projection_name).await?)
    }
}

#[async_trait]
impl CheckpointStore for SqliteProjectionBackend {
    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO projection_checkpoints (projection_name, position, last_event_id, updated_at_unix)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (projection_name) DO UPDATE SET
                position = excluded.position,
                last_event_id = excluded.last_event_id,
                updated_at_unix = excluded.updated_at_unix",
        )
        .bind(&checkpoint.projection_name)
        .bind(checkpoint.position as i64)
        .bind(&checkpoint.last_event_id)
        .bind(checkpoint.updated_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionCheckpoint, StoreError> {
        let row = sqlx::query(
            "SELECT position, last_event_id, updated_at_unix FROM projection_checkpoints WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

        match row {
            Some(row) => {
                let updated_at_unix: i64 = row.try_get("updated_at_unix").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
                Ok(ProjectionCheckpoint {
                    projection_name: projection_name.to_string(),
                    position: row.try_get::<i64, _>("position").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))? as u64,
                    last_event_id: row.try_get("last_event_id").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?,
                    updated_at: Utc.timestamp_opt(updated_at_unix, 0).single().unwrap_or_else(Utc::now),
                })
            }
            None => Ok(ProjectionCheckpoint::initial(projection_name)),
        }
    }

    async fn delete(&self, projection_name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = ?")
            .bind(projection_name)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for SqliteProjectionBackend {
    async fn save(&self, status: ProjectionStatus) -> Result<(), StoreError> {
        let progress_json = status
            .progress
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

        sqlx::query(
            "INSERT INTO projection_status (projection_name, status, message, updated_at_unix, progress)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (projection_name) DO UPDATE SET
                status = excluded.status,
                message = excluded.message,
                updated_at_unix = excluded.updated_at_unix,
                progress = excluded.progress",
        )
        .bind(&status.projection_name)
        .bind(status_kind_str(status.status))
        .bind(&status.message)
        .bind(status.updated_at.timestamp())
        .bind(&progress_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionStatus, StoreError> {
        let row = sqlx::query(
            "SELECT status, message, updated_at_unix, progress FROM projection_status WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?
        .ok_or_else(|| StoreError::not_found(format!("no status for projection {projection_name}")))?;

        let status_str: String = row.try_get("status").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        let updated_at_unix: i64 = row.try_get("updated_at_unix").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        let progress_json: Option<String> = row.try_get("progress").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        let progress: Option<ProjectionProgress> = progress_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

        Ok(ProjectionStatus {
            projection_name: projection_name.to_string(),
            status: parse_status_kind(&status_str).map_err(|e| match e {
                ProjectionError::Store(se) => se,
                other => StoreError::Internal(anyhow::anyhow!(other.to_string())),
            })?,
            message: row.try_get("message").map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?,
            updated_at: Utc.timestamp_opt(updated_at_unix, 0).single().unwrap_or_else(Utc::now),
            progress,
        })
    }
}

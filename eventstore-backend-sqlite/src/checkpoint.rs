//! Checkpoint and status stores (C4, §4.4, §4.5).
//!
//! `save_in_tx`/`delete_in_tx` are inherent methods rather than part of
//! `CheckpointStore`: the projection runtime enlists them in the same
//! `sqlx::Transaction` as its handler's own writes, and that transaction
//! type is necessarily backend-specific.

use chrono::{TimeZone, Utc};
use eventstore_core::{
    CheckpointStore, ProjectionCheckpoint, ProjectionProgress, ProjectionStatus,
    ProjectionStatusKind, StatusStore, StoreError,
};
use sqlx::Row;

use crate::errors::map_db_error;
use crate::store::SqliteStore;

fn status_kind_str(kind: ProjectionStatusKind) -> &'static str {
    match kind {
        ProjectionStatusKind::Ready => "ready",
        ProjectionStatusKind::Rebuilding => "rebuilding",
        ProjectionStatusKind::Failed => "failed",
        ProjectionStatusKind::Paused => "paused",
    }
}

fn parse_status_kind(s: &str) -> Result<ProjectionStatusKind, StoreError> {
    match s {
        "ready" => Ok(ProjectionStatusKind::Ready),
        "rebuilding" => Ok(ProjectionStatusKind::Rebuilding),
        "failed" => Ok(ProjectionStatusKind::Failed),
        "paused" => Ok(ProjectionStatusKind::Paused),
        other => Err(StoreError::Internal(anyhow::anyhow!("unknown projection status '{other}'"))),
    }
}

impl SqliteStore {
    /// Writes a checkpoint as part of `tx`, the same transaction the
    /// projection runtime's handler wrote its read-model changes in.
    pub async fn save_checkpoint_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), StoreError> {
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
        .map_err(map_db_error)?;
        Ok(())
    }

    pub async fn delete_checkpoint_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        projection_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = ?")
            .bind(projection_name)
            .execute(&mut **tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, StoreError> {
        self.pool().begin().await.map_err(map_db_error)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteStore {
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
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionCheckpoint, StoreError> {
        let row = sqlx::query(
            "SELECT position, last_event_id, updated_at_unix FROM projection_checkpoints WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_error)?;

        match row {
            Some(row) => {
                let updated_at_unix: i64 = row.try_get("updated_at_unix").map_err(map_db_error)?;
                Ok(ProjectionCheckpoint {
                    projection_name: projection_name.to_string(),
                    position: row.try_get::<i64, _>("position").map_err(map_db_error)? as u64,
                    last_event_id: row.try_get("last_event_id").map_err(map_db_error)?,
                    updated_at: Utc.timestamp_opt(updated_at_unix, 0).single().unwrap_or_else(Utc::now),
                })
            }
            None => Ok(ProjectionCheckpoint::initial(projection_name)),
        }
    }

    async fn delete(&self, projection_name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = ?")
            .bind(projection_name)
            .execute(self.pool())
            .await
            .map_err(map_db_error)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusStore for SqliteStore {
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
        .execute(self.pool())
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionStatus, StoreError> {
        let row = sqlx::query(
            "SELECT status, message, updated_at_unix, progress FROM projection_status WHERE projection_name = ?",
        )
        .bind(projection_name)
        .fetch_optional(self.pool())
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| StoreError::not_found(format!("no status for projection {projection_name}")))?;

        let status_str: String = row.try_get("status").map_err(map_db_error)?;
        let updated_at_unix: i64 = row.try_get("updated_at_unix").map_err(map_db_error)?;
        let progress_json: Option<String> = row.try_get("progress").map_err(map_db_error)?;
        let progress: Option<ProjectionProgress> = progress_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

        Ok(ProjectionStatus {
            projection_name: projection_name.to_string(),
            status: parse_status_kind(&status_str)?,
            message: row.try_get("message").map_err(map_db_error)?,
            updated_at: Utc.timestamp_opt(updated_at_unix, 0).single().unwrap_or_else(Utc::now),
            progress,
        })
    }
}

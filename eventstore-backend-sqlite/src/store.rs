//! SQLite-backed `EventLog` and `SnapshotStore` (C1, C2). The durable
//! counterpart to `eventstore-backend-memory`, implementing the bit-exact
//! schema and append algorithm.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use eventstore_core::{
    AppendIdempotentResult, ClaimStatus, ConstraintOp, Event, EventLog, EventMetadata, NewEvent,
    Snapshot, SnapshotMeta, SnapshotStats, SnapshotStore, StoreError, UniqueConstraint,
};
use sqlx::{Row, SqlitePool};

use crate::errors::map_db_error;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, StoreError> {
    let metadata_json: String = row.try_get("metadata").map_err(map_db_error)?;
    let metadata: EventMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

    let constraints_json: Option<String> = row.try_get("unique_constraints").map_err(map_db_error)?;
    let unique_constraints: Vec<UniqueConstraint> = match constraints_json {
        Some(s) => serde_json::from_str(&s).map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?,
        None => Vec::new(),
    };

    let timestamp_unix: i64 = row.try_get("timestamp_unix").map_err(map_db_error)?;

    Ok(Event {
        id: row.try_get("event_id").map_err(map_db_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(map_db_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(map_db_error)?,
        event_type: row.try_get("event_type").map_err(map_db_error)?,
        version: row.try_get::<i64, _>("version").map_err(map_db_error)? as u64,
        global_position: row.try_get::<i64, _>("global_position").map_err(map_db_error)? as u64,
        timestamp: Utc.timestamp_opt(timestamp_unix, 0).single().unwrap_or_else(Utc::now),
        payload: row.try_get("payload").map_err(map_db_error)?,
        metadata,
        unique_constraints,
    })
}

async fn max_global_position(conn: &mut sqlx::SqliteConnection) -> Result<u64, StoreError> {
    let row = sqlx::query("SELECT COALESCE(MAX(global_position), 0) AS max_pos FROM events")
        .fetch_one(conn)
        .await
        .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("max_pos").map_err(map_db_error)? as u64)
}

async fn current_version_tx(
    conn: &mut sqlx::SqliteConnection,
    aggregate_id: &str,
) -> Result<u64, StoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(version), 0) AS max_version FROM events WHERE aggregate_id = ?",
    )
    .bind(aggregate_id)
    .fetch_one(conn)
    .await
    .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("max_version").map_err(map_db_error)? as u64)
}

async fn claim_owner(
    conn: &mut sqlx::SqliteConnection,
    index_name: &str,
    value: &str,
) -> Result<Option<String>, StoreError> {
    let row = sqlx::query("SELECT aggregate_id FROM unique_constraints WHERE index_name = ? AND value = ?")
        .bind(index_name)
        .bind(value)
        .fetch_optional(conn)
        .await
        .map_err(map_db_error)?;
    Ok(row.map(|r| r.try_get::<String, _>("aggregate_id")).transpose().map_err(map_db_error)?)
}

/// Appends `events` within an already-open transaction, assuming
/// `expected_version`/unique-constraint checks happen inside the same
/// transaction as the caller's other writes (used by both the plain and
/// idempotent append paths, and by the aggregate repository when it wants
/// to enlist a command receipt write in the same commit).
async fn append_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    aggregate_id: &str,
    aggregate_type: &str,
    expected_version: u64,
    events: Vec<NewEvent>,
) -> Result<Vec<Event>, StoreError> {
    let current = current_version_tx(&mut **tx, aggregate_id).await?;
    if current != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual: current,
        });
    }

    // Validate every claim against both already-committed rows and this
    // batch's own prior entries before writing anything.
    let mut batch_owners: std::collections::HashMap<(String, String), String> = std::collections::HashMap::new();
    for ev in &events {
        for c in &ev.unique_constraints {
            let key = (c.index_name.clone(), c.value.clone());
            match c.op {
                ConstraintOp::Claim => {
                    if let Some(owner) = batch_owners.get(&key) {
                        if owner != aggregate_id {
                            return Err(StoreError::ConstraintViolation {
                                index: c.index_name.clone(),
                                value: c.value.clone(),
                                owner: owner.clone(),
                            });
                        }
                    } else if let Some(owner) = claim_owner(&mut **tx, &c.index_name, &c.value).await? {
                        if owner != aggregate_id {
                            return Err(StoreError::ConstraintViolation {
                                index: c.index_name.clone(),
                                value: c.value.clone(),
                                owner,
                            });
                        }
                    }
                    batch_owners.insert(key, aggregate_id.to_string());
                }
                ConstraintOp::Release => {
                    batch_owners.remove(&key);
                }
            }
        }
    }

    let mut next_global = max_global_position(&mut **tx).await?;
    let now = Utc::now();
    let mut committed = Vec::with_capacity(events.len());

    for (idx, new_event) in events.into_iter().enumerate() {
        let version = expected_version + idx as u64 + 1;
        next_global += 1;
        let id = new_event.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let metadata_json = serde_json::to_string(&new_event.metadata)
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        let constraints_json = if new_event.unique_constraints.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&new_event.unique_constraints)
                    .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?,
            )
        };

        sqlx::query(
            "INSERT INTO events (
                event_id, aggregate_id, aggregate_type, event_type, version,
                global_position, timestamp_unix, payload, metadata, unique_constraints
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(aggregate_id)
        .bind(aggregate_type)
        .bind(&new_event.event_type)
        .bind(version as i64)
        .bind(next_global as i64)
        .bind(now.timestamp())
        .bind(&new_event.payload)
        .bind(&metadata_json)
        .bind(&constraints_json)
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;

        for c in &new_event.unique_constraints {
            match c.op {
                ConstraintOp::Claim => {
                    sqlx::query(
                        "INSERT INTO unique_constraints (index_name, value, aggregate_id, created_at_unix)
                         VALUES (?, ?, ?, ?)
                         ON CONFLICT (index_name, value) DO UPDATE SET aggregate_id = excluded.aggregate_id, created_at_unix = excluded.created_at_unix",
                    )
                    .bind(&c.index_name)
                    .bind(&c.value)
                    .bind(aggregate_id)
                    .bind(now.timestamp())
                    .execute(&mut **tx)
                    .await
                    .map_err(map_db_error)?;
                }
                ConstraintOp::Release => {
                    sqlx::query("DELETE FROM unique_constraints WHERE index_name = ? AND value = ?")
                        .bind(&c.index_name)
                        .bind(&c.value)
                        .execute(&mut **tx)
                        .await
                        .map_err(map_db_error)?;
                }
            }
        }

        committed.push(Event {
            id,
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_type: new_event.event_type,
            version,
            global_position: next_global,
            timestamp: now,
            payload: new_event.payload,
            metadata: new_event.metadata,
            unique_constraints: new_event.unique_constraints,
        });
    }

    Ok(committed)
}

#[async_trait]
impl EventLog for SqliteStore {
    #[tracing::instrument(skip(self, events))]
    async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        let committed = append_in_tx(&mut tx, aggregate_id, aggregate_type, expected_version, events).await?;
        tx.commit().await.map_err(map_db_error)?;
        Ok(committed)
    }

    #[tracing::instrument(skip(self, events))]
    async fn append_idempotent(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
        command_id: &str,
        ttl: chrono::Duration,
    ) -> Result<AppendIdempotentResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        let now = Utc::now();

        let existing = sqlx::query(
            "SELECT processed_at_unix, expires_at_unix, event_ids FROM processed_commands WHERE command_id = ?",
        )
        .bind(command_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?;

        if let Some(row) = existing {
            let expires_at_unix: i64 = row.try_get("expires_at_unix").map_err(map_db_error)?;
            if now.timestamp() < expires_at_unix {
                let processed_at_unix: i64 = row.try_get("processed_at_unix").map_err(map_db_error)?;
                let event_ids_json: String = row.try_get("event_ids").map_err(map_db_error)?;
                let event_ids: Vec<String> = serde_json::from_str(&event_ids_json)
                    .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;

                let mut events = Vec::with_capacity(event_ids.len());
                for id in &event_ids {
                    let row = sqlx::query("SELECT * FROM events WHERE event_id = ?")
                        .bind(id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(map_db_error)?;
                    events.push(row_to_event(&row)?);
                }
                tx.rollback().await.map_err(map_db_error)?;
                return Ok(AppendIdempotentResult {
                    events,
                    already_processed: true,
                    processed_at: Utc.timestamp_opt(processed_at_unix, 0).single().unwrap_or(now),
                });
            }
        }

        let committed = append_in_tx(&mut tx, aggregate_id, aggregate_type, expected_version, events).await?;

        let event_ids_json = serde_json::to_string(&committed.iter().map(|e| e.id.clone()).collect::<Vec<_>>())
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        let expires_at = now + ttl;

        sqlx::query(
            "INSERT INTO processed_commands (command_id, aggregate_id, processed_at_unix, expires_at_unix, event_ids)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(command_id)
        .bind(aggregate_id)
        .bind(now.timestamp())
        .bind(expires_at.timestamp())
        .bind(&event_ids_json)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        tx.commit().await.map_err(map_db_error)?;

        Ok(AppendIdempotentResult {
            events: committed,
            already_processed: false,
            processed_at: now,
        })
    }

    async fn load_stream(&self, aggregate_id: &str, after_version: u64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE aggregate_id = ? AND version > ? ORDER BY version ASC",
        )
        .bind(aggregate_id)
        .bind(after_version as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn load_all(&self, after_position: u64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE global_position > ? ORDER BY global_position ASC LIMIT ?",
        )
        .bind(after_position as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(row_to_event).collect()
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS max_version FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(row.try_get::<i64, _>("max_version").map_err(map_db_error)? as u64)
    }

    async fn check_unique(&self, index: &str, value: &str) -> Result<ClaimStatus, StoreError> {
        let row = sqlx::query("SELECT aggregate_id FROM unique_constraints WHERE index_name = ? AND value = ?")
            .bind(index)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(match row {
            Some(r) => ClaimStatus {
                available: false,
                owner_aggregate_id: Some(r.try_get("aggregate_id").map_err(map_db_error)?),
            },
            None => ClaimStatus {
                available: true,
                owner_aggregate_id: None,
            },
        })
    }

    async fn rebuild_unique_index(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        sqlx::query("DELETE FROM unique_constraints").execute(&mut *tx).await.map_err(map_db_error)?;

        let rows = sqlx::query("SELECT aggregate_id, unique_constraints FROM events ORDER BY global_position ASC")
            .fetch_all(&mut *tx)
            .await
            .map_err(map_db_error)?;

        for row in rows {
            let aggregate_id: String = row.try_get("aggregate_id").map_err(map_db_error)?;
            let constraints_json: Option<String> = row.try_get("unique_constraints").map_err(map_db_error)?;
            let Some(constraints_json) = constraints_json else { continue };
            let constraints: Vec<UniqueConstraint> = serde_json::from_str(&constraints_json)
                .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
            let now = Utc::now().timestamp();
            for c in constraints {
                match c.op {
                    ConstraintOp::Claim => {
                        sqlx::query(
                            "INSERT INTO unique_constraints (index_name, value, aggregate_id, created_at_unix)
                             VALUES (?, ?, ?, ?)
                             ON CONFLICT (index_name, value) DO UPDATE SET aggregate_id = excluded.aggregate_id, created_at_unix = excluded.created_at_unix",
                        )
                        .bind(&c.index_name)
                        .bind(&c.value)
                        .bind(&aggregate_id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_db_error)?;
                    }
                    ConstraintOp::Release => {
                        sqlx::query("DELETE FROM unique_constraints WHERE index_name = ? AND value = ?")
                            .bind(&c.index_name)
                            .bind(&c.value)
                            .execute(&mut *tx)
                            .await
                            .map_err(map_db_error)?;
                    }
                }
            }
        }

        tx.commit().await.map_err(map_db_error)?;
        Ok(())
    }

    async fn sweep_expired_receipts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM processed_commands WHERE expires_at_unix <= ?")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_string(&snapshot.meta)
            .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query(
            "INSERT INTO snapshots (aggregate_id, version, aggregate_type, payload, created_at_unix, metadata)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (aggregate_id, version) DO UPDATE SET
                payload = excluded.payload,
                created_at_unix = excluded.created_at_unix,
                metadata = excluded.metadata",
        )
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version as i64)
        .bind(&snapshot.aggregate_type)
        .bind(&snapshot.payload)
        .bind(snapshot.created_at.timestamp())
        .bind(&metadata_json)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn latest(&self, aggregate_id: &str) -> Result<Snapshot, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM snapshots WHERE aggregate_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| StoreError::not_found(format!("no snapshot for {aggregate_id}")))?;
        row_to_snapshot(&row)
    }

    async fn latest_at_or_before(&self, aggregate_id: &str, version: u64) -> Result<Snapshot, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM snapshots WHERE aggregate_id = ? AND version <= ? ORDER BY version DESC LIMIT 1",
        )
        .bind(aggregate_id)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| StoreError::not_found(format!("no snapshot for {aggregate_id} at or before {version}")))?;
        row_to_snapshot(&row)
    }

    async fn delete_older_than(&self, aggregate_id: &str, version: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM snapshots WHERE aggregate_id = ? AND version < ?")
            .bind(aggregate_id)
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn stats(&self) -> Result<SnapshotStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(DISTINCT aggregate_id) AS unique_aggregates,
                    COALESCE(SUM(LENGTH(payload)), 0) AS total_bytes,
                    MIN(created_at_unix) AS oldest, MAX(created_at_unix) AS newest
             FROM snapshots",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;

        let total: i64 = row.try_get("total").map_err(map_db_error)?;
        let total_bytes: i64 = row.try_get("total_bytes").map_err(map_db_error)?;
        let oldest: Option<i64> = row.try_get("oldest").map_err(map_db_error)?;
        let newest: Option<i64> = row.try_get("newest").map_err(map_db_error)?;

        Ok(SnapshotStats {
            total: total as u64,
            unique_aggregates: row.try_get::<i64, _>("unique_aggregates").map_err(map_db_error)? as u64,
            total_bytes: total_bytes as u64,
            avg_bytes: if total > 0 { total_bytes as u64 / total as u64 } else { 0 },
            oldest: oldest.and_then(|t| Utc.timestamp_opt(t, 0).single()),
            newest: newest.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        })
    }
}

fn row_to_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<Snapshot, StoreError> {
    let metadata_json: String = row.try_get("metadata").map_err(map_db_error)?;
    let meta: SnapshotMeta = serde_json::from_str(&metadata_json)
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e)))?;
    let created_at_unix: i64 = row.try_get("created_at_unix").map_err(map_db_error)?;

    Ok(Snapshot {
        aggregate_id: row.try_get("aggregate_id").map_err(map_db_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(map_db_error)?,
        version: row.try_get::<i64, _>("version").map_err(map_db_error)? as u64,
        payload: row.try_get("payload").map_err(map_db_error)?,
        created_at: Utc.timestamp_opt(created_at_unix, 0).single().unwrap_or_else(Utc::now),
        meta,
    })
}

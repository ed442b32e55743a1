//! Per-projection read-model migrations (§4.5 "Schema ownership").
//!
//! Each projection owns its read-model tables and is responsible for
//! migrating them; the runtime only guarantees that migrations run once,
//! in order, before the projection starts consuming events. Progress is
//! tracked in a table named after the projection so that many projections
//! can share one database without colliding.

use sqlx::{Row, SqlitePool};

use crate::error::ProjectionError;

/// One forward-only migration for a projection's read-model schema.
pub struct ProjectionMigration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Reduces `name` to the `[a-z0-9_]` alphabet so it can be spliced directly
/// into a `CREATE TABLE` / `INSERT` statement as part of a per-projection
/// migrations table name. Sqlite has no parameter binding for identifiers.
pub fn sanitize_projection_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn migrations_table(projection_name: &str) -> String {
    format!("projection_migrations_{}", sanitize_projection_name(projection_name))
}

/// Applies every migration in `migrations` whose version has not yet been
/// recorded for `projection_name`, each in its own transaction, in
/// ascending version order. Idempotent: re-running with the same (or a
/// prefix of the same) migration list is a no-op.
pub async fn run_migrations(
    pool: &SqlitePool,
    projection_name: &str,
    migrations: &[ProjectionMigration],
) -> Result<(), ProjectionError> {
    let table = migrations_table(projection_name);

    let create_table_sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )"
    );
    sqlx::query(&create_table_sql)
        .execute(pool)
        .await
        .map_err(|e| ProjectionError::Migration(e.to_string()))?;

    let applied_sql = format!("SELECT version FROM {table}");
    let applied_rows = sqlx::query(&applied_sql)
        .fetch_all(pool)
        .await
        .map_err(|e| ProjectionError::Migration(e.to_string()))?;
    let applied: std::collections::HashSet<i64> = applied_rows
        .iter()
        .map(|row| row.try_get::<i64, _>("version"))
        .collect::<Result<_, _>>()
        .map_err(|e| ProjectionError::Migration(e.to_string()))?;

    let mut pending: Vec<&ProjectionMigration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        let mut tx = pool.begin().await.map_err(|e| ProjectionError::Migration(e.to_string()))?;

        sqlx::query(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Migration(format!("{}: {e}", migration.name)))?;

        let record_sql = format!("INSERT INTO {table} (version, name, applied_at) VALUES (?, ?, ?)");
        sqlx::query(&record_sql)
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Migration(e.to_string()))?;

        tx.commit().await.map_err(|e| ProjectionError::Migration(e.to_string()))?;

        tracing::info!(projection = projection_name, version = migration.version, name = migration.name, "applied projection migration");
    }

    Ok(())
}

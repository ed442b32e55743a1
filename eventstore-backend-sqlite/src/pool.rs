use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Opens a pool against `database_url` (a `sqlite://` URL or bare path),
/// creating the file if missing, and runs the embedded migrations.
///
/// A single connection is kept open: SQLite serializes writers at the file
/// level regardless of pool size, and capping the pool at one connection
/// means every `pool.begin()` in `store.rs` already queues behind whichever
/// transaction currently holds it, with no separate locking needed.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// An ephemeral, in-memory pool for tests (`test-utils` feature).
#[cfg(feature = "test-utils")]
pub async fn connect_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

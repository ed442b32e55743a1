use eventstore_core::StoreError;

/// Maps a raw `sqlx::Error` to the store's error taxonomy. Unique-index
/// violations on `events(aggregate_id, version)` and
/// `unique_constraints(index_name, value)` surface as domain signals
/// elsewhere (the append algorithm checks the relevant condition itself
/// before committing), so any constraint violation reaching this point is
/// treated as an internal inconsistency rather than re-derived into a
/// `ConcurrencyConflict`/`ConstraintViolation`.
pub fn map_db_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::not_found("row not found"),
        other => StoreError::Internal(anyhow::anyhow!(other)),
    }
}

//! The event log contract (C1, §4.1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::event::{Event, NewEvent};
use crate::receipt::AppendIdempotentResult;

/// Whether `(index_name, value)` is currently unclaimed, and if not, who
/// holds it (§4.1 `check_unique`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStatus {
    pub available: bool,
    pub owner_aggregate_id: Option<String>,
}

/// Append-only, per-aggregate ordered, globally ordered event store with
/// optimistic concurrency, command idempotency and unique-value claims.
///
/// Implementations must uphold the append algorithm in §4.1: the whole
/// append is one serializable transaction, `expected_version` is checked
/// before anything else, unique constraints are applied in event order, and
/// `global_position` is assigned in commit order.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends `events` atomically, assigning them contiguous versions
    /// starting at `expected_version + 1`. Fails with
    /// `StoreError::ConcurrencyConflict` if the aggregate's current version
    /// differs from `expected_version`, or `StoreError::ConstraintViolation`
    /// if a `claim` constraint is already held by another aggregate.
    async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Like `append`, but deduplicated by `command_id`: a repeat call with
    /// the same `command_id` (before `ttl` elapses) performs no writes and
    /// returns the originally committed events with `already_processed =
    /// true`.
    async fn append_idempotent(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
        command_id: &str,
        ttl: chrono::Duration,
    ) -> Result<AppendIdempotentResult, StoreError>;

    /// Events for `aggregate_id` with `version > after_version`, ordered by
    /// version ascending.
    async fn load_stream(&self, aggregate_id: &str, after_version: u64) -> Result<Vec<Event>, StoreError>;

    /// Events across all aggregates with `global_position > after_position`,
    /// ordered by global position ascending, capped at `limit`.
    async fn load_all(&self, after_position: u64, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Current version of `aggregate_id`, or 0 if unknown.
    async fn current_version(&self, aggregate_id: &str) -> Result<u64, StoreError>;

    /// Whether `(index, value)` is currently claimed, and by whom.
    async fn check_unique(&self, index: &str, value: &str) -> Result<ClaimStatus, StoreError>;

    /// Reconstructs the unique-claim table from scratch by replaying every
    /// event's `unique_constraints` in `global_position` order.
    async fn rebuild_unique_index(&self) -> Result<(), StoreError>;

    /// Deletes expired command receipts, returning the number removed.
    async fn sweep_expired_receipts(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

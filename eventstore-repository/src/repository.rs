//! Aggregate load/save (C3, §4.3): hides event-sourcing mechanics behind
//! `load`/`save`/`save_with_command`, with snapshot strategy wiring and
//! command-derived event ids.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use eventstore_core::{
    Aggregate, Event, EventLog, NewEvent, Snapshot, SnapshotMeta, SnapshotStore, SnapshotStrategy,
    StoreError,
};

use crate::eventid::derive_event_id;

/// An event's payload schema version for `Aggregate::upcast_event`, read
/// from `metadata.custom["schema_version"]` the way `EventMetadata`'s own
/// doc comment describes that bag ("application-defined key/value pairs
/// that don't warrant a first-class field") — there is no dedicated
/// `schema_version` column on `Event` the way there is on `SnapshotMeta`.
/// Missing or unparsable defaults to 0, the initial/current shape.
fn event_schema_version(event: &Event) -> u32 {
    event
        .metadata
        .custom
        .get("schema_version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Loads and saves a specific aggregate type against an event log and
/// (optionally) a snapshot store. `load`/`save` are the only two operations
/// most callers need; `retry_on_conflict` wraps the load-handle-save cycle
/// for command handlers that want automatic retry on `ConcurrencyConflict`.
pub struct AggregateRepository<A, L, S, Strat>
where
    A: Aggregate,
    L: EventLog,
    S: SnapshotStore,
    Strat: SnapshotStrategy,
{
    log: Arc<L>,
    snapshots: Arc<S>,
    strategy: Arc<Strat>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, L, S, Strat> AggregateRepository<A, L, S, Strat>
where
    A: Aggregate,
    L: EventLog,
    S: SnapshotStore,
    Strat: SnapshotStrategy,
{
    pub fn new(log: Arc<L>, snapshots: Arc<S>, strategy: Arc<Strat>) -> Self {
        Self {
            log,
            snapshots,
            strategy,
            _aggregate: PhantomData,
        }
    }

    /// Loads `aggregate_id`, starting from the latest snapshot (if any) and
    /// replaying everything after it. `NotFound` if there is neither a
    /// snapshot nor any events.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self, aggregate_id: &str) -> Result<A, StoreError> {
        let mut aggregate = A::default();
        let mut from_version = 0u64;
        let mut had_snapshot = false;

        match self.snapshots.latest(aggregate_id).await {
            Ok(snapshot) => {
                let payload = A::upcast_snapshot(snapshot.meta.schema_version, snapshot.payload);
                aggregate.load_snapshot_payload(&payload, snapshot.version);
                from_version = snapshot.version;
                had_snapshot = true;
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let events = self.log.load_stream(aggregate_id, from_version).await?;
        if !had_snapshot && events.is_empty() {
            return Err(StoreError::not_found(format!("aggregate {aggregate_id} does not exist")));
        }

        for mut event in events {
            let schema_version = event_schema_version(&event);
            event.payload = A::upcast_event(&event.event_type, schema_version, event.payload);
            aggregate.apply(&event);
        }

        Ok(aggregate)
    }

    /// Like `load`, but returns a fresh `A::default()` instead of `NotFound`
    /// when the aggregate has no history yet. Used internally by
    /// `retry_on_conflict` for command handlers that create new aggregates.
    pub async fn load_or_default(&self, aggregate_id: &str) -> Result<A, StoreError> {
        match self.load(aggregate_id).await {
            Ok(a) => Ok(a),
            Err(StoreError::NotFound(_)) => Ok(A::default()),
            Err(e) => Err(e),
        }
    }

    /// Appends `new_events` and, if due, snapshots the post-commit state.
    /// `aggregate` must already reflect the state after folding
    /// `new_events` — its `version()` is used to compute `expected_version`.
    #[tracing::instrument(skip(self, aggregate, new_events))]
    pub async fn save(
        &self,
        aggregate: &A,
        aggregate_id: &str,
        new_events: Vec<NewEvent>,
    ) -> Result<Vec<eventstore_core::Event>, StoreError> {
        if new_events.is_empty() {
            return Ok(Vec::new());
        }
        let expected_version = aggregate.version() - new_events.len() as u64;
        let committed = self
            .log
            .append(aggregate_id, A::aggregate_type(), expected_version, new_events)
            .await?;
        self.maybe_snapshot(aggregate, aggregate_id).await?;
        Ok(committed)
    }

    /// Like `save`, but deduplicated by `command_id`: a retried call with the
    /// same `command_id` performs no writes and reports
    /// `already_processed = true`. Event ids are derived deterministically
    /// from `command_id` so retries are byte-identical.
    #[tracing::instrument(skip(self, aggregate, new_events))]
    pub async fn save_with_command(
        &self,
        aggregate: &A,
        aggregate_id: &str,
        mut new_events: Vec<NewEvent>,
        command_id: &str,
        receipt_ttl: chrono::Duration,
    ) -> Result<eventstore_core::AppendIdempotentResult, StoreError> {
        if new_events.is_empty() {
            return Ok(eventstore_core::AppendIdempotentResult {
                events: Vec::new(),
                already_processed: false,
                processed_at: chrono::Utc::now(),
            });
        }
        let expected_version = aggregate.version() - new_events.len() as u64;

        for (idx, event) in new_events.iter_mut().enumerate() {
            if event.id.is_none() {
                event.id = Some(derive_event_id(command_id, aggregate_id, idx));
            }
        }

        let result = self
            .log
            .append_idempotent(
                aggregate_id,
                A::aggregate_type(),
                expected_version,
                new_events,
                command_id,
                receipt_ttl,
            )
            .await?;

        if !result.already_processed {
            self.maybe_snapshot(aggregate, aggregate_id).await?;
        }

        Ok(result)
    }

    async fn maybe_snapshot(&self, aggregate: &A, aggregate_id: &str) -> Result<(), StoreError> {
        let Some(payload) = aggregate.to_snapshot_payload() else {
            return Ok(());
        };

        let last_snapshot_version = match self.snapshots.latest(aggregate_id).await {
            Ok(snapshot) => snapshot.version,
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let events_since_last_snapshot = aggregate.version().saturating_sub(last_snapshot_version);

        if !self.strategy.should_snapshot(aggregate.version(), events_since_last_snapshot) {
            return Ok(());
        }

        let size = payload.len() as u64;
        self.snapshots
            .save(Snapshot {
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: A::aggregate_type().to_string(),
                version: aggregate.version(),
                payload,
                created_at: chrono::Utc::now(),
                meta: SnapshotMeta {
                    size,
                    event_count: aggregate.version(),
                    serializer_tag: "raw".to_string(),
                    schema_version: 1,
                },
            })
            .await?;

        let interval = self.strategy.interval();
        if interval > 0 {
            let cutoff = eventstore_core::snapshot::retention_cutoff(aggregate.version(), interval);
            if cutoff > 0 {
                self.snapshots.delete_older_than(aggregate_id, cutoff).await?;
            }
        }

        Ok(())
    }
}

/// Reloads the aggregate and re-invokes `handler` on `ConcurrencyConflict`,
/// backing off `10 * 2^k` ms between attempts, up to `max_attempts` (§4.3).
///
/// `handler` receives the freshly loaded (or newly defaulted) aggregate and
/// returns the events it wants appended; the repository folds nothing on
/// the caller's behalf, so `handler` is responsible for returning an
/// aggregate whose `version()` already reflects those events (e.g. by
/// applying them to its own clone before returning).
pub async fn retry_on_conflict<A, L, S, Strat, F, Fut>(
    repo: &AggregateRepository<A, L, S, Strat>,
    aggregate_id: &str,
    max_attempts: u32,
    mut handler: F,
) -> Result<(A, Vec<eventstore_core::Event>), StoreError>
where
    A: Aggregate,
    L: EventLog,
    S: SnapshotStore,
    Strat: SnapshotStrategy,
    F: FnMut(A) -> Fut,
    Fut: Future<Output = Result<(A, Vec<NewEvent>), StoreError>>,
{
    let mut attempt = 0u32;
    loop {
        let loaded = repo.load_or_default(aggregate_id).await?;
        let (post_state, new_events) = handler(loaded).await?;

        match repo.save(&post_state, aggregate_id, new_events).await {
            Ok(committed) => return Ok((post_state, committed)),
            Err(StoreError::ConcurrencyConflict { .. }) if attempt + 1 < max_attempts => {
                let backoff = Duration::from_millis(10u64.saturating_mul(1u64 << attempt.min(20)));
                tracing::debug!(aggregate_id, attempt, backoff_ms = backoff.as_millis(), "retrying after conflict");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

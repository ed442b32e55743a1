//! In-process implementation of `EventLog`, `SnapshotStore`,
//! `CheckpointStore` and `StatusStore`, backed by `parking_lot`-guarded
//! maps. Used for fast tests and as a reference implementation of the
//! append algorithm (§4.1) without any I/O.
//!
//! A single write lock over all state plays the role of the "process-level
//! write mutex... required when the underlying store is an in-memory
//! database with a single connection" (§5): every mutating operation holds
//! it for its whole duration, so the append algorithm's steps are
//! effectively one transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventstore_core::{
    AppendIdempotentResult, CheckpointStore, ClaimStatus, CommandReceipt, ConstraintOp, Event,
    EventLog, NewEvent, ProjectionCheckpoint, ProjectionStatus, Snapshot, SnapshotStats,
    SnapshotStore, StatusStore, StoreError,
};
use parking_lot::RwLock;

#[derive(Default)]
struct Inner {
    streams: HashMap<String, Vec<Event>>,
    all: Vec<Event>,
    next_global: u64,
    claims: HashMap<(String, String), (String, DateTime<Utc>)>,
    receipts: HashMap<String, CommandReceipt>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    checkpoints: HashMap<String, ProjectionCheckpoint>,
    statuses: HashMap<String, ProjectionStatus>,
}

/// In-memory `EventLog` + `SnapshotStore`. Cloning is cheap (shares the same
/// underlying state via `Arc`).
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_constraints(
    inner: &Inner,
    aggregate_id: &str,
    events: &[NewEvent],
) -> Result<(), StoreError> {
    // Scratch view of claims as this batch would leave them, so a batch can
    // claim-then-release (or vice versa) within itself without false
    // conflicts, while still rejecting a claim already held by someone else.
    let mut scratch: HashMap<(String, String), String> = HashMap::new();
    for (key, (owner, _)) in inner.claims.iter() {
        scratch.insert(key.clone(), owner.clone());
    }

    for event in events {
        for c in &event.unique_constraints {
            let key = (c.index_name.clone(), c.value.clone());
            match c.op {
                ConstraintOp::Claim => {
                    if let Some(owner) = scratch.get(&key) {
                        if owner != aggregate_id {
                            return Err(StoreError::ConstraintViolation {
                                index: c.index_name.clone(),
                                value: c.value.clone(),
                                owner: owner.clone(),
                            });
                        }
                    }
                    scratch.insert(key, aggregate_id.to_string());
                }
                ConstraintOp::Release => {
                    scratch.remove(&key);
                }
            }
        }
    }
    Ok(())
}

fn commit_constraints(
    inner: &mut Inner,
    aggregate_id: &str,
    constraints: &[eventstore_core::UniqueConstraint],
    now: DateTime<Utc>,
) {
    for c in constraints {
        let key = (c.index_name.clone(), c.value.clone());
        match c.op {
            ConstraintOp::Claim => {
                inner.claims.insert(key, (aggregate_id.to_string(), now));
            }
            ConstraintOp::Release => {
                inner.claims.remove(&key);
            }
        }
    }
}

fn append_locked(
    inner: &mut Inner,
    aggregate_id: &str,
    aggregate_type: &str,
    expected_version: u64,
    events: Vec<NewEvent>,
) -> Result<Vec<Event>, StoreError> {
    let current = inner
        .streams
        .get(aggregate_id)
        .map(|v| v.last().map(|e| e.version).unwrap_or(0))
        .unwrap_or(0);

    if current != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual: current,
        });
    }

    validate_constraints(inner, aggregate_id, &events)?;

    let now = Utc::now();
    let mut committed = Vec::with_capacity(events.len());
    for (idx, new_event) in events.into_iter().enumerate() {
        let version = expected_version + idx as u64 + 1;
        inner.next_global += 1;
        let global_position = inner.next_global;
        let id = new_event.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let event = Event {
            id,
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_type: new_event.event_type,
            version,
            global_position,
            timestamp: now,
            payload: new_event.payload,
            metadata: new_event.metadata,
            unique_constraints: new_event.unique_constraints,
        };

        commit_constraints(inner, aggregate_id, &event.unique_constraints, now);

        inner.streams.entry(aggregate_id.to_string()).or_default().push(event.clone());
        inner.all.push(event.clone());
        committed.push(event);
    }

    Ok(committed)
}

#[async_trait]
impl EventLog for MemoryStore {
    async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut inner = self.inner.write();
        append_locked(&mut inner, aggregate_id, aggregate_type, expected_version, events)
    }

    async fn append_idempotent(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_version: u64,
        events: Vec<NewEvent>,
        command_id: &str,
        ttl: chrono::Duration,
    ) -> Result<AppendIdempotentResult, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        if let Some(receipt) = inner.receipts.get(command_id) {
            if !receipt.is_expired(now) {
                let events = receipt
                    .event_ids
                    .iter()
                    .filter_map(|id| inner.all.iter().find(|e| &e.id == id).cloned())
                    .collect();
                return Ok(AppendIdempotentResult {
                    events,
                    already_processed: true,
                    processed_at: receipt.processed_at,
                });
            }
        }

        let committed = append_locked(&mut inner, aggregate_id, aggregate_type, expected_version, events)?;

        let receipt = CommandReceipt {
            command_id: command_id.to_string(),
            aggregate_id: aggregate_id.to_string(),
            processed_at: now,
            expires_at: now + ttl,
            event_ids: committed.iter().map(|e| e.id.clone()).collect(),
        };
        inner.receipts.insert(command_id.to_string(), receipt);

        Ok(AppendIdempotentResult {
            events: committed,
            already_processed: false,
            processed_at: now,
        })
    }

    async fn load_stream(&self, aggregate_id: &str, after_version: u64) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .streams
            .get(aggregate_id)
            .map(|v| v.iter().filter(|e| e.version > after_version).cloned().collect())
            .unwrap_or_default())
    }

    async fn load_all(&self, after_position: u64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .all
            .iter()
            .filter(|e| e.global_position > after_position)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<u64, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .streams
            .get(aggregate_id)
            .and_then(|v| v.last())
            .map(|e| e.version)
            .unwrap_or(0))
    }

    async fn check_unique(&self, index: &str, value: &str) -> Result<ClaimStatus, StoreError> {
        let inner = self.inner.read();
        let key = (index.to_string(), value.to_string());
        Ok(match inner.claims.get(&key) {
            Some((owner, _)) => ClaimStatus {
                available: false,
                owner_aggregate_id: Some(owner.clone()),
            },
            None => ClaimStatus {
                available: true,
                owner_aggregate_id: None,
            },
        })
    }

    async fn rebuild_unique_index(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.claims.clear();
        let now = Utc::now();
        let events = inner.all.clone();
        for event in &events {
            for c in &event.unique_constraints {
                let key = (c.index_name.clone(), c.value.clone());
                match c.op {
                    ConstraintOp::Claim => {
                        inner.claims.insert(key, (event.aggregate_id.clone(), now));
                    }
                    ConstraintOp::Release => {
                        inner.claims.remove(&key);
                    }
                }
            }
        }
        tracing::debug!(claims = inner.claims.len(), "rebuilt unique index");
        Ok(())
    }

    async fn sweep_expired_receipts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.receipts.len();
        inner.receipts.retain(|_, r| !r.is_expired(now));
        Ok((before - inner.receipts.len()) as u64)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let list = inner.snapshots.entry(snapshot.aggregate_id.clone()).or_default();
        list.retain(|s| s.version != snapshot.version);
        list.push(snapshot);
        list.sort_by_key(|s| s.version);
        Ok(())
    }

    async fn latest(&self, aggregate_id: &str) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read();
        inner
            .snapshots
            .get(aggregate_id)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("no snapshot for {aggregate_id}")))
    }

    async fn latest_at_or_before(&self, aggregate_id: &str, version: u64) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read();
        inner
            .snapshots
            .get(aggregate_id)
            .and_then(|v| v.iter().rev().find(|s| s.version <= version))
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("no snapshot for {aggregate_id} at or before {version}")))
    }

    async fn delete_older_than(&self, aggregate_id: &str, version: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(list) = inner.snapshots.get_mut(aggregate_id) {
            list.retain(|s| s.version >= version);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<SnapshotStats, StoreError> {
        let inner = self.inner.read();
        let all: Vec<&Snapshot> = inner.snapshots.values().flatten().collect();
        if all.is_empty() {
            return Ok(SnapshotStats::default());
        }
        let total_bytes: u64 = all.iter().map(|s| s.payload.len() as u64).sum();
        let oldest = all.iter().map(|s| s.created_at).min();
        let newest = all.iter().map(|s| s.created_at).max();
        Ok(SnapshotStats {
            total: all.len() as u64,
            unique_aggregates: inner.snapshots.len() as u64,
            total_bytes,
            avg_bytes: total_bytes / all.len() as u64,
            oldest,
            newest,
        })
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.checkpoints.insert(checkpoint.projection_name.clone(), checkpoint);
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionCheckpoint, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .checkpoints
            .get(projection_name)
            .cloned()
            .unwrap_or_else(|| ProjectionCheckpoint::initial(projection_name)))
    }

    async fn delete(&self, projection_name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.checkpoints.remove(projection_name);
        Ok(())
    }
}

impl MemoryStore {
    /// Saves a checkpoint as part of the caller's in-process apply step.
    /// There is no real transaction to enlist in for this backend, but the
    /// method exists so callers written against a transactional backend
    /// (`eventstore-backend-sqlite`) can target either one uniformly.
    pub fn save_checkpoint_in_tx(&self, checkpoint: ProjectionCheckpoint) {
        let mut inner = self.inner.write();
        inner.checkpoints.insert(checkpoint.projection_name.clone(), checkpoint);
    }

    pub fn delete_checkpoint_in_tx(&self, projection_name: &str) {
        let mut inner = self.inner.write();
        inner.checkpoints.remove(projection_name);
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn save(&self, status: ProjectionStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.statuses.insert(status.projection_name.clone(), status);
        Ok(())
    }

    async fn load(&self, projection_name: &str) -> Result<ProjectionStatus, StoreError> {
        let inner = self.inner.read();
        inner
            .statuses
            .get(projection_name)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("no status for projection {projection_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::{EventMetadata, UniqueConstraint};

    fn event(event_type: &str) -> NewEvent {
        NewEvent::new(event_type, Vec::new()).with_metadata(EventMetadata::default())
    }

    #[tokio::test]
    async fn append_assigns_contiguous_versions_and_global_positions() {
        let store = MemoryStore::new();
        let events = vec![event("A"), event("B")];
        let committed = store
            .append("agg-1", "Thing", 0, events)
            .await
            .expect("append should succeed");
        assert_eq!(committed[0].version, 1);
        assert_eq!(committed[1].version, 2);
        assert_eq!(committed[0].global_position, 1);
        assert_eq!(committed[1].global_position, 2);
    }

    #[tokio::test]
    async fn append_rejects_wrong_expected_version() {
        let store = MemoryStore::new();
        store.append("agg-1", "Thing", 0, vec![event("A")]).await.unwrap();
        let err = store.append("agg-1", "Thing", 0, vec![event("B")]).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { expected: 0, actual: 1, .. }));
    }

    #[tokio::test]
    async fn append_idempotent_replays_cached_result() {
        let store = MemoryStore::new();
        let r1 = store
            .append_idempotent("agg-1", "Thing", 0, vec![event("A")], "cmd-1", chrono::Duration::days(7))
            .await
            .unwrap();
        assert!(!r1.already_processed);
        assert_eq!(r1.events.len(), 1);

        let r2 = store
            .append_idempotent("agg-1", "Thing", 0, vec![event("A")], "cmd-1", chrono::Duration::days(7))
            .await
            .unwrap();
        assert!(r2.already_processed);
        assert_eq!(r2.events[0].id, r1.events[0].id);

        assert_eq!(store.current_version("agg-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_conflict_from_different_aggregate_is_constraint_violation() {
        let store = MemoryStore::new();
        let claim = |owner: &str| {
            NewEvent::new("Opened", Vec::new())
                .with_constraint(UniqueConstraint::claim("email", "x@y.z"))
                .with_metadata(EventMetadata::default())
                .with_id(format!("{owner}-ev"))
        };
        store.append("u-a", "Account", 0, vec![claim("u-a")]).await.unwrap();
        let err = store.append("u-b", "Account", 0, vec![claim("u-b")]).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { owner, .. } if owner == "u-a"));
    }

    #[tokio::test]
    async fn rebuild_unique_index_matches_incremental_state() {
        let store = MemoryStore::new();
        store
            .append(
                "u-a",
                "Account",
                0,
                vec![NewEvent::new("Opened", Vec::new())
                    .with_constraint(UniqueConstraint::claim("email", "x@y.z"))],
            )
            .await
            .unwrap();

        let before = store.check_unique("email", "x@y.z").await.unwrap();
        store.rebuild_unique_index().await.unwrap();
        let after = store.check_unique("email", "x@y.z").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn snapshot_latest_at_or_before_picks_closest_without_going_over() {
        let store = MemoryStore::new();
        for v in [3u64, 6, 9] {
            store
                .save(Snapshot {
                    aggregate_id: "a1".into(),
                    aggregate_type: "Thing".into(),
                    version: v,
                    payload: vec![v as u8],
                    created_at: Utc::now(),
                    meta: Default::default(),
                })
                .await
                .unwrap();
        }
        let snap = store.latest_at_or_before("a1", 7).await.unwrap();
        assert_eq!(snap.version, 6);
    }

    #[tokio::test]
    async fn checkpoint_load_defaults_to_initial_when_unset() {
        let store = MemoryStore::new();
        let checkpoint = CheckpointStore::load(&store, "orders_by_customer").await.unwrap();
        assert_eq!(checkpoint.position, 0);

        let mut advanced = checkpoint.clone();
        advanced.position = 42;
        advanced.last_event_id = "ev-42".into();
        CheckpointStore::save(&store, advanced).await.unwrap();

        let reloaded = CheckpointStore::load(&store, "orders_by_customer").await.unwrap();
        assert_eq!(reloaded.position, 42);
    }

    #[tokio::test]
    async fn status_load_is_not_found_until_first_save() {
        let store = MemoryStore::new();
        assert!(StatusStore::load(&store, "orders_by_customer").await.is_err());

        StatusStore::save(&store, ProjectionStatus::ready("orders_by_customer")).await.unwrap();
        let status = StatusStore::load(&store, "orders_by_customer").await.unwrap();
        assert_eq!(status.status, eventstore_core::ProjectionStatusKind::Ready);
    }
}

//! Domain types and trait contracts shared by every event-store crate in
//! this workspace: the event log (C1), snapshot store (C2), checkpoint and
//! status stores (C4), the aggregate abstraction (C3) and the event bus
//! contract (C6).
//!
//! This crate has no backend: see `eventstore-backend-memory` and
//! `eventstore-backend-sqlite` for implementations, `eventstore-repository`
//! for the aggregate load/save path, `eventstore-projection` for the
//! checkpointed projection runtime, and `eventstore-bus` for the in-process
//! durable pub/sub implementation.

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod event;
pub mod event_bus;
pub mod event_log;
pub mod receipt;
pub mod snapshot;
pub mod stores;
pub mod telemetry;

pub use aggregate::Aggregate;
pub use checkpoint::{ProjectionCheckpoint, ProjectionProgress, ProjectionStatus, ProjectionStatusKind};
pub use config::{ConfigError, EngineConfig};
pub use errors::StoreError;
pub use event::{ConstraintOp, Event, EventMetadata, NewEvent, UniqueConstraint};
pub use event_bus::{BoxFuture, Delivery, EventBus, Subscription, SubscriptionFilter};
pub use event_log::{ClaimStatus, EventLog};
pub use receipt::{AppendIdempotentResult, CommandReceipt, DEFAULT_RECEIPT_TTL_SECS};
pub use snapshot::{
    IntervalSnapshotStrategy, NeverSnapshotStrategy, Snapshot, SnapshotMeta, SnapshotStats,
    SnapshotStrategy, SNAPSHOT_RETENTION_COUNT,
};
pub use stores::{CheckpointStore, SnapshotStore, StatusStore};

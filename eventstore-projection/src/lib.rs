//! The checkpointed projection runtime (C5, §4.5 of `SPEC_FULL.md`).
//!
//! A projection consumes committed events and maintains a read model,
//! tracking its progress with a [`eventstore_core::ProjectionCheckpoint`].
//! This crate supplies:
//!
//! - [`ProjectionBackend`]: the per-projection transaction boundary, with a
//!   durable Sqlite implementation and a zero-I/O in-memory one.
//! - [`ProjectionHandler`]: the trait an embedder implements to apply
//!   events to their own read-model tables.
//! - [`ProjectionRuntime`]: replay-then-subscribe startup, live apply with
//!   checkpoint-in-the-same-transaction, and on-demand rebuild.
//! - [`migrations`]: a namespaced, forward-only migration runner for a
//!   projection's own read-model schema.

pub mod backend;
pub mod error;
pub mod handler;
pub mod migrations;
pub mod pool;
pub mod runtime;

pub use backend::{MemoryProjectionBackend, ProjectionBackend, SqliteProjectionBackend};
pub use error::ProjectionError;
pub use handler::ProjectionHandler;
pub use migrations::{run_migrations, sanitize_projection_name, ProjectionMigration};
pub use pool::connect;
#[cfg(feature = "test-utils")]
pub use pool::connect_in_memory;
pub use runtime::{ProjectionRuntime, ProjectionRuntimeConfig, ProjectionWorker};

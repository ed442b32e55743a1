//! Durable SQLite implementation of the event log, snapshot store,
//! checkpoint store and status store, matching the bit-exact schema.
//!
//! Embedding applications construct a `SqliteStore` via [`pool::connect`]
//! (or, under `test-utils`, [`pool::connect_in_memory`]) and hand the same
//! value to every trait that needs a backend; it implements `EventLog`,
//! `SnapshotStore`, `CheckpointStore` and `StatusStore` all at once.

mod checkpoint;
mod errors;
mod pool;
mod store;

pub use pool::connect;
#[cfg(feature = "test-utils")]
pub use pool::connect_in_memory;
pub use store::SqliteStore;

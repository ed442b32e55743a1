//! In-process `EventLog`/`SnapshotStore` implementation with no I/O. Intended
//! for tests and for embedding applications that don't need durability
//! across restarts; see `eventstore-backend-sqlite` for the durable backend.

mod store;

pub use store::MemoryStore;

//! Aggregate load/save path (C3, §4.3): `AggregateRepository` hides the
//! snapshot-then-replay load algorithm and the append-then-maybe-snapshot
//! save algorithm behind a small surface, plus `retry_on_conflict` for
//! command handlers that want to retry on `ConcurrencyConflict`.

mod eventid;
mod repository;

pub use eventid::derive_event_id;
pub use repository::{retry_on_conflict, AggregateRepository};

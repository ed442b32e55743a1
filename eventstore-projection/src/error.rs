//! Error taxonomy for the projection runtime (C5), layered over `StoreError`
//! the way `SPEC_FULL.md`'s ambient-stack section describes for this crate.

use eventstore_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The registered handler (or reset hook) failed while applying an
    /// event inside the per-event transaction; the transaction was rolled
    /// back and the event is eligible for redelivery.
    #[error("projection handler failed: {0}")]
    Handler(String),

    /// A per-projection read-model migration failed to apply.
    #[error("projection migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

//! The per-projection read-model handler contract (§4.5).

use async_trait::async_trait;
use eventstore_core::Event;

use crate::backend::ProjectionBackend;
use crate::error::ProjectionError;

/// Applies committed events to one projection's read model.
///
/// `handle` runs inside the same transaction the runtime uses to advance
/// the checkpoint: returning `Err` rolls both back, leaving the event
/// eligible to be retried on the next poll. `name()` identifies the
/// projection for checkpoint/status rows and the migrations table.
#[async_trait]
pub trait ProjectionHandler<B: ProjectionBackend>: Send + Sync {
    fn name(&self) -> &str;

    /// Applies one event to the read model as part of `tx`.
    async fn handle(&self, tx: &mut B::Tx, event: &Event) -> Result<(), ProjectionError>;

    /// Wipes the read model as part of `tx`, called once at the start of a
    /// rebuild (§4.5 "Rebuild" step 1) before the checkpoint is reset and
    /// events are replayed from the beginning.
    async fn reset(&self, tx: &mut B::Tx) -> Result<(), ProjectionError>;
}

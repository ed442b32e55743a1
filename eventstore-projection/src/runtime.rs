//! The checkpointed projection runtime (C5, §4.5).
//!
//! One [`ProjectionRuntime`] drives one projection: it replays missed
//! events from the log at startup, then hands off to a bus subscription
//! for live updates, applying the registered [`ProjectionHandler`] and
//! advancing the checkpoint in the same transaction as described in
//! `SPEC_FULL.md`'s component notes for this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eventstore_core::{
    CheckpointStore, Delivery, Event, EventBus, EventLog, ProjectionCheckpoint, ProjectionProgress,
    ProjectionStatus, ProjectionStatusKind, StatusStore, StoreError, SubscriptionFilter,
};

use crate::backend::ProjectionBackend;
use crate::error::ProjectionError;
use crate::handler::ProjectionHandler;

/// Tuning knobs for the replay/rebuild loop. `rebuild_batch` bounds how many
/// events `load_all` returns per round-trip; `progress_every` controls how
/// often the runtime writes a `ProjectionStatus` with updated progress
/// during a long rebuild (status is never read on the hot path, so this can
/// be coarse).
#[derive(Debug, Clone, Copy)]
pub struct ProjectionRuntimeConfig {
    pub rebuild_batch: usize,
    pub progress_every: u64,
}

impl Default for ProjectionRuntimeConfig {
    fn default() -> Self {
        Self {
            rebuild_batch: 1000,
            progress_every: 100,
        }
    }
}

/// Drives one named projection: replay-then-subscribe, and rebuild on
/// demand. Generic over the backend so the same runtime logic serves both
/// the durable Sqlite-backed projection and the in-memory one used in
/// tests.
pub struct ProjectionRuntime<B: ProjectionBackend, H: ProjectionHandler<B>> {
    name: String,
    backend: Arc<B>,
    handler: Arc<H>,
    event_log: Arc<dyn EventLog>,
    bus: Arc<dyn EventBus>,
    filter: SubscriptionFilter,
    config: ProjectionRuntimeConfig,
    paused: AtomicBool,
}

impl<B, H> ProjectionRuntime<B, H>
where
    B: ProjectionBackend + CheckpointStore + StatusStore + 'static,
    H: ProjectionHandler<B> + 'static,
{
    pub fn new(
        backend: Arc<B>,
        handler: Arc<H>,
        event_log: Arc<dyn EventLog>,
        bus: Arc<dyn EventBus>,
        filter: SubscriptionFilter,
        config: ProjectionRuntimeConfig,
    ) -> Self {
        Self {
            name: handler.name().to_string(),
            backend,
            handler,
            event_log,
            bus,
            filter,
            config,
            paused: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn status(&self) -> Result<ProjectionStatus, StoreError> {
        StatusStore::load(self.backend.as_ref(), &self.name).await
    }

    pub async fn checkpoint(&self) -> Result<ProjectionCheckpoint, StoreError> {
        CheckpointStore::load(self.backend.as_ref(), &self.name).await
    }

    /// The handle-contract step from §4.5: begin transaction, invoke the
    /// handler, write the checkpoint, commit. Rolls back and returns the
    /// handler's error on failure.
    async fn apply_event(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut tx = self.backend.begin_tx().await?;

        if let Err(e) = self.handler.handle(&mut tx, event).await {
            let _ = self.backend.rollback_tx(tx).await;
            return Err(e);
        }

        let checkpoint = ProjectionCheckpoint {
            projection_name: self.name.clone(),
            position: event.global_position,
            last_event_id: event.id.clone(),
            updated_at: event.timestamp,
        };

        if let Err(e) = self.backend.save_checkpoint_in_tx(&mut tx, &checkpoint).await {
            let _ = self.backend.rollback_tx(tx).await;
            return Err(e);
        }

        self.backend.commit_tx(tx).await
    }

    /// Replays events from the log, starting just after the persisted
    /// checkpoint, until no more are available. Shared by `start`'s
    /// catch-up phase and `rebuild`'s full replay.
    async fn replay_from_log(&self) -> Result<(), ProjectionError> {
        let mut applied_since_report: u64 = 0;

        loop {
            let checkpoint = CheckpointStore::load(self.backend.as_ref(), &self.name).await?;
            let batch = self
                .event_log
                .load_all(checkpoint.position, self.config.rebuild_batch)
                .await?;

            if batch.is_empty() {
                break;
            }

            for event in &batch {
                self.apply_event(event).await?;
                applied_since_report += 1;

                if applied_since_report >= self.config.progress_every {
                    applied_since_report = 0;
                    let progress = ProjectionProgress {
                        processed: event.global_position,
                        total: None,
                    };
                    let status = ProjectionStatus {
                        projection_name: self.name.clone(),
                        status: ProjectionStatusKind::Rebuilding,
                        message: None,
                        updated_at: event.timestamp,
                        progress: Some(progress),
                    };
                    let _ = StatusStore::save(self.backend.as_ref(), status).await;
                }
            }
        }

        Ok(())
    }

    async fn mark_failed(&self, message: impl Into<String>) {
        let status = ProjectionStatus {
            projection_name: self.name.clone(),
            status: ProjectionStatusKind::Failed,
            message: Some(message.into()),
            updated_at: chrono::Utc::now(),
            progress: None,
        };
        if let Err(e) = StatusStore::save(self.backend.as_ref(), status).await {
            tracing::error!(projection = %self.name, error = %e, "failed to persist FAILED status");
        }
    }

    /// Wipes the read model and checkpoint, then replays the whole log from
    /// the beginning (§4.5 "Rebuild"). Live consumption is paused for the
    /// duration (§9 "idempotency across rebuilds").
    pub async fn rebuild(&self) -> Result<(), ProjectionError> {
        self.paused.store(true, Ordering::SeqCst);

        let rebuilding = ProjectionStatus {
            projection_name: self.name.clone(),
            status: ProjectionStatusKind::Rebuilding,
            message: None,
            updated_at: chrono::Utc::now(),
            progress: Some(ProjectionProgress::default()),
        };
        let _ = StatusStore::save(self.backend.as_ref(), rebuilding).await;

        let mut tx = self.backend.begin_tx().await?;
        if let Err(e) = self.handler.reset(&mut tx).await {
            let _ = self.backend.rollback_tx(tx).await;
            self.mark_failed(e.to_string()).await;
            return Err(e);
        }
        if let Err(e) = self.backend.delete_checkpoint_in_tx(&mut tx, &self.name).await {
            let _ = self.backend.rollback_tx(tx).await;
            self.mark_failed(e.to_string()).await;
            return Err(e);
        }
        self.backend.commit_tx(tx).await?;

        if let Err(e) = self.replay_from_log().await {
            self.mark_failed(e.to_string()).await;
            self.paused.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let ready = ProjectionStatus::ready(self.name.clone());
        let _ = StatusStore::save(self.backend.as_ref(), ready).await;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Catches up from the persisted checkpoint, then subscribes to the bus
    /// for live events. Returns a handle that can be used to trigger a
    /// rebuild or stop the worker.
    pub async fn start(self: Arc<Self>) -> Result<ProjectionWorker<B, H>, ProjectionError> {
        if let Err(e) = self.replay_from_log().await {
            self.mark_failed(e.to_string()).await;
            return Err(e);
        }

        let ready = ProjectionStatus::ready(self.name.clone());
        let _ = StatusStore::save(self.backend.as_ref(), ready).await;

        let runtime = self.clone();
        let subscription = self
            .bus
            .subscribe(
                self.filter.clone(),
                Box::new(move |event: Event| {
                    let runtime = runtime.clone();
                    Box::pin(async move {
                        if runtime.paused.load(Ordering::SeqCst) {
                            return Delivery::Nack;
                        }
                        match runtime.apply_event(&event).await {
                            Ok(()) => Delivery::Ack,
                            Err(e) => {
                                tracing::warn!(
                                    projection = %runtime.name,
                                    event_id = %event.id,
                                    error = %e,
                                    "projection handler failed, will be redelivered"
                                );
                                Delivery::Nack
                            }
                        }
                    })
                }),
            )
            .await?;

        Ok(ProjectionWorker {
            runtime: self,
            subscription,
        })
    }
}

/// A running projection: a live bus subscription plus a handle back to the
/// runtime for rebuilds and status/checkpoint reads.
pub struct ProjectionWorker<B: ProjectionBackend, H: ProjectionHandler<B>> {
    runtime: Arc<ProjectionRuntime<B, H>>,
    subscription: Box<dyn eventstore_core::Subscription>,
}

impl<B, H> ProjectionWorker<B, H>
where
    B: ProjectionBackend + CheckpointStore + StatusStore + 'static,
    H: ProjectionHandler<B> + 'static,
{
    pub fn runtime(&self) -> &Arc<ProjectionRuntime<B, H>> {
        &self.runtime
    }

    pub async fn rebuild(&self) -> Result<(), ProjectionError> {
        self.runtime.rebuild().await
    }

    /// Cooperative shutdown (§5): unsubscribing lets the current event's
    /// transaction finish before the subscription's delivery task exits.
    pub async fn stop(self) {
        self.subscription.unsubscribe().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryProjectionBackend;
    use eventstore_backend_memory::MemoryStore;
    use eventstore_bus::{BusConfig, InProcessBus};
    use eventstore_core::{EventMetadata, NewEvent};
    use std::sync::atomic::AtomicU64;

    struct CountingHandler {
        applied: AtomicU64,
        fail_next: AtomicBool,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                applied: AtomicU64::new(0),
                fail_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl ProjectionHandler<MemoryProjectionBackend> for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(
            &self,
            _tx: &mut <MemoryProjectionBackend as ProjectionBackend>::Tx,
            _event: &Event,
        ) -> Result<(), ProjectionError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ProjectionError::Handler("synthetic failure".into()));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reset(&self, _tx: &mut <MemoryProjectionBackend as ProjectionBackend>::Tx) -> Result<(), ProjectionError> {
            self.applied.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_catches_up_from_the_persisted_checkpoint() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryStore::default());
        for i in 0..3u64 {
            let aggregate_id = format!("agg-{i}");
            let payload = serde_json::to_vec(&i).unwrap();
            log.append(
                &aggregate_id,
                "Thing",
                0,
                vec![NewEvent::new("Happened", payload).with_metadata(EventMetadata::default())],
            )
            .await
            .unwrap();
        }

        let backend = Arc::new(MemoryProjectionBackend::new());
        let handler = Arc::new(CountingHandler::new());
        let bus = InProcessBus::new(BusConfig::default());

        let runtime = Arc::new(ProjectionRuntime::new(
            backend,
            handler.clone(),
            log,
            bus as Arc<dyn EventBus>,
            SubscriptionFilter::all(),
            ProjectionRuntimeConfig::default(),
        ));

        let worker = runtime.clone().start().await.unwrap();
        assert_eq!(handler.applied.load(Ordering::SeqCst), 3);
        assert_eq!(runtime.checkpoint().await.unwrap().position, 3);
        worker.stop().await;
    }

    #[tokio::test]
    async fn a_failed_handler_rolls_back_and_leaves_the_checkpoint_unchanged() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryStore::default());
        log.append(
            "agg-0",
            "Thing",
            0,
            vec![NewEvent::new("Happened", vec![]).with_metadata(EventMetadata::default())],
        )
        .await
        .unwrap();

        let backend = Arc::new(MemoryProjectionBackend::new());
        let handler = Arc::new(CountingHandler::new());
        handler.fail_next.store(true, Ordering::SeqCst);
        let bus = InProcessBus::new(BusConfig::default());

        let runtime = Arc::new(ProjectionRuntime::new(
            backend,
            handler.clone(),
            log,
            bus as Arc<dyn EventBus>,
            SubscriptionFilter::all(),
            ProjectionRuntimeConfig::default(),
        ));

        let err = runtime.clone().start().await.unwrap_err();
        assert!(matches!(err, ProjectionError::Handler(_)));
        assert_eq!(runtime.checkpoint().await.unwrap().position, 0);
        assert_eq!(
            runtime.status().await.unwrap().status,
            ProjectionStatusKind::Failed
        );
    }

    #[tokio::test]
    async fn rebuild_resets_the_handler_and_replays_from_the_beginning() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryStore::default());
        for i in 0..4u64 {
            let aggregate_id = format!("agg-{i}");
            log.append(
                &aggregate_id,
                "Thing",
                0,
                vec![NewEvent::new("Happened", vec![]).with_metadata(EventMetadata::default())],
            )
            .await
            .unwrap();
        }

        let backend = Arc::new(MemoryProjectionBackend::new());
        let handler = Arc::new(CountingHandler::new());
        let bus = InProcessBus::new(BusConfig::default());

        let runtime = Arc::new(ProjectionRuntime::new(
            backend,
            handler.clone(),
            log,
            bus as Arc<dyn EventBus>,
            SubscriptionFilter::all(),
            ProjectionRuntimeConfig::default(),
        ));

        let worker = runtime.clone().start().await.unwrap();
        assert_eq!(handler.applied.load(Ordering::SeqCst), 4);

        runtime.rebuild().await.unwrap();
        assert_eq!(handler.applied.load(Ordering::SeqCst), 4);
        assert_eq!(runtime.checkpoint().await.unwrap().position, 4);
        assert_eq!(runtime.status().await.unwrap().status, ProjectionStatusKind::Ready);

        worker.stop().await;
    }
}

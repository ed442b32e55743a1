//! In-process durable pub/sub event bus (C6, §4.6).
//!
//! Durability here means bounded retention in memory, not persistence across
//! process restarts: a retained ring buffer replays to a subscriber that
//! joins after some events were published, and `tokio::sync::broadcast`
//! gives every live subscriber its own lagging cursor into the stream so one
//! slow consumer never blocks another. Embedding applications that need
//! retention across restarts should subscribe a projection and let its
//! checkpoint carry the durability instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventstore_core::{BoxFuture, Delivery, Event, EventBus, StoreError, Subscription, SubscriptionFilter};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

/// Number of events kept in the retained buffer for replay to subscribers
/// that join after publication (§4.6 "Durability").
const DEFAULT_RETENTION: usize = 10_000;

/// Tunables for redelivery backoff and deduplication, mirroring the
/// corresponding `EngineConfig` fields.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub dedup_window: Duration,
    pub redelivery_base: Duration,
    pub redelivery_max: Duration,
    pub retained_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(300),
            redelivery_base: Duration::from_millis(10),
            redelivery_max: Duration::from_secs(30),
            retained_capacity: DEFAULT_RETENTION,
        }
    }
}

impl From<&eventstore_core::EngineConfig> for BusConfig {
    fn from(cfg: &eventstore_core::EngineConfig) -> Self {
        Self {
            dedup_window: cfg.bus_dedup_window(),
            redelivery_base: Duration::from_millis(cfg.bus_redelivery_base_ms),
            redelivery_max: Duration::from_millis(cfg.bus_redelivery_max_ms),
            retained_capacity: DEFAULT_RETENTION,
        }
    }
}

struct State {
    retained: VecDeque<Event>,
    seen: HashMap<String, Instant>,
}

/// In-process `EventBus` implementation.
pub struct InProcessBus {
    state: Mutex<State>,
    sender: broadcast::Sender<Event>,
    config: BusConfig,
    closed: Arc<Notify>,
}

impl InProcessBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        let (sender, _) = broadcast::channel(config.retained_capacity.max(16));
        Arc::new(Self {
            state: Mutex::new(State {
                retained: VecDeque::with_capacity(config.retained_capacity),
                seen: HashMap::new(),
            }),
            sender,
            config,
            closed: Arc::new(Notify::new()),
        })
    }

    fn sweep_dedup_locked(state: &mut State, now: Instant, window: Duration) {
        state.seen.retain(|_, seen_at| now.duration_since(*seen_at) < window);
    }
}

struct InProcessSubscription {
    id: String,
    cancel: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    async fn unsubscribe(&self) {
        self.cancel.notify_waiters();
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }
}

async fn deliver_with_redelivery(
    event: &Event,
    handler: &(dyn Fn(Event) -> BoxFuture<Delivery> + Send + Sync),
    base: Duration,
    max: Duration,
    cancel: &Notify,
) {
    let mut attempt: u32 = 0;
    loop {
        let outcome = handler(event.clone()).await;
        if matches!(outcome, Delivery::Ack) {
            return;
        }

        let backoff = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX)).min(max);
        attempt = attempt.saturating_add(1);
        tracing::debug!(event_id = %event.id, attempt, backoff_ms = backoff.as_millis(), "nacked, redelivering after backoff");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.notified() => return,
        }
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    #[tracing::instrument(skip(self, events))]
    async fn publish(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Self::sweep_dedup_locked(&mut state, now, self.config.dedup_window);

        for event in events {
            if state.seen.contains_key(&event.id) {
                continue;
            }
            state.seen.insert(event.id.clone(), now);

            if state.retained.len() >= self.config.retained_capacity {
                state.retained.pop_front();
            }
            state.retained.push_back(event.clone());

            // No receivers is not an error: a bus with no subscribers yet is
            // a normal startup state.
            let _ = self.sender.send(event);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        handler: Box<dyn Fn(Event) -> BoxFuture<Delivery> + Send + Sync>,
    ) -> Result<Box<dyn Subscription>, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = Arc::new(Notify::new());

        // The backlog snapshot and the broadcast subscription must be taken
        // under the same `state` lock that `publish` holds while it appends
        // to `retained` and sends: otherwise a publish landing between the
        // two would miss both the backlog (already snapshotted) and the
        // broadcast (receiver not yet registered).
        let (backlog, mut receiver): (Vec<Event>, broadcast::Receiver<Event>) = {
            let state = self.state.lock();
            let backlog = state.retained.iter().filter(|e| filter.matches(e)).cloned().collect();
            let receiver = self.sender.subscribe();
            (backlog, receiver)
        };
        let base = self.config.redelivery_base;
        let max = self.config.redelivery_max;
        let task_cancel = cancel.clone();
        let closed = self.closed.clone();

        let task = tokio::spawn(async move {
            for event in backlog {
                deliver_with_redelivery(&event, handler.as_ref(), base, max, &task_cancel).await;
            }

            loop {
                tokio::select! {
                    res = receiver.recv() => {
                        match res {
                            Ok(event) => {
                                if filter.matches(&event) {
                                    deliver_with_redelivery(&event, handler.as_ref(), base, max, &task_cancel).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "subscriber lagged behind retained window");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = task_cancel.notified() => break,
                    _ = closed.notified() => break,
                }
            }
        });

        Ok(Box::new(InProcessSubscription {
            id,
            cancel,
            task: Mutex::new(Some(task)),
        }))
    }

    async fn close(&self) {
        self.closed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore_core::EventMetadata;
    use tokio::sync::mpsc;

    fn event(id: &str, aggregate_type: &str, event_type: &str) -> Event {
        Event {
            id: id.into(),
            aggregate_id: "a1".into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            version: 1,
            global_position: 1,
            timestamp: chrono::Utc::now(),
            payload: Vec::new(),
            metadata: EventMetadata::default(),
            unique_constraints: Vec::new(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_matching_published_event() {
        let bus = InProcessBus::new(BusConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = bus
            .subscribe(
                SubscriptionFilter::aggregate_type("Account"),
                Box::new(move |event: Event| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(event);
                        Delivery::Ack
                    })
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(vec![event("e1", "Account", "Opened")]).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.id, "e1");

        sub.unsubscribe().await;
    }

    #[tokio::test]
    async fn duplicate_publish_within_dedup_window_delivers_once() {
        let bus = InProcessBus::new(BusConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe(
                SubscriptionFilter::all(),
                Box::new(move |event: Event| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(event);
                        Delivery::Ack
                    })
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(vec![event("dup-1", "Account", "Opened")]).await.unwrap();
        bus.publish(vec![event("dup-1", "Account", "Opened")]).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.id, "dup-1");

        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err(), "dedup window should have suppressed the second delivery");
    }

    #[tokio::test]
    async fn nack_causes_redelivery() {
        let bus = InProcessBus::new(BusConfig {
            redelivery_base: Duration::from_millis(5),
            redelivery_max: Duration::from_millis(20),
            ..BusConfig::default()
        });
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let sub = bus
            .subscribe(
                SubscriptionFilter::all(),
                Box::new(move |_event: Event| {
                    let attempts = attempts_clone.clone();
                    Box::pin(async move {
                        let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        if n < 2 {
                            Delivery::Nack
                        } else {
                            Delivery::Ack
                        }
                    })
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(vec![event("e1", "Account", "Opened")]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

        sub.unsubscribe().await;
    }
}

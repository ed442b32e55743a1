//! The durable message bus contract (C6, §4.6).

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::event::Event;

/// Selects which topics a subscription receives (§4.6 "Filter-to-topic
/// mapping"). Empty lists mean "no restriction" on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub aggregate_types: Vec<String>,
    pub event_types: Vec<String>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn aggregate_type(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_types: vec![aggregate_type.into()],
            event_types: Vec::new(),
        }
    }

    pub fn exact(aggregate_type: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            aggregate_types: vec![aggregate_type.into()],
            event_types: vec![event_type.into()],
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        let agg_ok = self.aggregate_types.is_empty()
            || self.aggregate_types.iter().any(|t| t == &event.aggregate_type);
        let evt_ok = self.event_types.is_empty()
            || self.event_types.iter().any(|t| t == &event.event_type);
        agg_ok && evt_ok
    }
}

/// Outcome of a handler invocation: `Ack` commits delivery, `Nack` causes
/// redelivery after the bus's configured backoff (§4.6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Nack,
}

/// A live subscription. Dropping it (or calling `unsubscribe`) stops
/// delivery to that consumer; it does not affect other subscribers or the
/// bus's retained stream.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn id(&self) -> &str;
    async fn unsubscribe(&self);
}

/// Durable, at-least-once, per-event-deduplicated pub/sub over named topics
/// derived from `(aggregate_type, event_type)` (§4.6).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes `events`, each to the topic `events.<aggregate_type>.<event_type>`.
    /// Publishing an event whose `id` was already published within the
    /// dedup window is a no-op for delivery purposes.
    async fn publish(&self, events: Vec<Event>) -> Result<(), StoreError>;

    /// Registers `handler` against `filter`, returning a handle that can be
    /// used to unsubscribe. `handler` returning `Delivery::Nack` causes
    /// redelivery after backoff; returning an error is treated as `Nack`.
    async fn subscribe(
        &self,
        filter: SubscriptionFilter,
        handler: Box<dyn Fn(Event) -> BoxFuture<Delivery> + Send + Sync>,
    ) -> Result<Box<dyn Subscription>, StoreError>;

    /// Stops accepting new publishes and tears down all subscriptions.
    async fn close(&self);
}

/// A boxed future, used so `EventBus::subscribe` can accept plain closures
/// without requiring callers to name an async-trait-generated future type.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;

    fn event(aggregate_type: &str, event_type: &str) -> Event {
        Event {
            id: "e1".into(),
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

    #[test]
    fn empty_filter_matches_everything() {
        let f = SubscriptionFilter::all();
        assert!(f.matches(&event("Account", "Opened")));
        assert!(f.matches(&event("Order", "Placed")));
    }

    #[test]
    fn aggregate_type_only_filter_matches_any_event_of_that_type() {
        let f = SubscriptionFilter::aggregate_type("Account");
        assert!(f.matches(&event("Account", "Opened")));
        assert!(f.matches(&event("Account", "Closed")));
        assert!(!f.matches(&event("Order", "Placed")));
    }

    #[test]
    fn exact_filter_matches_only_that_topic() {
        let f = SubscriptionFilter::exact("Account", "Opened");
        assert!(f.matches(&event("Account", "Opened")));
        assert!(!f.matches(&event("Account", "Closed")));
        assert!(!f.matches(&event("Order", "Opened")));
    }
}

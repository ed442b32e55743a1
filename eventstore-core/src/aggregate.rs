//! Aggregate polymorphism (§9 "Aggregate polymorphism").
//!
//! No inheritance is required: an aggregate is any type that can be
//! constructed fresh, folds events into its own state, and optionally
//! marshals itself to and from a snapshot payload. Dispatch on event type is
//! a plain pattern match inside `apply_event`.

use crate::event::Event;

/// A consistency boundary whose state is the fold of its events.
///
/// Implementations are expected to be cheap to construct (`Default`) and to
/// apply events deterministically: replaying the same event sequence must
/// always yield the same state.
pub trait Aggregate: Default + Send + Sync {
    /// Stable name used as `aggregate_type` when appending and as the
    /// `aggregate_type` column in snapshots.
    fn aggregate_type() -> &'static str;

    /// Current version, i.e. the number of events folded so far.
    fn version(&self) -> u64;

    /// Folds one event into the aggregate's state. Implementations pattern
    /// match on `event.event_type` and must not fail for event types they
    /// don't recognize (unrecognized foreign events should be ignored so
    /// forward-compatible additions don't break replay).
    fn apply(&mut self, event: &Event);

    /// Serializes current state into a snapshot payload. Returning `None`
    /// opts the aggregate out of snapshotting entirely.
    fn to_snapshot_payload(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restores state from a snapshot payload previously produced by
    /// `to_snapshot_payload`, written at `version`.
    fn load_snapshot_payload(&mut self, _payload: &[u8], _version: u64) {}

    /// Rewrites an old event payload shape into the current shape before
    /// `apply` sees it. Identity by default.
    fn upcast_event(_event_type: &str, _schema_version: u32, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    /// Rewrites an old snapshot payload shape into the current shape before
    /// `load_snapshot_payload` sees it. Identity by default.
    fn upcast_snapshot(_schema_version: u32, payload: Vec<u8>) -> Vec<u8> {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;

    #[derive(Default)]
    struct Counter {
        version: u64,
        value: i64,
    }

    impl Aggregate for Counter {
        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn apply(&mut self, event: &Event) {
            match event.event_type.as_str() {
                "Incremented" => self.value += 1,
                "Decremented" => self.value -= 1,
                _ => {}
            }
            self.version += 1;
        }
    }

    fn event(event_type: &str, version: u64) -> Event {
        Event {
            id: format!("e{version}"),
            aggregate_id: "c1".into(),
            aggregate_type: "Counter".into(),
            event_type: event_type.into(),
            version,
            global_position: version,
            timestamp: chrono::Utc::now(),
            payload: Vec::new(),
            metadata: EventMetadata::default(),
            unique_constraints: Vec::new(),
        }
    }

    #[test]
    fn apply_folds_events_in_order() {
        let mut counter = Counter::default();
        counter.apply(&event("Incremented", 1));
        counter.apply(&event("Incremented", 2));
        counter.apply(&event("Decremented", 3));
        assert_eq!(counter.value, 1);
        assert_eq!(counter.version(), 3);
    }

    #[test]
    fn unrecognized_event_type_is_ignored_but_still_advances_version() {
        let mut counter = Counter::default();
        counter.apply(&event("SomethingElse", 1));
        assert_eq!(counter.value, 0);
        assert_eq!(counter.version(), 1);
    }
}

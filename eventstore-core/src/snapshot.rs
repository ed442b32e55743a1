//! Versioned aggregate snapshots (§3, §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub size: u64,
    pub event_count: u64,
    pub serializer_tag: String,
    pub schema_version: u32,
}

/// A serialized aggregate state at a known version. At most one snapshot
/// exists per `(aggregate_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub meta: SnapshotMeta,
}

/// Aggregate statistics over the whole snapshot table (§4.2 `stats()`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotStats {
    pub total: u64,
    pub unique_aggregates: u64,
    pub total_bytes: u64,
    pub avg_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Decides when an aggregate is due for a fresh snapshot (§4.2).
pub trait SnapshotStrategy: Send + Sync {
    fn should_snapshot(&self, current_version: u64, events_since_last_snapshot: u64) -> bool;

    /// Interval used to compute the retention cutoff (`v - 3*N`); strategies
    /// that are not interval-based may return 0 to disable retention pruning.
    fn interval(&self) -> u64;
}

/// Snapshots every `N` events, the default named in §4.2.
#[derive(Debug, Clone, Copy)]
pub struct IntervalSnapshotStrategy {
    pub interval: u64,
}

impl IntervalSnapshotStrategy {
    pub fn new(interval: u64) -> Self {
        assert!(interval > 0, "snapshot interval must be positive");
        Self { interval }
    }
}

impl SnapshotStrategy for IntervalSnapshotStrategy {
    fn should_snapshot(&self, _current_version: u64, events_since_last_snapshot: u64) -> bool {
        events_since_last_snapshot >= self.interval
    }

    fn interval(&self) -> u64 {
        self.interval
    }
}

/// Never snapshots; aggregates are always rebuilt by full replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshotStrategy;

impl SnapshotStrategy for NeverSnapshotStrategy {
    fn should_snapshot(&self, _current_version: u64, _events_since_last_snapshot: u64) -> bool {
        false
    }

    fn interval(&self) -> u64 {
        0
    }
}

/// Number of snapshots to retain per aggregate once a strategy has an
/// interval (§4.2: "keep at most 3 snapshots").
pub const SNAPSHOT_RETENTION_COUNT: u64 = 3;

/// Computes the retention cutoff version: snapshots strictly older than this
/// are eligible for deletion.
pub fn retention_cutoff(new_version: u64, interval: u64) -> u64 {
    new_version.saturating_sub(SNAPSHOT_RETENTION_COUNT * interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_strategy_fires_at_threshold() {
        let s = IntervalSnapshotStrategy::new(3);
        assert!(!s.should_snapshot(2, 2));
        assert!(s.should_snapshot(3, 3));
        assert!(s.should_snapshot(10, 5));
    }

    #[test]
    fn retention_cutoff_keeps_three_intervals() {
        assert_eq!(retention_cutoff(12, 3), 3);
        assert_eq!(retention_cutoff(6, 3), 0);
        assert_eq!(retention_cutoff(2, 3), 0);
    }
}

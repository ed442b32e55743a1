//! Ambient configuration (not part of spec.md's core, carried per
//! `SPEC_FULL.md`'s ambient-stack section).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::receipt::DEFAULT_RECEIPT_TTL_SECS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Tunables shared across the event log, bus and projection runtime.
///
/// Constructed with `Default` for sane out-of-the-box values, or
/// `EngineConfig::from_env` to read `EVENTSTORE_*` overrides the way
/// `eventstore-bin::resolve_backend` reads `BACKEND`/`DATABASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a command receipt lives before `sweep_expired_receipts` may
    /// remove it (§3 default: 7 days).
    pub receipt_ttl_secs: i64,
    /// Default snapshot interval for `IntervalSnapshotStrategy`.
    pub snapshot_interval: u64,
    /// How long the bus remembers a published event id for deduplication.
    pub bus_dedup_window_secs: u64,
    /// Base redelivery backoff for nacked bus deliveries; actual backoff is
    /// `bus_redelivery_base_ms * 2^attempt`, capped at `bus_redelivery_max_ms`.
    pub bus_redelivery_base_ms: u64,
    pub bus_redelivery_max_ms: u64,
    /// Batch size used by the projection runtime when paging through
    /// `load_all` during a rebuild.
    pub projection_rebuild_batch: usize,
    /// How many attempts `retry_on_conflict` makes before giving up.
    pub retry_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            receipt_ttl_secs: DEFAULT_RECEIPT_TTL_SECS,
            snapshot_interval: 100,
            bus_dedup_window_secs: 300,
            bus_redelivery_base_ms: 10,
            bus_redelivery_max_ms: 30_000,
            projection_rebuild_batch: 1000,
            retry_max_attempts: 5,
        }
    }
}

impl EngineConfig {
    pub fn receipt_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.receipt_ttl_secs)
    }

    pub fn bus_dedup_window(&self) -> Duration {
        Duration::from_secs(self.bus_dedup_window_secs)
    }

    /// Reads overrides from the environment, falling back to `Default` for
    /// anything unset. Never panics; a present-but-unparsable value is an
    /// error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("EVENTSTORE_RECEIPT_TTL_SECS") {
            cfg.receipt_ttl_secs = parse_env("EVENTSTORE_RECEIPT_TTL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_SNAPSHOT_INTERVAL") {
            cfg.snapshot_interval = parse_env("EVENTSTORE_SNAPSHOT_INTERVAL", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_BUS_DEDUP_WINDOW_SECS") {
            cfg.bus_dedup_window_secs = parse_env("EVENTSTORE_BUS_DEDUP_WINDOW_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_BUS_REDELIVERY_BASE_MS") {
            cfg.bus_redelivery_base_ms = parse_env("EVENTSTORE_BUS_REDELIVERY_BASE_MS", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_BUS_REDELIVERY_MAX_MS") {
            cfg.bus_redelivery_max_ms = parse_env("EVENTSTORE_BUS_REDELIVERY_MAX_MS", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_PROJECTION_REBUILD_BATCH") {
            cfg.projection_rebuild_batch = parse_env("EVENTSTORE_PROJECTION_REBUILD_BATCH", &v)?;
        }
        if let Ok(v) = std::env::var("EVENTSTORE_RETRY_MAX_ATTEMPTS") {
            cfg.retry_max_attempts = parse_env("EVENTSTORE_RETRY_MAX_ATTEMPTS", &v)?;
        }

        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

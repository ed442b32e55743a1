//! Command-level idempotency (§3, §4.1 step 2/6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default receipt lifetime: §3 "Command Receipt" lifecycle.
pub const DEFAULT_RECEIPT_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// A record that a `command_id` has already been processed. Written in the
/// same transaction as the events it references; either both commit or
/// neither does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReceipt {
    pub command_id: String,
    pub aggregate_id: String,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub event_ids: Vec<String>,
}

impl CommandReceipt {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of `EventLog::append_idempotent`.
#[derive(Debug, Clone)]
pub struct AppendIdempotentResult {
    pub events: Vec<crate::event::Event>,
    pub already_processed: bool,
    pub processed_at: DateTime<Utc>,
}

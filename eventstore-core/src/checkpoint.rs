//! Projection progress tracking (§3, §4.4, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A projection's cursor into the global event position. One row exists per
/// `projection_name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectionCheckpoint {
    pub projection_name: String,
    pub position: u64,
    pub last_event_id: String,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionCheckpoint {
    pub fn initial(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            position: 0,
            last_event_id: String::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Operator-visible lifecycle state of a projection. Never read on the hot
/// path (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatusKind {
    Ready,
    Rebuilding,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectionProgress {
    pub processed: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectionStatus {
    pub projection_name: String,
    pub status: ProjectionStatusKind,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub progress: Option<ProjectionProgress>,
}

impl ProjectionStatus {
    pub fn ready(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            status: ProjectionStatusKind::Ready,
            message: None,
            updated_at: Utc::now(),
            progress: None,
        }
    }
}

//! The immutable event and its metadata (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System- and request-level context carried alongside every event.
///
/// `custom` holds application-defined key/value pairs that don't warrant a
/// first-class field; the store persists it as-is and never inspects it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMetadata {
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub principal_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_principal_id(mut self, id: impl Into<String>) -> Self {
        self.principal_id = Some(id.into());
        self
    }

    pub fn with_tenant_id(mut self, id: impl Into<String>) -> Self {
        self.tenant_id = Some(id.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// Whether a unique-constraint entry claims ownership of `(index_name,
/// value)` or releases a claim previously held by the same aggregate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOp {
    Claim,
    Release,
}

/// One entry of an event's `unique_constraints` sequence (§3, §4.1 step 3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub index_name: String,
    pub value: String,
    pub op: ConstraintOp,
}

impl UniqueConstraint {
    pub fn claim(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            value: value.into(),
            op: ConstraintOp::Claim,
        }
    }

    pub fn release(index_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            value: value.into(),
            op: ConstraintOp::Release,
        }
    }
}

/// An event proposed for append. `id` is left unset unless the caller wants
/// to pin a deterministic id themselves (see `eventstore-repository`'s
/// command-derived ids); when unset, the log assigns a UUID v4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: Option<String>,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: EventMetadata,
    #[serde(default)]
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::default(),
            unique_constraints: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }
}

/// A committed, immutable fact about a state change (§3).
///
/// `version` is gap-free and 1-based within `aggregate_id`; `global_position`
/// is gap-free and strictly increasing across the whole log, assigned in
/// commit order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub version: u64,
    pub global_position: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub metadata: EventMetadata,
    pub unique_constraints: Vec<UniqueConstraint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_builder_sets_fields() {
        let meta = EventMetadata::new()
            .with_correlation_id("corr-1")
            .with_causation_id("cause-1")
            .with_tenant_id("tenant-1")
            .with_custom("k", "v");

        assert_eq!(meta.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(meta.causation_id.as_deref(), Some("cause-1"));
        assert_eq!(meta.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(meta.custom.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn new_event_defaults_have_no_id_and_no_constraints() {
        let ev = NewEvent::new("Created", vec![1, 2, 3]);
        assert!(ev.id.is_none());
        assert!(ev.unique_constraints.is_empty());
    }
}

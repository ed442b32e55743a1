use thiserror::Error;

/// The error taxonomy shared by the event log, snapshot store and
/// checkpoint store (C1/C2/C4 in the design).
///
/// `ConcurrencyConflict` and `ConstraintViolation` are domain signals, not
/// bugs: callers translate them into user-visible outcomes rather than
/// retrying inside the store (§7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("unique constraint violated on {index}={value}, held by {owner}")]
    ConstraintViolation {
        index: String,
        value: String,
        owner: String,
    },

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::Invalid(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound(what.into())
    }

    /// True for the two domain-level outcomes the core never retries on its
    /// own behalf.
    pub fn is_domain_signal(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::ConstraintViolation { .. }
        )
    }
}

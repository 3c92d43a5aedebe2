//! Domain error model.

use thiserror::Error;

use crate::state::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (parsing, validation, illegal
/// transitions). Storage and runtime concerns belong in `portaljobs-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A queue name did not match any known queue.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// A persisted state string did not match any known state.
    #[error("unknown job state: {0}")]
    UnknownState(String),

    /// A state change that the lifecycle does not allow.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

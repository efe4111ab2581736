//! Error types for contact reconciliation.
//!
//! Errors are layered: input problems ([`ValidationError`]), broken group
//! structure ([`InvariantViolation`]), repository failures ([`StorageError`])
//! and execution failures ([`ExecutionError`]). [`ReconcileError`] wraps all of
//! them and classifies which ones a caller may retry.

use thiserror::Error;

use crate::contact::ContactId;
use crate::storage::StorageError;

/// Errors raised while validating an identify request.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Either email or phoneNumber must be provided")]
    MissingIdentifier,

    #[error("Field '{field}' must be {expected}")]
    InvalidFieldType {
        field: String,
        expected: String,
    },

    #[error("Malformed request body: {reason}")]
    MalformedBody {
        reason: String,
    },
}

/// Structural violations of an identity group.
///
/// These indicate corrupted data or a bug; they are never retried.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("identity group has no primary contact (members: {members:?})")]
    NoPrimary {
        members: Vec<ContactId>,
    },

    #[error("identity group has {} primary contacts: {primaries:?}", primaries.len())]
    MultiplePrimaries {
        primaries: Vec<ContactId>,
    },

    #[error("identity group is empty")]
    EmptyGroup,
}

/// Errors raised while running a request.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Gave up after {attempts} attempts due to concurrent updates")]
    ContentionExhausted {
        attempts: u32,
    },

    #[error("Request queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Worker pool is disconnected")]
    Disconnected,

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to spawn worker: {message}")]
    WorkerSpawn {
        message: String,
    },
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl ReconcileError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an invariant violation.
    #[must_use]
    pub const fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Returns true if this is a serialization conflict from the repository.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_conflict())
    }

    /// Returns true if the service is temporarily unable to take the request.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_conflict(),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::ContentionExhausted { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::Disconnected
            ),
            _ => false,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Invariant(_) => false,
            Self::Storage(e) => e.is_conflict(),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::ContentionExhausted { .. }
                    | ExecutionError::QueueFull { .. }
                    | ExecutionError::Timeout { .. }
            ),
        }
    }
}

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

// Error taxonomy for the concession core
// Mutation errors abort the enclosing transaction and surface synchronously;
// collaborator failures are logged and retried out of band, never through here.

use thiserror::Error;

/// Errors surfaced by core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A concurrent mutation would violate an exclusivity invariant
    /// (duplicate active concession, double sanction).
    #[error("conflict: {reason}")]
    Conflict {
        /// Why the mutation was rejected.
        reason: String,
    },

    /// The operation is not valid from the entity's current state
    /// (re-archive, re-review, transition out of a terminal state).
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// The state the operation requires.
        expected: String,
        /// The state the entity is actually in.
        actual: String,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (concession, transgression, ...).
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// Malformed or missing required input, rejected at the boundary.
    #[error("validation failed: {reason}")]
    Validation {
        /// Which requirement the input failed.
        reason: String,
    },

    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    /// Snapshot or payload (de)serialization failure.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        CoreError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        CoreError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        CoreError::Validation {
            reason: reason.into(),
        }
    }

    /// True when the storage error underneath is a uniqueness-constraint hit.
    /// Used to convert concurrent duplicate inserts into domain conflicts.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

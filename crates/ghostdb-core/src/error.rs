//! Error types for `GhostDB`.
//!
//! One error type covers the cache, the conflict resolver and the
//! transaction log. Error codes follow the pattern `GHOST-XXX`.

use crate::oid::{ObjectId, Tid};
use std::fmt;
use thiserror::Error;

/// Result type alias for `GhostDB` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a write-write conflict could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The class of the object has no registered merge strategy.
    Unresolvable {
        /// Class name decoded from the new state.
        class: String,
    },
    /// The old or committed state could not be loaded or decoded.
    LoadFailed(String),
    /// The caller's deadline expired around the state loads.
    TimedOut,
    /// The merge strategy refused or failed.
    MergeFailed(String),
    /// The merged state could not be encoded back to bytes.
    EncodeFailed(String),
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolvable { class } => write!(f, "class '{class}' has no merge strategy"),
            Self::LoadFailed(msg) => write!(f, "state load failed: {msg}"),
            Self::TimedOut => write!(f, "deadline expired while loading states"),
            Self::MergeFailed(msg) => write!(f, "merge failed: {msg}"),
            Self::EncodeFailed(msg) => write!(f, "resolved state could not be encoded: {msg}"),
        }
    }
}

/// Errors that can occur in `GhostDB` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Object id is in neither the ghost nor the active map (GHOST-001).
    #[error("[GHOST-001] Object {0} not found in cache")]
    KeyNotFound(ObjectId),

    /// Write-write conflict that could not be merged (GHOST-002).
    #[error("[GHOST-002] Conflict on object {oid}: {reason}")]
    Conflict {
        /// Conflicting object.
        oid: ObjectId,
        /// Cause of the failure.
        reason: ConflictReason,
    },

    /// Unresolvable back-pointer, truncated log or malformed header (GHOST-003).
    ///
    /// Fatal to the current pack/restore pass.
    #[error("[GHOST-003] Corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// File offset where the problem was detected.
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// Object copied twice within one transaction pass (GHOST-004).
    #[error("[GHOST-004] Object {0} already written in this transaction")]
    DuplicateRecord(ObjectId),

    /// Malformed persistent reference token in a state (GHOST-005).
    #[error("[GHOST-005] Invalid persistent reference: {0}")]
    InvalidReference(String),

    /// Object has no live record in the log (GHOST-006).
    #[error("[GHOST-006] Object {0} not found in storage")]
    ObjectNotFound(ObjectId),

    /// Object exists but has no record with the requested serial (GHOST-007).
    #[error("[GHOST-007] Object {oid} has no revision {serial}")]
    RevisionNotFound {
        /// Object looked up.
        oid: ObjectId,
        /// Requested serial.
        serial: Tid,
    },

    /// Storage error (GHOST-008).
    #[error("[GHOST-008] Storage error: {0}")]
    Storage(String),

    /// Configuration error (GHOST-009).
    #[error("[GHOST-009] Configuration error: {0}")]
    Config(String),

    /// IO error (GHOST-010).
    #[error("[GHOST-010] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (GHOST-011).
    #[error("[GHOST-011] Serialization error: {0}")]
    Serialization(String),

    /// Internal error (GHOST-012).
    ///
    /// Indicates an unexpected internal error. Please report if encountered.
    #[error("[GHOST-012] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "GHOST-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::KeyNotFound(_) => "GHOST-001",
            Self::Conflict { .. } => "GHOST-002",
            Self::CorruptRecord { .. } => "GHOST-003",
            Self::DuplicateRecord(_) => "GHOST-004",
            Self::InvalidReference(_) => "GHOST-005",
            Self::ObjectNotFound(_) => "GHOST-006",
            Self::RevisionNotFound { .. } => "GHOST-007",
            Self::Storage(_) => "GHOST-008",
            Self::Config(_) => "GHOST-009",
            Self::Io(_) => "GHOST-010",
            Self::Serialization(_) => "GHOST-011",
            Self::Internal(_) => "GHOST-012",
        }
    }

    /// Returns true if this error is recoverable.
    ///
    /// Corruption and internal errors are not; a conflict is recoverable by
    /// aborting and retrying the transaction.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::CorruptRecord { .. } | Self::Internal(_))
    }

    /// Shorthand for a conflict error.
    #[must_use]
    pub fn conflict(oid: ObjectId, reason: ConflictReason) -> Self {
        Self::Conflict { oid, reason }
    }

    /// Shorthand for a corrupt-record error.
    #[must_use]
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

//! Error taxonomy shared by every store operation
//!
//! Callers match on the variant to decide recovery; the display string is the
//! user-visible one-liner.

use std::io;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("agent exited with code {0}")]
    AgentFailed(i32),

    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    /// Wrap an io error with a short action description ("saving plan", ...)
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error is the absence of a record
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the error is an id or invariant collision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

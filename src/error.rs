//! Error types for the state runtime
//!
//! Provides structured error types for all runtime components including
//! the state store, watch engine, remote adapter, and transform controllers.

use std::time::Duration;
use thiserror::Error;

use crate::remote::StatusCode;
use crate::resource::{Phase, Pointer, Version};

/// Unified error type for the runtime
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // State Store Errors
    // =========================================================================
    #[error("resource not found: {pointer}")]
    NotFound { pointer: Pointer },

    #[error("resource already exists: {pointer}")]
    AlreadyExists { pointer: Pointer },

    #[error("version conflict on {pointer}: expected {expected}, found {found}")]
    VersionConflict {
        pointer: Pointer,
        expected: Version,
        found: Version,
    },

    /// `expected` is `None` when a remote store rejected the phase
    /// precondition without echoing which phase the caller required.
    #[error("phase conflict on {pointer}: expected {expected:?}")]
    PhaseConflict {
        pointer: Pointer,
        expected: Option<Phase>,
    },

    #[error("owner conflict on {pointer}: owned by {owner:?}")]
    OwnerConflict { pointer: Pointer, owner: String },

    #[error("destroy blocked by pending finalizers on {pointer}: {finalizers:?}")]
    PendingFinalizers {
        pointer: Pointer,
        finalizers: Vec<String>,
    },

    /// Conflict reported by a remote state where the wire protocol cannot
    /// distinguish version conflicts from pending finalizers.
    #[error("conflict on {pointer}: {message}")]
    Conflict { pointer: Pointer, message: String },

    // =========================================================================
    // Watch Errors
    // =========================================================================
    #[error("watch subscription overran the event log, resubscription required")]
    WatchOverrun,

    #[error("event channel closed")]
    ChannelClosed,

    // =========================================================================
    // Controller Errors
    // =========================================================================
    /// Control signal from a transform function: skip this pass and retry
    /// after the requeue interval. Not a failure.
    #[error("requeue requested")]
    RequeueRequested { after: Option<Duration> },

    #[error("invalid controller configuration: {0}")]
    InvalidConfiguration(String),

    // =========================================================================
    // Remote Adapter Errors
    // =========================================================================
    #[error("transport error ({code}): {message}")]
    Transport { code: StatusCode, message: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the target identity does not exist.
    ///
    /// Expected during races with destruction; callers typically treat it
    /// as a retriable condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this error is a conflict in the broad sense: the operation
    /// lost a race and the caller should re-read and retry (or wait for
    /// finalizer removal).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists { .. }
                | Error::VersionConflict { .. }
                | Error::PhaseConflict { .. }
                | Error::PendingFinalizers { .. }
                | Error::Conflict { .. }
                | Error::WatchOverrun
        )
    }

    /// Whether this error is an ownership violation. Never retried.
    pub fn is_owner_conflict(&self) -> bool {
        matches!(self, Error::OwnerConflict { .. })
    }

    /// Whether this error is the requeue control signal.
    pub fn is_requeue(&self) -> bool {
        matches!(self, Error::RequeueRequested { .. })
    }
}

/// Result type alias using the runtime error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr() -> Pointer {
        Pointer::new("ns", "a", "b")
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::NotFound { pointer: ptr() }.is_not_found());
        assert!(Error::AlreadyExists { pointer: ptr() }.is_conflict());
        assert!(Error::VersionConflict {
            pointer: ptr(),
            expected: Version::first(),
            found: Version::first().next(),
        }
        .is_conflict());
        assert!(Error::PendingFinalizers {
            pointer: ptr(),
            finalizers: vec!["ctrl".into()],
        }
        .is_conflict());
        assert!(Error::OwnerConflict {
            pointer: ptr(),
            owner: "other".into(),
        }
        .is_owner_conflict());

        // Owner conflicts are policy violations, not retriable conflicts.
        assert!(!Error::OwnerConflict {
            pointer: ptr(),
            owner: "other".into(),
        }
        .is_conflict());
        assert!(!Error::NotFound { pointer: ptr() }.is_conflict());
    }

    #[test]
    fn test_requeue_is_not_a_conflict() {
        let err = Error::RequeueRequested { after: None };
        assert!(err.is_requeue());
        assert!(!err.is_conflict());
        assert!(!err.is_not_found());
    }
}

//! Error taxonomy for backend engines.

use thiserror::Error;

/// Result alias used across all backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Outcome of a polled operation that completed without error.
///
/// Transfer posting, polling and notification retrieval distinguish
/// "everything observed done" from "still outstanding"; neither is an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum XferStatus {
    /// All work described by the handle has completed locally.
    Completed,
    /// Work remains outstanding; poll again.
    InProgress,
}

impl XferStatus {
    /// True when the operation has fully completed.
    pub fn is_completed(self) -> bool {
        matches!(self, XferStatus::Completed)
    }
}

/// Error variants surfaced by backend engines.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A caller-visible precondition was violated.
    #[error("invalid parameter: {reason}")]
    InvalidParam {
        /// Description of the violated precondition.
        reason: String,
    },

    /// The named peer or connection is not known to this engine.
    #[error("peer not found: {peer}")]
    NotFound {
        /// The peer the operation referenced.
        peer: String,
    },

    /// The requested capability is absent on this engine.
    #[error("not supported: {reason}")]
    NotSupported {
        /// Description of the missing capability.
        reason: String,
    },

    /// Descriptor counts, lengths, or memory kinds disagree.
    #[error("mismatch: {reason}")]
    Mismatch {
        /// Description of the disagreement.
        reason: String,
    },

    /// An init parameter was registered twice.
    #[error("init parameter already set: {key}")]
    NotAllowed {
        /// The duplicated parameter key.
        key: String,
    },

    /// The peer closed its endpoint.
    #[error("remote peer disconnected: {peer}")]
    RemoteDisconnect {
        /// The peer that went away.
        peer: String,
    },

    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Canceled,

    /// Transport-level failure. The engine may be retried after the
    /// connection is re-established.
    #[error("backend failure: {reason}")]
    Backend {
        /// Description of the underlying fabric failure.
        reason: String,
    },
}

impl BackendError {
    /// Shorthand for an [`BackendError::InvalidParam`] with a formatted reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        BackendError::InvalidParam { reason: reason.into() }
    }

    /// Shorthand for a [`BackendError::Backend`] with a formatted reason.
    pub fn backend(reason: impl Into<String>) -> Self {
        BackendError::Backend { reason: reason.into() }
    }

    /// Shorthand for a [`BackendError::NotFound`] naming a peer.
    pub fn not_found(peer: impl Into<String>) -> Self {
        BackendError::NotFound { peer: peer.into() }
    }

    /// Shorthand for a [`BackendError::Mismatch`] with a formatted reason.
    pub fn mismatch(reason: impl Into<String>) -> Self {
        BackendError::Mismatch { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_completed() {
        assert!(XferStatus::Completed.is_completed());
        assert!(!XferStatus::InProgress.is_completed());
    }

    #[test]
    fn test_error_display() {
        let err = BackendError::not_found("agent-b");
        assert_eq!(err.to_string(), "peer not found: agent-b");

        let err = BackendError::NotAllowed { key: "num_workers".to_string() };
        assert!(err.to_string().contains("num_workers"));
    }
}

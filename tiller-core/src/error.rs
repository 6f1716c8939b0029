//! The gateway's synchronous error surface.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of a failed API request.
///
/// The reason, not the message, decides the caller's retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Reason {
    /// Stale `resourceVersion` on a write; retryable after a re-read
    Conflict,
    /// The identity may not perform the verb; never retried with the same
    /// identity
    Forbidden,
    /// Admission rejected the object; a client error, not retried
    Invalid,
    /// No such object
    NotFound,
    /// Create of an object that already exists
    AlreadyExists,
    /// Watch history was compacted past the requested revision; the caller
    /// must re-list to resynchronize
    Expired,
    /// A disruption budget blocks the voluntary eviction; retryable later
    TooManyRequests,
    /// The store is unreachable; retried with exponential backoff
    Unavailable,
}

/// An error response from the API gateway.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{reason:?}: {message}")]
pub struct ErrorResponse {
    /// The reason for the error
    pub reason: Reason,
    /// A message about the error
    #[serde(default)]
    pub message: String,
}

impl ErrorResponse {
    fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// A stale-resourceVersion failure
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Reason::Conflict, message)
    }

    /// An authorization failure
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Reason::Forbidden, message)
    }

    /// An admission rejection
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Reason::Invalid, message)
    }

    /// A missing object
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Reason::NotFound, message)
    }

    /// A create colliding with an existing object
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Reason::AlreadyExists, message)
    }

    /// A compacted watch history
    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(Reason::Expired, message)
    }

    /// An eviction blocked by a disruption budget
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(Reason::TooManyRequests, message)
    }

    /// An unreachable store
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Reason::Unavailable, message)
    }

    /// Whether a caller may retry the same request unchanged.
    ///
    /// `Conflict` requires a re-read first and `Expired` a re-list, so both
    /// count as retryable here; `Forbidden` and `Invalid` never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            Reason::Conflict | Reason::Expired | Reason::TooManyRequests | Reason::Unavailable
        )
    }
}

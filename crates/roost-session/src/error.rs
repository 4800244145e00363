use roost_types::models::Message;
use thiserror::Error;
use uuid::Uuid;

use crate::controller::SessionState;
use crate::overlay::EntityKey;

/// Failures reported by the backend collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Transient transport failure. The caller may retry.
    #[error("network failure: {0}")]
    Network(String),

    /// The entity changed on the server. `current` is the server's
    /// authoritative copy, `None` when it no longer exists.
    #[error("entity changed on the server")]
    Conflict { current: Option<Box<Message>> },

    /// The server refused the request as invalid.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the session entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("message {0} changed on the server; server state kept")]
    Conflict(Uuid),

    #[error("push subscription failed: {0}")]
    Subscription(String),

    #[error("session is {0}, not ready")]
    NotReady(SessionState),

    #[error("another action is pending for {0}")]
    Busy(EntityKey),

    #[error("unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Map a backend failure for an action on `entity`.
    pub fn from_backend(err: BackendError, entity: Uuid) -> Self {
        match err {
            BackendError::Network(reason) | BackendError::Unavailable(reason) => {
                Self::Network(reason)
            }
            BackendError::Conflict { .. } => Self::Conflict(entity),
            BackendError::Rejected(reason) => Self::Validation(reason),
        }
    }

    /// True when repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Subscription(_))
    }
}

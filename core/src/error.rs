use chat_proto::CallStatus;
use thiserror::Error;
use uuid::Uuid;

/// Coarse failure classes callers use to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused or dropped; retried by the connection manager.
    Transport,
    /// Rejected input or authorization; surfaced immediately, never retried.
    Validation,
    /// Concurrent state disagrees with the request; rejected synchronously.
    Conflict,
    /// Durable commit failed; in-memory state was left untouched.
    Storage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("cannot {action} a call that is {from:?}")]
    InvalidTransition {
        from: CallStatus,
        action: &'static str,
    },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        SyncError::NotFound { entity, id }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        SyncError::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        SyncError::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound { .. } | SyncError::Forbidden(_) | SyncError::Validation(_) => {
                ErrorKind::Validation
            }
            SyncError::Conflict(_) | SyncError::InvalidTransition { .. } => ErrorKind::Conflict,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Transport(_) => ErrorKind::Transport,
        }
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NotFound { .. } => "not_found",
            SyncError::Forbidden(_) => "forbidden",
            SyncError::Validation(_) => "invalid",
            SyncError::Conflict(_) => "conflict",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::Storage(_) => "storage",
            SyncError::Transport(_) => "transport",
        }
    }
}

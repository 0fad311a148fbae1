use relay_core::SessionId;
use thiserror::Error;

/// Errors raised by the session registry and its side tables.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `update` was called for a session the store does not hold.
    ///
    /// Always a lifecycle bug in the caller (update after delete, or a
    /// context that was never registered).
    #[error("session not found in store: {session_id}")]
    NonExistentSession { session_id: SessionId },

    /// The per-session task queue is at capacity; the message was dropped.
    #[error("task queue full for session {session_id}: max {capacity}")]
    QueueFull {
        session_id: SessionId,
        capacity: usize,
    },
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NonExistentSession { .. } => "NON_EXISTENT_SESSION",
            SessionError::QueueFull { .. } => "QUEUE_FULL",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

use relay_core::SessionId;
use relay_sessions::{SessionError, SessionStatus};
use thiserror::Error;

/// Every way a turn can fail.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The session was not idle when the turn tried to lock it.
    /// The caller should queue the message instead.
    #[error("session {session_id} is busy (status {status})")]
    LockConflict {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// A stage exceeded its absolute wall-clock bound.
    #[error("stage {stage} timed out after {ms}ms")]
    StageTimeout { stage: &'static str, ms: u64 },

    /// The provider stream went quiet for a whole idle window.
    #[error("{message} (no activity for {window_ms}ms)")]
    IdleTimeout { message: String, window_ms: u64 },

    /// The provider stream reported an error event.
    #[error("provider error: {0}")]
    Provider(String),

    /// The turn token was cancelled.
    #[error("turn cancelled at {stage}: {reason}")]
    Cancelled { stage: &'static str, reason: String },

    /// The context-builder collaborator failed.
    #[error("context fetch failed: {0}")]
    ContextFetch(String),

    /// The delivery collaborator could not flush the outbound queue.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// AcquireLock found no pending inbound message to work on.
    #[error("no pending message for session {session_id}")]
    MissingMessage { session_id: SessionId },

    /// A stage handed back a different context than it was given.
    #[error("stage {stage} returned a different session context")]
    ContextReplaced { stage: &'static str },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl PipelineError {
    /// Short error code string sent to clients in the halt notification.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::LockConflict { .. } => "LOCK_CONFLICT",
            PipelineError::StageTimeout { .. } => "STAGE_TIMEOUT",
            PipelineError::IdleTimeout { .. } => "IDLE_TIMEOUT",
            PipelineError::Provider(_) => "PROVIDER_ERROR",
            PipelineError::Cancelled { .. } => "CANCELLED",
            PipelineError::ContextFetch(_) => "CONTEXT_FETCH_ERROR",
            PipelineError::Delivery(_) => "DELIVERY_ERROR",
            PipelineError::MissingMessage { .. } => "MISSING_MESSAGE",
            PipelineError::ContextReplaced { .. } => "CONTEXT_REPLACED",
            PipelineError::Session(e) => e.code(),
        }
    }

    /// Text shown to the user as the system message of the failure sequence.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::IdleTimeout { .. } => {
                "The assistant stopped responding and the request was cancelled.".to_string()
            }
            PipelineError::StageTimeout { .. } => {
                "The request took too long and was cancelled.".to_string()
            }
            PipelineError::Cancelled { .. } => "The request was cancelled.".to_string(),
            PipelineError::LockConflict { .. } => {
                "Another request is still running for this session.".to_string()
            }
            other => format!("Something went wrong: {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_and_stage_timeouts_are_distinct() {
        let idle = PipelineError::IdleTimeout {
            message: "stream idle".into(),
            window_ms: 60_000,
        };
        let stage = PipelineError::StageTimeout {
            stage: "stream_response",
            ms: 300_000,
        };
        assert_eq!(idle.code(), "IDLE_TIMEOUT");
        assert_eq!(stage.code(), "STAGE_TIMEOUT");
        assert_ne!(idle.user_message(), stage.user_message());
    }

    #[test]
    fn session_errors_keep_their_code() {
        let e: PipelineError = SessionError::NonExistentSession {
            session_id: SessionId::from("s1"),
        }
        .into();
        assert_eq!(e.code(), "NON_EXISTENT_SESSION");
    }
}

//! Per-turn cancellation token.
//!
//! One [`TurnToken`] is created for each turn and threaded explicitly through
//! every stage and the stream loop. Nothing is interrupted implicitly: code
//! checks the token at its own safe points.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TurnToken {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl TurnToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the turn. Only the first reason is kept; later calls are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

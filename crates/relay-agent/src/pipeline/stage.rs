use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_core::{Notification, NotificationSink};
use relay_sessions::{
    ContextInjectionState, SessionContextStore, SessionHandle, SessionStatus, TaskMessageQueue,
};

use crate::cancel::TurnToken;
use crate::collaborators::{ContextBuilder, OutboundDelivery, ResponseStreamer};
use crate::error::{PipelineError, Result};

/// Shared state and collaborators every stage may reach.
pub struct PipelineDeps {
    pub store: Arc<SessionContextStore>,
    pub injection: Arc<ContextInjectionState>,
    pub queue: Arc<TaskMessageQueue>,
    pub context_builder: Arc<dyn ContextBuilder>,
    pub streamer: Arc<dyn ResponseStreamer>,
    pub delivery: Arc<dyn OutboundDelivery>,
    pub sink: Arc<dyn NotificationSink>,
    pub config: PipelineConfig,
}

impl PipelineDeps {
    /// Move the session to `status` and publish the change.
    pub fn transition(&self, ctx: &SessionHandle, status: SessionStatus) {
        let session_id = {
            let mut c = ctx.lock();
            c.set_status(status);
            c.session_id.clone()
        };
        self.announce(session_id, status);
    }

    pub(crate) fn announce(&self, session_id: relay_core::SessionId, status: SessionStatus) {
        self.sink.emit(Notification::SessionActivity {
            session_id,
            status: status.to_string(),
        });
    }
}

/// One unit of work in a turn.
///
/// A stage mutates the context it is given in place and hands the same
/// handle back. Returning any other handle fails the turn.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Absolute wall-clock bound, measured from stage entry.
    fn timeout(&self, cfg: &PipelineConfig) -> Duration;

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle>;
}

/// Fail with `Cancelled` when the token is set.
pub(crate) fn ensure_live(token: &TurnToken, stage: &'static str) -> Result<()> {
    if token.is_cancelled() {
        return Err(PipelineError::Cancelled {
            stage,
            reason: token.reason().unwrap_or("cancelled").to_string(),
        });
    }
    Ok(())
}

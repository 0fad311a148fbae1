use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_core::SessionId;
use relay_sessions::{ActivityCallback, SessionHandle, SessionStatus, TaskMessageQueue};
use tracing::{debug, info};

use crate::cancel::TurnToken;
use crate::collaborators::StreamRequest;
use crate::error::{PipelineError, Result};
use crate::idle::IdleTimeout;
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};

/// Runs the provider call, bounded by the rolling idle window on top of the
/// stage's absolute timeout.
pub struct StreamResponseStage;

/// Unregisters the queue activity callback however the stage exits.
struct QueueActivityGuard {
    queue: Arc<TaskMessageQueue>,
    session_id: SessionId,
}

impl Drop for QueueActivityGuard {
    fn drop(&mut self) {
        self.queue.clear_activity_callback(&self.session_id);
    }
}

#[async_trait]
impl Stage for StreamResponseStage {
    fn name(&self) -> &'static str {
        "stream_response"
    }

    fn timeout(&self, cfg: &PipelineConfig) -> Duration {
        Duration::from_millis(cfg.stream_timeout_ms)
    }

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle> {
        ensure_live(token, self.name())?;

        let request = {
            let mut c = ctx.lock();
            let Some(msg) = c.current_message.as_ref() else {
                return Err(PipelineError::MissingMessage {
                    session_id: c.session_id.clone(),
                });
            };
            let request = StreamRequest {
                session_id: c.session_id.clone(),
                message_id: msg.id.clone(),
                content: msg.content.clone(),
                continuity_id: c.continuity_id.clone(),
                context: Some(ctx.clone()),
            };
            c.set_status(SessionStatus::Streaming);
            request
        };
        let session_id = request.session_id.clone();
        deps.announce(session_id.clone(), SessionStatus::Streaming);

        let idle = IdleTimeout::new(deps.config.idle_window(), "provider stream went idle");
        let _idle_guard = idle.guard();

        let on_activity: ActivityCallback = {
            let idle = idle.clone();
            Arc::new(move || idle.reset_timeout())
        };
        deps.queue
            .set_activity_callback(&session_id, Arc::clone(&on_activity));
        let _queue_guard = QueueActivityGuard {
            queue: Arc::clone(&deps.queue),
            session_id: session_id.clone(),
        };

        debug!(session = %session_id, resume = request.continuity_id.is_some(), "streaming response");
        let response = tokio::select! {
            res = deps.streamer.stream_response(request, token, on_activity) => res?,
            err = idle.expired() => {
                token.cancel("idle timeout");
                return Err(err);
            }
            _ = token.cancelled() => {
                return Err(PipelineError::Cancelled {
                    stage: self.name(),
                    reason: token.reason().unwrap_or("cancelled").to_string(),
                });
            }
        };

        // A cancelled turn is never finalized with stale content.
        ensure_live(token, self.name())?;
        if response.aborted {
            return Err(PipelineError::Cancelled {
                stage: self.name(),
                reason: "stream aborted".to_string(),
            });
        }

        {
            let mut c = ctx.lock();
            if let Some(ref id) = response.continuity_id {
                if c.capture_continuity_id(id) {
                    c.push_event("continuity", id.clone());
                }
            }
            if let Some(usage) = response.context_usage {
                c.context_usage = Some(usage);
            }
            c.push_event(
                "response",
                format!("{} chars, cost {:?}", response.content.len(), response.cost),
            );
            info!(
                session = %c.session_id,
                chars = response.content.len(),
                cost = response.cost,
                "response streamed"
            );
            c.queue.outbound.push(response.into_outbound());
            c.touch();
        }
        Ok(ctx)
    }
}

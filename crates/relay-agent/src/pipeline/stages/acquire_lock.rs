use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_sessions::{CurrentMessage, SessionHandle, SessionStatus};
use tracing::debug;

use crate::cancel::TurnToken;
use crate::error::{PipelineError, Result};
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};

/// idle -> locked. Takes the oldest pending inbound message as the turn's
/// current message.
pub struct AcquireLockStage;

#[async_trait]
impl Stage for AcquireLockStage {
    fn name(&self) -> &'static str {
        "acquire_lock"
    }

    fn timeout(&self, cfg: &PipelineConfig) -> Duration {
        Duration::from_millis(cfg.acquire_lock_timeout_ms)
    }

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle> {
        ensure_live(token, self.name())?;

        // Check and set under one lock so two turns can never both see idle.
        let session_id = {
            let mut c = ctx.lock();
            if c.status != SessionStatus::Idle {
                return Err(PipelineError::LockConflict {
                    session_id: c.session_id.clone(),
                    status: c.status,
                });
            }
            let Some(msg) = c.queue.inbound.pop_front() else {
                return Err(PipelineError::MissingMessage {
                    session_id: c.session_id.clone(),
                });
            };
            if let Some(target) = msg.editing {
                c.retarget(target);
            }
            debug!(session = %c.session_id, message = %msg.message_id, "lock acquired");
            c.current_message = Some(CurrentMessage {
                id: msg.message_id,
                content: msg.content,
                created_at: msg.created_at,
            });
            c.set_status(SessionStatus::Locked);
            c.session_id.clone()
        };
        deps.announce(session_id, SessionStatus::Locked);
        Ok(ctx)
    }
}

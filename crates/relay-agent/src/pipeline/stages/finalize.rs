use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_sessions::{SessionHandle, SessionStatus};
use tracing::{debug, info};

use crate::cancel::TurnToken;
use crate::error::Result;
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};

/// Flushes the outbound queue and returns the session to idle.
///
/// Editing context, injection flag and continuity id carry over to the next
/// turn; the current message and outbound queue do not.
pub struct FinalizeStage;

#[async_trait]
impl Stage for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn timeout(&self, cfg: &PipelineConfig) -> Duration {
        Duration::from_millis(cfg.finalize_timeout_ms)
    }

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle> {
        ensure_live(token, self.name())?;
        deps.transition(&ctx, SessionStatus::Finalizing);

        let (session_id, outbound) = {
            let c = ctx.lock();
            (c.session_id.clone(), c.queue.outbound.clone())
        };
        let flushed = outbound.len();
        if flushed > 0 {
            deps.delivery.deliver(&session_id, outbound).await?;
            ensure_live(token, self.name())?;
        } else {
            debug!(session = %session_id, "nothing to deliver");
        }

        {
            let mut c = ctx.lock();
            c.clear_turn_state();
            c.set_status(SessionStatus::Idle);
        }
        deps.announce(session_id.clone(), SessionStatus::Idle);
        info!(session = %session_id, flushed, "turn finalized");
        Ok(ctx)
    }
}

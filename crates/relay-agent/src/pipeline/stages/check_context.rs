use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_sessions::{SessionHandle, SessionStatus};
use tracing::debug;

use crate::cancel::TurnToken;
use crate::error::Result;
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};

/// Decides whether this turn needs the full entity context.
///
/// Soft-skips (status stays `locked`) when the session edits nothing or the
/// current entity was already injected. Otherwise moves to
/// `context_injecting`.
pub struct CheckContextInjectionStage;

#[async_trait]
impl Stage for CheckContextInjectionStage {
    fn name(&self) -> &'static str {
        "check_context_injection"
    }

    fn timeout(&self, cfg: &PipelineConfig) -> Duration {
        Duration::from_millis(cfg.check_context_timeout_ms)
    }

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle> {
        ensure_live(token, self.name())?;

        let needs_injection = {
            let c = ctx.lock();
            match c.editing_context.as_ref() {
                None => {
                    debug!(session = %c.session_id, "no editing context, skipping injection");
                    false
                }
                Some(ec) => {
                    let injected = ec.context_injected
                        || deps.injection.is_injected(&c.session_id, ec.entity_key());
                    if injected {
                        debug!(
                            session = %c.session_id,
                            entity = ec.entity_key(),
                            "context already injected, skipping"
                        );
                    }
                    !injected
                }
            }
        };

        if needs_injection {
            deps.transition(&ctx, SessionStatus::ContextInjecting);
        }
        Ok(ctx)
    }
}

use std::time::Duration;

use async_trait::async_trait;
use relay_core::config::PipelineConfig;
use relay_core::notify::InjectionMode;
use relay_core::truncate::truncate_chars;
use relay_core::Notification;
use relay_sessions::{SessionHandle, SessionStatus};
use tracing::{debug, info, warn};

use crate::cancel::TurnToken;
use crate::error::Result;
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};

/// Longest context preview sent in the injected notification.
const PREVIEW_CHARS: usize = 1000;

/// Replaces the current message with the full entity context.
pub struct InjectContextStage;

#[async_trait]
impl Stage for InjectContextStage {
    fn name(&self) -> &'static str {
        "inject_context"
    }

    fn timeout(&self, cfg: &PipelineConfig) -> Duration {
        Duration::from_millis(cfg.inject_context_timeout_ms)
    }

    async fn execute(
        &self,
        ctx: SessionHandle,
        deps: &PipelineDeps,
        token: &TurnToken,
    ) -> Result<SessionHandle> {
        ensure_live(token, self.name())?;

        let prepared = {
            let c = ctx.lock();
            if c.status != SessionStatus::ContextInjecting {
                let pending = c.editing_context.as_ref().is_some_and(|ec| {
                    !ec.context_injected && !deps.injection.is_injected(&c.session_id, ec.entity_key())
                });
                if pending {
                    warn!(
                        session = %c.session_id,
                        status = %c.status,
                        "entity context pending but session is not context_injecting, skipping"
                    );
                } else {
                    debug!(session = %c.session_id, status = %c.status, "no injection requested");
                }
                None
            } else {
                match (c.editing_context.clone(), c.current_message.as_ref()) {
                    (Some(ec), Some(msg)) => Some((c.session_id.clone(), ec, msg.content.clone())),
                    _ => {
                        warn!(
                            session = %c.session_id,
                            "context_injecting without editing context or message, skipping"
                        );
                        return Ok(ctx.clone());
                    }
                }
            }
        };
        let Some((session_id, editing, user_text)) = prepared else {
            return Ok(ctx);
        };

        let full = deps
            .context_builder
            .build_full_context(&editing, &user_text)
            .await?;
        ensure_live(token, self.name())?;

        let entity_key = editing.entity_key().to_string();
        {
            let mut c = ctx.lock();
            if let Some(msg) = c.current_message.as_mut() {
                msg.content = full.clone();
            }
            if let Some(ec) = c.editing_context.as_mut() {
                ec.context_injected = true;
            }
            c.push_event("context_injected", format!("{} chars for {entity_key}", full.len()));
            c.touch();
        }
        deps.injection.mark_injected(&session_id, &entity_key);

        info!(
            session = %session_id,
            entity_type = %editing.entity_type,
            entity = %entity_key,
            chars = full.len(),
            "entity context injected"
        );
        deps.sink.emit(Notification::ContextInjected {
            session_id,
            entity_type: editing.entity_type,
            entity_id: editing.entity_id,
            mode: InjectionMode::Full,
            content: truncate_chars(&full, PREVIEW_CHARS),
        });
        Ok(ctx)
    }
}

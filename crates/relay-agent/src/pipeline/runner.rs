use std::sync::Arc;

use relay_sessions::{SessionHandle, SessionStatus};
use tracing::{debug, instrument, warn};

use crate::cancel::TurnToken;
use crate::error::{PipelineError, Result};
use crate::pipeline::stage::{ensure_live, PipelineDeps, Stage};
use crate::pipeline::stages::default_stages;

/// Runs the turn stages in order against one session context.
///
/// The first unrecovered failure stops the run and leaves the session in
/// `error`; the caller owns the user-facing failure notifications.
pub struct MessagePipeline {
    stages: Vec<Box<dyn Stage>>,
    deps: Arc<PipelineDeps>,
}

impl MessagePipeline {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self::with_stages(deps, default_stages())
    }

    pub fn with_stages(deps: Arc<PipelineDeps>, stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages, deps }
    }

    pub fn deps(&self) -> &Arc<PipelineDeps> {
        &self.deps
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Execute one turn. Every stage sees the same `token`; a stage timeout
    /// cancels it before the error is returned.
    #[instrument(name = "turn", skip_all, fields(session = %ctx.session_id()))]
    pub async fn execute(&self, ctx: SessionHandle, token: &TurnToken) -> Result<SessionHandle> {
        let mut current = ctx;

        for stage in &self.stages {
            let name = stage.name();
            if let Err(e) = ensure_live(token, name) {
                return Err(self.fail(&current, e));
            }

            let limit = stage.timeout(&self.deps.config);
            current.lock().push_event("stage", format!("enter {name}"));
            debug!(stage = name, timeout_ms = limit.as_millis() as u64, "stage start");

            let outcome =
                match tokio::time::timeout(limit, stage.execute(current.clone(), &self.deps, token))
                    .await
                {
                    Ok(Ok(next)) if next.ptr_eq(&current) => Ok(next),
                    Ok(Ok(_)) => Err(PipelineError::ContextReplaced { stage: name }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => {
                        token.cancel(format!("{name} timed out"));
                        Err(PipelineError::StageTimeout {
                            stage: name,
                            ms: limit.as_millis() as u64,
                        })
                    }
                };

            match outcome {
                Ok(next) => {
                    current = next;
                    if let Err(e) = self.deps.store.update(&current) {
                        return Err(self.fail(&current, e.into()));
                    }
                    current.lock().push_event("stage", format!("exit {name}"));
                }
                Err(e) => return Err(self.fail(&current, e)),
            }
        }

        Ok(current)
    }

    /// Record `err` on the context and move it to `error`.
    fn fail(&self, ctx: &SessionHandle, err: PipelineError) -> PipelineError {
        // A conflicting turn owns the status; leave it alone.
        if let PipelineError::LockConflict { ref status, .. } = err {
            warn!(status = %status, "session busy, turn not started");
            return err;
        }

        warn!(code = err.code(), error = %err, "turn failed");
        let session_id = {
            let mut c = ctx.lock();
            c.queue.outbound.clear();
            c.push_event("error", format!("{}: {err}", err.code()));
            c.set_status(SessionStatus::Error);
            c.session_id.clone()
        };
        self.deps.announce(session_id, SessionStatus::Error);
        err
    }
}

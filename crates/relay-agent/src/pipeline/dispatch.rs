//! Turn dispatch: one running turn per session, everything else queued.
//!
//! `active` maps a session to the token of its running turn. The entry lock
//! on that map is the serialization point between `submit` (which enqueues
//! while an entry exists) and the run loop (which takes the next queued
//! message or releases the entry), so a message is never stranded.
//!
//! Between turns exactly one queued message moves into the session's inbound
//! list, so everything still waiting counts against the queue's capacity.

use std::sync::Arc;

use dashmap::mapref::entry::{Entry, OccupiedEntry};
use dashmap::DashMap;
use relay_core::{Notification, SessionId};
use relay_sessions::{InboundMessage, SessionError, SessionHandle, SessionStatus};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::cancel::TurnToken;
use crate::error::PipelineError;
use crate::pipeline::runner::MessagePipeline;

/// Reason recorded on tokens cancelled through [`TurnDispatcher::stop`].
pub const STOP_REASON: &str = "stopped by user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new turn was spawned for the message.
    Started,
    /// A turn is running; the message waits at `position` (1-based).
    Queued { position: usize },
    /// The queue is full and the message was dropped.
    Rejected { code: &'static str, reason: String },
}

#[derive(Clone)]
pub struct TurnDispatcher {
    pipeline: Arc<MessagePipeline>,
    active: Arc<DashMap<SessionId, TurnToken>>,
    /// Signalled whenever a session is released.
    released: Arc<Notify>,
}

impl TurnDispatcher {
    pub fn new(pipeline: Arc<MessagePipeline>) -> Self {
        Self {
            pipeline,
            active: Arc::new(DashMap::new()),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    /// Start a turn for `message`, or queue it behind the running one.
    pub fn submit(&self, session_id: &SessionId, message: InboundMessage) -> SubmitOutcome {
        let deps = self.pipeline.deps();

        match self.active.entry(session_id.clone()) {
            Entry::Occupied(_) => match deps.queue.enqueue(session_id, message.into()) {
                Ok(position) => SubmitOutcome::Queued { position },
                Err(e @ SessionError::QueueFull { .. }) => {
                    deps.sink.emit(Notification::SystemMessage {
                        session_id: session_id.clone(),
                        content: "Too many messages are waiting. This one was dropped.".to_string(),
                    });
                    SubmitOutcome::Rejected {
                        code: e.code(),
                        reason: e.to_string(),
                    }
                }
                Err(e) => SubmitOutcome::Rejected {
                    code: e.code(),
                    reason: e.to_string(),
                },
            },
            Entry::Vacant(slot) => {
                let handle = deps.store.get_or_create(session_id);
                {
                    let mut c = handle.lock();
                    if c.status == SessionStatus::Error {
                        warn!(session = %session_id, "recovering session from error state");
                        c.clear_turn_state();
                        c.queue.inbound.clear();
                        c.set_status(SessionStatus::Idle);
                    }
                    c.queue.inbound.push_back(message);
                }

                let token = TurnToken::new();
                slot.insert(token.clone());

                let this = self.clone();
                let session_id = session_id.clone();
                tokio::spawn(async move { this.run_session(session_id, handle, token).await });
                SubmitOutcome::Started
            }
        }
    }

    /// Cancel the running turn for a session. Queued messages are discarded
    /// by the failure path.
    pub fn stop(&self, session_id: &SessionId) -> bool {
        match self.active.get(session_id) {
            Some(token) => {
                info!(session = %session_id, "stopping turn");
                token.cancel(STOP_REASON);
                true
            }
            None => false,
        }
    }

    /// Emergency stop: cancel every running turn. Returns how many were hit.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for entry in self.active.iter() {
            entry.value().cancel(STOP_REASON);
            stopped += 1;
        }
        if stopped > 0 {
            warn!(stopped, "emergency stop: all turns cancelled");
        }
        stopped
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Resolves once no session has a running turn.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Registered before the check so a release in between is not missed.
            released.as_mut().enable();
            if self.active.is_empty() {
                return;
            }
            released.await;
        }
    }

    fn release(&self, slot: OccupiedEntry<'_, SessionId, TurnToken>) {
        slot.remove();
        self.released.notify_waiters();
    }

    /// Run turns until the session has nothing pending, then release it.
    async fn run_session(&self, session_id: SessionId, handle: SessionHandle, token: TurnToken) {
        let deps = Arc::clone(self.pipeline.deps());
        let mut token = token;

        loop {
            if let Err(e) = self.pipeline.execute(handle.clone(), &token).await {
                self.report_failure(&session_id, &e);
                if let Entry::Occupied(slot) = self.active.entry(session_id.clone()) {
                    deps.queue.clear(&session_id);
                    self.release(slot);
                }
                return;
            }

            match self.active.entry(session_id.clone()) {
                Entry::Occupied(mut slot) => {
                    let has_inbound = !handle.lock().queue.inbound.is_empty();
                    if !has_inbound {
                        let Some(next) = deps.queue.dequeue(&session_id) else {
                            self.release(slot);
                            return;
                        };
                        handle.lock().queue.inbound.push_back(next.into());
                    }
                    info!(
                        session = %session_id,
                        waiting = deps.queue.len(&session_id),
                        "starting turn for queued message"
                    );
                    token = TurnToken::new();
                    slot.insert(token.clone());
                }
                Entry::Vacant(_) => return,
            }
        }
    }

    /// The three-part failure sequence: halt, explanation, busy clear.
    fn report_failure(&self, session_id: &SessionId, err: &PipelineError) {
        let sink = &self.pipeline.deps().sink;
        sink.emit(Notification::TurnHalted {
            session_id: session_id.clone(),
            code: err.code().to_string(),
            reason: err.to_string(),
        });
        sink.emit(Notification::SystemMessage {
            session_id: session_id.clone(),
            content: err.user_message(),
        });
        sink.emit(Notification::BusyCleared {
            session_id: session_id.clone(),
        });
    }
}

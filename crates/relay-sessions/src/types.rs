use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use relay_core::{MessageId, SessionId};
use serde::{Deserialize, Serialize};

use crate::injection::NEW_ENTITY_KEY;

/// Lifecycle status of a session.
///
/// ```text
/// idle -> locked -> [context_injecting] -> streaming -> finalizing -> idle
///                 \___________________ any failure ___________________/-> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Locked,
    ContextInjecting,
    Streaming,
    Finalizing,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Locked => write!(f, "locked"),
            Self::ContextInjecting => write!(f, "context_injecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Finalizing => write!(f, "finalizing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The user message the active turn is working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentMessage {
    pub id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Which entity (document, record, ...) the user is editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingTarget {
    pub entity_type: String,
    /// `None` for an entity that has not been saved yet.
    pub entity_id: Option<String>,
}

/// Editing target plus whether its full context already went to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditingContext {
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub context_injected: bool,
}

impl EditingContext {
    pub fn new(target: EditingTarget) -> Self {
        Self {
            entity_type: target.entity_type,
            entity_id: target.entity_id,
            context_injected: false,
        }
    }

    /// Entity id, or the shared sentinel for unsaved entities.
    pub fn entity_key(&self) -> &str {
        self.entity_id.as_deref().unwrap_or(NEW_ENTITY_KEY)
    }

    pub fn targets(&self, target: &EditingTarget) -> bool {
        self.entity_type == target.entity_type && self.entity_id == target.entity_id
    }
}

/// A user message waiting to become the current message of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub editing: Option<EditingTarget>,
}

impl InboundMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            content: content.into(),
            created_at: Utc::now(),
            editing: None,
        }
    }

    pub fn with_editing(mut self, target: EditingTarget) -> Self {
        self.editing = Some(target);
        self
    }
}

/// An assistant response waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub context_usage: Option<ContextUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageQueues {
    pub inbound: VecDeque<InboundMessage>,
    pub outbound: Vec<OutboundMessage>,
}

/// Provider context window usage reported at the end of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub used: u64,
    pub total: u64,
    pub percent: f64,
}

impl ContextUsage {
    pub fn new(used: u64, total: u64) -> Self {
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 1000.0).round() / 10.0
        };
        Self {
            used,
            total,
            percent,
        }
    }
}

/// One entry of the diagnostic event ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// Full in-memory state of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub current_message: Option<CurrentMessage>,
    /// Provider continuity id. Sticky: the first captured value wins.
    pub continuity_id: Option<String>,
    pub editing_context: Option<EditingContext>,
    pub queue: MessageQueues,
    /// Bounded ring, oldest first.
    pub events: VecDeque<SessionEvent>,
    pub context_usage: Option<ContextUsage>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip)]
    max_events: usize,
}

impl SessionContext {
    pub fn new(session_id: SessionId, max_events: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            status: SessionStatus::Idle,
            current_message: None,
            continuity_id: None,
            editing_context: None,
            queue: MessageQueues::default(),
            events: VecDeque::new(),
            context_usage: None,
            created_at: now,
            last_activity_at: now,
            max_events: max_events.max(1),
        }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Append to the event ring, trimming the oldest entries past capacity.
    pub fn push_event(&mut self, kind: impl Into<String>, detail: impl Into<String>) {
        self.events.push_back(SessionEvent {
            at: Utc::now(),
            kind: kind.into(),
            detail: detail.into(),
        });
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    /// Move to `status`, recording the transition and bumping activity.
    pub fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            let detail = format!("{} -> {}", self.status, status);
            self.status = status;
            self.push_event("status", detail);
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Store the provider continuity id unless one is already set.
    /// Returns `true` when the id was newly captured.
    pub fn capture_continuity_id(&mut self, id: &str) -> bool {
        if self.continuity_id.is_some() || id.is_empty() {
            return false;
        }
        self.continuity_id = Some(id.to_string());
        true
    }

    /// Point the session at `target`. Switching entity resets the injected
    /// flag; re-targeting the same entity keeps it.
    pub fn retarget(&mut self, target: EditingTarget) {
        let same = self
            .editing_context
            .as_ref()
            .is_some_and(|ec| ec.targets(&target));
        if !same {
            self.editing_context = Some(EditingContext::new(target));
        }
    }

    /// Drop per-turn state. Editing context, injection flag and continuity
    /// id survive across turns.
    pub fn clear_turn_state(&mut self) {
        self.current_message = None;
        self.queue.outbound.clear();
    }
}

/// Shared, interior-mutable reference to a stored [`SessionContext`].
///
/// Cloning the handle clones the reference, not the context. The store hands
/// out handles and every stage mutates the same instance through them.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<Mutex<SessionContext>>);

impl SessionHandle {
    pub fn new(ctx: SessionContext) -> Self {
        Self(Arc::new(Mutex::new(ctx)))
    }

    /// Lock the context. A poisoned lock is recovered: the context holds
    /// plain data and stays usable after a panicking writer.
    pub fn lock(&self) -> MutexGuard<'_, SessionContext> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles point at the same context instance.
    pub fn ptr_eq(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Detached deep copy of the current state.
    pub fn snapshot(&self) -> SessionContext {
        self.lock().clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.lock().session_id.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }
}

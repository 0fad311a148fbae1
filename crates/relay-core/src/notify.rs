//! Outbound notification vocabulary.
//!
//! The pipeline only ever publishes on a [`NotificationSink`]; it never
//! subscribes. Emission is fire-and-forget and must not suspend the caller,
//! so the trait is synchronous. Sinks that need I/O push into a channel.

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, SessionId};

/// How much entity context was injected into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    Full,
}

/// Kind of tool activity forwarded from the provider stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Use,
    Progress,
    Result,
}

/// Every event the core publishes to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Entity context was fetched and prepended to the user's message.
    /// `content` is truncated for display.
    ContextInjected {
        session_id: SessionId,
        entity_type: String,
        entity_id: Option<String>,
        mode: InjectionMode,
        content: String,
    },
    /// A message arrived mid-turn and is waiting at `position` (1-based).
    MessageQueued {
        session_id: SessionId,
        message_id: MessageId,
        position: usize,
    },
    /// A waiting message left the queue; `remaining` are still waiting.
    MessageDequeued {
        session_id: SessionId,
        message_id: MessageId,
        remaining: usize,
    },
    /// The session moved to a new lifecycle status.
    SessionActivity { session_id: SessionId, status: String },
    /// The provider reported a continuity id for this conversation.
    SessionCaptured {
        session_id: SessionId,
        continuity_id: String,
    },
    /// One streamed text chunk.
    StreamDelta { session_id: SessionId, text: String },
    /// Full accumulated response so far (live preview).
    StreamUpdate { session_id: SessionId, content: String },
    Thinking { session_id: SessionId, text: String },
    ToolActivity {
        session_id: SessionId,
        phase: ToolPhase,
        name: Option<String>,
        detail: serde_json::Value,
        /// Upstream timestamp, forwarded so the UI can keep tool output ordered.
        timestamp: Option<String>,
    },
    /// First part of the failure sequence: the turn stopped.
    TurnHalted {
        session_id: SessionId,
        code: String,
        reason: String,
    },
    /// A system-authored message shown in the conversation.
    SystemMessage { session_id: SessionId, content: String },
    /// The busy indicator for the session must be cleared.
    BusyCleared { session_id: SessionId },
}

impl Notification {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Notification::ContextInjected { session_id, .. }
            | Notification::MessageQueued { session_id, .. }
            | Notification::MessageDequeued { session_id, .. }
            | Notification::SessionActivity { session_id, .. }
            | Notification::SessionCaptured { session_id, .. }
            | Notification::StreamDelta { session_id, .. }
            | Notification::StreamUpdate { session_id, .. }
            | Notification::Thinking { session_id, .. }
            | Notification::ToolActivity { session_id, .. }
            | Notification::TurnHalted { session_id, .. }
            | Notification::SystemMessage { session_id, .. }
            | Notification::BusyCleared { session_id } => session_id,
        }
    }

    /// Wire name of the variant (matches the serialized `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::ContextInjected { .. } => "context_injected",
            Notification::MessageQueued { .. } => "message_queued",
            Notification::MessageDequeued { .. } => "message_dequeued",
            Notification::SessionActivity { .. } => "session_activity",
            Notification::SessionCaptured { .. } => "session_captured",
            Notification::StreamDelta { .. } => "stream_delta",
            Notification::StreamUpdate { .. } => "stream_update",
            Notification::Thinking { .. } => "thinking",
            Notification::ToolActivity { .. } => "tool_activity",
            Notification::TurnHalted { .. } => "turn_halted",
            Notification::SystemMessage { .. } => "system_message",
            Notification::BusyCleared { .. } => "busy_cleared",
        }
    }
}

/// Emit-only notification channel.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Sink that discards everything. Useful for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn emit(&self, _notification: Notification) {}
}

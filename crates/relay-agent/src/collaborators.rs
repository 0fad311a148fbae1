//! Narrow interfaces the pipeline consumes, plus the default streamer that
//! drives a [`StreamProcessor`] over a provider [`EventSource`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use relay_core::notify::ToolPhase;
use relay_core::{MessageId, Notification, NotificationSink, SessionId};
use relay_sessions::{
    ActivityCallback, ContextUsage, EditingContext, OutboundMessage, SessionHandle,
};

use crate::cancel::TurnToken;
use crate::error::Result;
use crate::processor::{StreamHooks, StreamProcessor};
use crate::stream::{ProviderEvent, ResultEvent};

/// Context window size used to report usage percentages.
pub const CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Fetches the full text of the entity being edited.
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build_full_context(&self, editing: &EditingContext, user_text: &str)
        -> Result<String>;
}

/// Everything the streamer needs to know about the turn.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub content: String,
    /// Resume the provider conversation when set.
    pub continuity_id: Option<String>,
    /// Live context of the session. When present, a provider session id is
    /// stored on it the moment it is announced, before later events run.
    pub context: Option<SessionHandle>,
}

#[derive(Debug, Clone)]
pub struct StreamedResponse {
    pub message_id: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub context_usage: Option<ContextUsage>,
    pub continuity_id: Option<String>,
    pub cost: Option<f64>,
    pub aborted: bool,
}

impl StreamedResponse {
    pub fn into_outbound(self) -> OutboundMessage {
        OutboundMessage {
            message_id: self.message_id,
            content: self.content,
            created_at: self.created_at,
            context_usage: self.context_usage,
        }
    }
}

/// Produces the assistant response for one turn.
///
/// `on_activity` must be called for every sign of provider life; it keeps
/// the idle window open.
#[async_trait]
pub trait ResponseStreamer: Send + Sync {
    async fn stream_response(
        &self,
        request: StreamRequest,
        token: &TurnToken,
        on_activity: ActivityCallback,
    ) -> Result<StreamedResponse>;
}

/// Hands finished responses to whoever shows them to the user.
#[async_trait]
pub trait OutboundDelivery: Send + Sync {
    async fn deliver(&self, session_id: &SessionId, messages: Vec<OutboundMessage>) -> Result<()>;
}

/// Opens a provider event stream for a request.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(
        &self,
        request: &StreamRequest,
        token: &TurnToken,
    ) -> Result<BoxStream<'static, ProviderEvent>>;
}

/// Hooks that publish stream progress on the notification sink.
struct NotifyingHooks {
    session_id: SessionId,
    context: Option<SessionHandle>,
    sink: Arc<dyn NotificationSink>,
}

#[async_trait]
impl StreamHooks for NotifyingHooks {
    fn on_chunk(&self, text: &str) {
        self.sink.emit(Notification::StreamDelta {
            session_id: self.session_id.clone(),
            text: text.to_string(),
        });
    }

    fn on_update(&self, content: &str) {
        self.sink.emit(Notification::StreamUpdate {
            session_id: self.session_id.clone(),
            content: content.to_string(),
        });
    }

    async fn on_session_captured(&self, continuity_id: &str) {
        if let Some(ref ctx) = self.context {
            let mut c = ctx.lock();
            if c.capture_continuity_id(continuity_id) {
                c.push_event("continuity", continuity_id.to_string());
            }
        }
        self.sink.emit(Notification::SessionCaptured {
            session_id: self.session_id.clone(),
            continuity_id: continuity_id.to_string(),
        });
    }

    fn on_thinking(&self, text: &str) {
        self.sink.emit(Notification::Thinking {
            session_id: self.session_id.clone(),
            text: text.to_string(),
        });
    }

    fn on_tool_use(&self, id: &str, name: &str, input: &serde_json::Value) {
        self.sink.emit(Notification::ToolActivity {
            session_id: self.session_id.clone(),
            phase: ToolPhase::Use,
            name: Some(name.to_string()),
            detail: serde_json::json!({ "id": id, "input": input }),
            timestamp: None,
        });
    }

    fn on_tool_progress(&self, name: Option<&str>, detail: &serde_json::Value) {
        self.sink.emit(Notification::ToolActivity {
            session_id: self.session_id.clone(),
            phase: ToolPhase::Progress,
            name: name.map(str::to_string),
            detail: detail.clone(),
            timestamp: None,
        });
    }

    fn on_tool_result(
        &self,
        tool_use_id: &str,
        content: &serde_json::Value,
        is_error: bool,
        timestamp: Option<&str>,
    ) {
        self.sink.emit(Notification::ToolActivity {
            session_id: self.session_id.clone(),
            phase: ToolPhase::Result,
            name: None,
            detail: serde_json::json!({
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            timestamp: timestamp.map(str::to_string),
        });
    }

    async fn on_result(&self, result: &ResultEvent, _content: &str) {
        tracing::debug!(
            session = %self.session_id,
            cost = result.cost(),
            duration_ms = result.duration_ms,
            turns = result.num_turns,
            "provider result"
        );
    }
}

/// Default [`ResponseStreamer`]: opens an event source and runs the stream
/// processor over it, publishing live progress on the sink.
pub struct ProcessorStreamer {
    source: Arc<dyn EventSource>,
    processor: StreamProcessor,
    sink: Arc<dyn NotificationSink>,
}

impl ProcessorStreamer {
    pub fn new(
        source: Arc<dyn EventSource>,
        processor: StreamProcessor,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            source,
            processor,
            sink,
        }
    }
}

#[async_trait]
impl ResponseStreamer for ProcessorStreamer {
    async fn stream_response(
        &self,
        request: StreamRequest,
        token: &TurnToken,
        on_activity: ActivityCallback,
    ) -> Result<StreamedResponse> {
        let events = self.source.open(&request, token).await?;
        let hooks = NotifyingHooks {
            session_id: request.session_id.clone(),
            context: request.context.clone(),
            sink: Arc::clone(&self.sink),
        };
        let activity = move || on_activity();
        let outcome = self
            .processor
            .process(events, &hooks, token, &activity)
            .await?;

        Ok(StreamedResponse {
            message_id: MessageId::new(),
            content: outcome.content,
            created_at: Utc::now(),
            context_usage: outcome
                .usage
                .map(|u| ContextUsage::new(u.context_tokens(), CONTEXT_WINDOW_TOKENS)),
            continuity_id: outcome.continuity_id,
            cost: outcome.cost,
            aborted: outcome.aborted,
        })
    }
}

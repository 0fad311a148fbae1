use std::sync::Arc;

use async_trait::async_trait;
use relay_agent::collaborators::{ContextBuilder, OutboundDelivery};
use relay_agent::{
    ClaudeCliSource, MessagePipeline, PipelineDeps, PipelineError, ProcessorStreamer,
    StreamProcessor, TurnDispatcher,
};
use relay_core::config::RelayConfig;
use relay_core::SessionId;
use relay_sessions::{
    ContextInjectionState, EditingContext, OutboundMessage, SessionContextStore, TaskMessageQueue,
};
use serde::Serialize;

use crate::broadcast::EventBroadcaster;

/// Central shared state, passed as `Arc<AppState>` to the input loop and
/// command handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub broadcaster: Arc<EventBroadcaster>,
    pub store: Arc<SessionContextStore>,
    pub dispatcher: TurnDispatcher,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let store = Arc::new(SessionContextStore::from_config(&config.sessions));
        let queue = Arc::new(TaskMessageQueue::with_capacity(
            broadcaster.clone(),
            config.sessions.queue_capacity,
        ));

        let source = Arc::new(ClaudeCliSource::from_config(&config.provider));
        let streamer = Arc::new(ProcessorStreamer::new(
            source,
            StreamProcessor::new(config.pipeline.capture_result_text),
            broadcaster.clone(),
        ));

        let deps = Arc::new(PipelineDeps {
            store: Arc::clone(&store),
            injection: Arc::new(ContextInjectionState::new()),
            queue,
            context_builder: Arc::new(FileContextBuilder),
            streamer,
            delivery: Arc::new(BroadcastDelivery {
                broadcaster: Arc::clone(&broadcaster),
            }),
            sink: broadcaster.clone(),
            config: config.pipeline.clone(),
        });
        let dispatcher = TurnDispatcher::new(Arc::new(MessagePipeline::new(deps)));

        Self {
            config,
            broadcaster,
            store,
            dispatcher,
        }
    }
}

/// Finished assistant response, as written to the event stream.
#[derive(Serialize)]
#[serde(tag = "type", rename = "response")]
struct ResponseEvent<'a> {
    session_id: &'a SessionId,
    #[serde(flatten)]
    message: &'a OutboundMessage,
}

/// Delivers finished responses onto the event stream.
struct BroadcastDelivery {
    broadcaster: Arc<EventBroadcaster>,
}

#[async_trait]
impl OutboundDelivery for BroadcastDelivery {
    async fn deliver(
        &self,
        session_id: &SessionId,
        messages: Vec<OutboundMessage>,
    ) -> relay_agent::Result<()> {
        for message in &messages {
            self.broadcaster.send(&ResponseEvent {
                session_id,
                message,
            });
        }
        Ok(())
    }
}

/// Builds entity context from the local filesystem: the entity id is a path.
/// Unsaved entities (no id) contribute only their type.
struct FileContextBuilder;

#[async_trait]
impl ContextBuilder for FileContextBuilder {
    async fn build_full_context(
        &self,
        editing: &EditingContext,
        user_text: &str,
    ) -> relay_agent::Result<String> {
        let Some(path) = editing.entity_id.as_deref() else {
            return Ok(format!(
                "You are creating a new {}.\n\n{user_text}",
                editing.entity_type
            ));
        };
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::ContextFetch(format!("{path}: {e}")))?;
        Ok(format!(
            "You are editing the {} at `{path}`. Current content:\n```\n{body}\n```\n\n{user_text}",
            editing.entity_type
        ))
    }
}

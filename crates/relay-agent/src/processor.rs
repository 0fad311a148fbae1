//! Provider stream consumption.
//!
//! `StreamProcessor` walks an ordered provider event stream, accumulates the
//! response text and fans each event out to a [`StreamHooks`] implementation.
//! Consumers implement only the hooks they care about; the rest are no-ops.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::cancel::TurnToken;
use crate::error::{PipelineError, Result};
use crate::stream::{ProviderEvent, ResultEvent, Usage};

/// Optional callbacks, one per event kind.
///
/// `on_session_captured` and `on_result` are awaited before the next event is
/// consumed. Everything else is fire-and-forget and must not block.
#[async_trait]
pub trait StreamHooks: Send + Sync {
    fn on_chunk(&self, _text: &str) {}

    /// Full accumulated content after it changed.
    fn on_update(&self, _content: &str) {}

    async fn on_session_captured(&self, _continuity_id: &str) {}

    fn on_thinking(&self, _text: &str) {}

    fn on_tool_use(&self, _id: &str, _name: &str, _input: &serde_json::Value) {}

    fn on_tool_progress(&self, _name: Option<&str>, _detail: &serde_json::Value) {}

    fn on_tool_result(
        &self,
        _tool_use_id: &str,
        _content: &serde_json::Value,
        _is_error: bool,
        _timestamp: Option<&str>,
    ) {
    }

    /// Result event merged with the content accumulated so far.
    async fn on_result(&self, _result: &ResultEvent, _content: &str) {}

    fn on_complete(&self) {}

    fn on_error(&self, _message: &str) {}

    /// Called once after the loop when content was produced and the run was
    /// not aborted.
    fn on_final_content(&self, _content: &str) {}
}

/// Hook set that ignores everything.
pub struct NoHooks;

impl StreamHooks for NoHooks {}

/// What one provider run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub content: String,
    pub continuity_id: Option<String>,
    pub cost: Option<f64>,
    pub usage: Option<Usage>,
    /// The turn token was cancelled mid-stream.
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamProcessor {
    capture_result_text: bool,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self {
            capture_result_text: true,
        }
    }
}

impl StreamProcessor {
    pub fn new(capture_result_text: bool) -> Self {
        Self {
            capture_result_text,
        }
    }

    /// Consume `events` until the stream ends, the token is cancelled, or an
    /// error event arrives.
    ///
    /// Cancellation is not an error: the outcome comes back with
    /// `aborted = true`. An error event always fails the run, even when more
    /// events are queued behind it.
    pub async fn process<S>(
        &self,
        events: S,
        hooks: &dyn StreamHooks,
        token: &TurnToken,
        on_activity: &(dyn Fn() + Send + Sync),
    ) -> Result<StreamOutcome>
    where
        S: Stream<Item = ProviderEvent> + Send,
    {
        futures_util::pin_mut!(events);
        let mut out = StreamOutcome::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                ev = events.next() => Some(ev),
            };
            let event = match next {
                None => {
                    out.aborted = true;
                    break;
                }
                Some(None) => break,
                Some(Some(ev)) => ev,
            };
            if token.is_cancelled() {
                out.aborted = true;
                break;
            }

            on_activity();

            match event {
                ProviderEvent::MessageChunk { text } => {
                    append_chunk(&mut out.content, &text);
                    hooks.on_chunk(&text);
                    hooks.on_update(&out.content);
                }
                ProviderEvent::SessionInit { session_id } => {
                    if out.continuity_id.is_none() && !session_id.is_empty() {
                        debug!(continuity_id = %session_id, "provider session captured");
                        out.continuity_id = Some(session_id.clone());
                        hooks.on_session_captured(&session_id).await;
                    }
                }
                ProviderEvent::Thinking { text } => hooks.on_thinking(&text),
                ProviderEvent::ToolUse { id, name, input } => hooks.on_tool_use(&id, &name, &input),
                ProviderEvent::ToolProgress { name, detail } => {
                    hooks.on_tool_progress(name.as_deref(), &detail)
                }
                ProviderEvent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                    timestamp,
                } => hooks.on_tool_result(&tool_use_id, &content, is_error, timestamp.as_deref()),
                ProviderEvent::Result(result) => {
                    if let Some(cost) = result.cost() {
                        out.cost = Some(cost);
                    }
                    if result.usage.is_some() {
                        out.usage = result.usage;
                    }
                    if self.capture_result_text {
                        if let Some(text) = result.result.as_deref() {
                            if append_result_text(&mut out.content, text) {
                                hooks.on_update(&out.content);
                            }
                        }
                    }
                    hooks.on_result(&result, &out.content).await;
                }
                ProviderEvent::Complete => hooks.on_complete(),
                ProviderEvent::Error { message } => {
                    warn!(error = %message, "provider stream error");
                    hooks.on_error(&message);
                    return Err(PipelineError::Provider(message));
                }
            }
        }

        if out.aborted {
            debug!(reason = token.reason().unwrap_or(""), "stream aborted");
        } else if !out.content.is_empty() {
            hooks.on_final_content(&out.content);
        }
        Ok(out)
    }
}

/// Append a chunk, keeping adjacent chunks from fusing into one token.
fn append_chunk(acc: &mut String, text: &str) {
    if !acc.is_empty() && !acc.ends_with(char::is_whitespace) {
        acc.push(' ');
    }
    acc.push_str(text);
}

/// Append trailing result text unless the accumulator already contains it.
/// Returns whether anything changed.
fn append_result_text(acc: &mut String, text: &str) -> bool {
    if text.trim().is_empty() || acc.contains(text) {
        return false;
    }
    if !acc.is_empty() {
        acc.push('\n');
    }
    acc.push_str(text);
    true
}

//! Console input: chat messages and slash commands, one per line.

use relay_core::SessionId;
use relay_sessions::{EditingTarget, InboundMessage};
use serde::Deserialize;

use crate::app::AppState;
use crate::stop::execute_stop;

/// JSON form of an input line, for callers that need a session or an
/// editing target. Plain text lines go to the default session.
#[derive(Debug, Deserialize)]
struct WireMessage {
    session_id: Option<String>,
    content: String,
    editing: Option<EditingTarget>,
}

#[derive(Debug)]
pub enum Input {
    Message {
        session_id: SessionId,
        message: InboundMessage,
    },
    Stop(Option<SessionId>),
    Dump(SessionId),
    Bad,
    Sessions,
    Empty,
}

/// Parse one input line. JSON lines must match the message shape.
pub fn parse_line(line: &str, default_session: &SessionId) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }

    if let Some(rest) = line.strip_prefix('/') {
        let mut parts = rest.split_whitespace();
        let cmd = parts.next().unwrap_or_default();
        let arg = parts.next().map(SessionId::from);
        return match cmd {
            "stop" => Ok(Input::Stop(arg)),
            "dump" => Ok(Input::Dump(arg.unwrap_or_else(|| default_session.clone()))),
            "bad" => Ok(Input::Bad),
            "sessions" => Ok(Input::Sessions),
            other => Err(format!("unknown command: /{other}")),
        };
    }

    if line.starts_with('{') {
        let wire: WireMessage =
            serde_json::from_str(line).map_err(|e| format!("invalid message JSON: {e}"))?;
        let mut message = InboundMessage::new(wire.content);
        if let Some(target) = wire.editing {
            message = message.with_editing(target);
        }
        return Ok(Input::Message {
            session_id: wire
                .session_id
                .map(SessionId::from)
                .unwrap_or_else(|| default_session.clone()),
            message,
        });
    }

    Ok(Input::Message {
        session_id: default_session.clone(),
        message: InboundMessage::new(line),
    })
}

/// Run a diagnostic command and return its report.
pub fn run_command(app: &AppState, input: &Input) -> Option<String> {
    match input {
        Input::Stop(target) => Some(execute_stop(app, target.as_ref())),
        Input::Dump(session_id) => Some(
            app.store
                .dump_session(session_id)
                .unwrap_or_else(|| format!("Unknown session `{session_id}`")),
        ),
        Input::Bad => {
            let bad = app.store.bad_sessions();
            if bad.is_empty() {
                return Some("No stuck or failed sessions".to_string());
            }
            let lines: Vec<String> = bad
                .iter()
                .map(|h| {
                    let c = h.lock();
                    format!(
                        "- `{}` status={} last_activity={}",
                        c.session_id,
                        c.status,
                        c.last_activity_at.to_rfc3339()
                    )
                })
                .collect();
            Some(lines.join("\n"))
        }
        Input::Sessions => {
            let ids = app.store.session_ids();
            if ids.is_empty() {
                return Some("No sessions".to_string());
            }
            Some(
                ids.iter()
                    .map(|id| {
                        let active = if app.dispatcher.is_active(id) { " (active)" } else { "" };
                        format!("- `{id}`{active}")
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
        Input::Message { .. } | Input::Empty => None,
    }
}

use std::process::Stdio;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use relay_core::config::ProviderConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use crate::cancel::TurnToken;
use crate::collaborators::{EventSource, StreamRequest};
use crate::error::{PipelineError, Result};
use crate::stream::{ProviderEvent, ResultEvent};

/// Longest stdout line accepted from the CLI (tool results can be large).
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Event source backed by the Claude Code CLI in streaming JSON mode.
///
/// Each turn spawns `claude -p --output-format stream-json --verbose`,
/// resuming the provider conversation when the session already has a
/// continuity id. The child is killed when the turn token is cancelled or
/// the event stream is dropped.
pub struct ClaudeCliSource {
    command: String,
    model: Option<String>,
    /// Tools allowed in pipe mode. Empty = no `--allowedTools` flag.
    allowed_tools: Vec<String>,
    extra_args: Vec<String>,
}

impl ClaudeCliSource {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            model: cfg.model.clone(),
            allowed_tools: cfg.allowed_tools.clone(),
            extra_args: cfg.extra_args.clone(),
        }
    }

    fn build_command(&self, request: &StreamRequest) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(ref id) = request.continuity_id {
            cmd.arg("--resume").arg(id);
        }
        if let Some(ref model) = self.model {
            cmd.arg("--model").arg(model);
        }

        // Allow tools in pipe mode (without this, sandbox blocks Bash, etc.).
        if !self.allowed_tools.is_empty() {
            if self.allowed_tools.len() == 1 && self.allowed_tools[0] == "*" {
                cmd.arg("--dangerously-skip-permissions");
            } else {
                for tool in &self.allowed_tools {
                    cmd.arg("--allowedTools").arg(tool);
                }
            }
        }
        cmd.args(&self.extra_args);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl EventSource for ClaudeCliSource {
    async fn open(
        &self,
        request: &StreamRequest,
        token: &TurnToken,
    ) -> Result<BoxStream<'static, ProviderEvent>> {
        debug!(
            command = %self.command,
            session = %request.session_id,
            resume = request.continuity_id.is_some(),
            prompt_len = request.content.len(),
            "spawning claude CLI"
        );

        let mut child = self.build_command(request).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::Provider(format!(
                    "claude CLI not found at '{}', install Claude Code first",
                    self.command
                ))
            } else {
                PipelineError::Provider(format!("failed to spawn claude CLI: {e}"))
            }
        })?;

        // Write prompt to stdin, then close it.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.content.as_bytes())
                .await
                .map_err(|e| PipelineError::Provider(format!("failed to write to claude stdin: {e}")))?;
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Provider("claude CLI stdout not captured".into()))?;

        // Drain stderr concurrently so a chatty child never blocks on a full pipe.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let token = token.clone();
        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        let stream = async_stream::stream! {
            let mut failed = false;
            loop {
                let line = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(reason = token.reason().unwrap_or(""), "killing claude CLI");
                        let _ = child.kill().await;
                        return;
                    }
                    line = lines.next() => line,
                };
                match line {
                    Some(Ok(line)) => {
                        for event in parse_stream_line(&line) {
                            failed |= matches!(event, ProviderEvent::Error { .. });
                            yield event;
                        }
                    }
                    Some(Err(e)) => {
                        yield ProviderEvent::Error { message: format!("claude CLI output error: {e}") };
                        return;
                    }
                    None => break,
                }
            }

            let status = child.wait().await;
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            match status {
                Ok(s) if s.success() => {
                    if !failed {
                        yield ProviderEvent::Complete;
                    }
                }
                Ok(s) => {
                    let code = s.code().unwrap_or(1);
                    warn!(code, stderr = %stderr.trim(), "claude CLI exited with failure");
                    if !failed {
                        yield ProviderEvent::Error {
                            message: format!("claude CLI exited with code {code}: {}", stderr.trim()),
                        };
                    }
                }
                Err(e) => {
                    yield ProviderEvent::Error { message: format!("claude CLI process error: {e}") };
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Parse one line of `--output-format stream-json` output.
///
/// Unknown or malformed lines yield nothing. One assistant line can carry
/// several content blocks, hence the `Vec`.
pub fn parse_stream_line(line: &str) -> Vec<ProviderEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let json: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping non-JSON claude CLI line");
            return Vec::new();
        }
    };

    let kind = json["type"].as_str().unwrap_or_default().to_string();
    match kind.as_str() {
        "system" if json["subtype"] == "init" => json["session_id"]
            .as_str()
            .map(|id| {
                vec![ProviderEvent::SessionInit {
                    session_id: id.to_string(),
                }]
            })
            .unwrap_or_default(),
        "assistant" => content_blocks(&json)
            .filter_map(|block| match block["type"].as_str()? {
                "text" => Some(ProviderEvent::MessageChunk {
                    text: block["text"].as_str()?.to_string(),
                }),
                "thinking" => Some(ProviderEvent::Thinking {
                    text: block["thinking"].as_str()?.to_string(),
                }),
                "tool_use" => Some(ProviderEvent::ToolUse {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    input: block["input"].clone(),
                }),
                _ => None,
            })
            .collect(),
        "user" => {
            let timestamp = json["timestamp"].as_str().map(str::to_string);
            content_blocks(&json)
                .filter(|block| block["type"] == "tool_result")
                .map(|block| ProviderEvent::ToolResult {
                    tool_use_id: block["tool_use_id"].as_str().unwrap_or_default().to_string(),
                    content: block["content"].clone(),
                    is_error: block["is_error"].as_bool().unwrap_or(false),
                    timestamp: timestamp.clone(),
                })
                .collect()
        }
        "tool_progress" => vec![ProviderEvent::ToolProgress {
            name: json["tool_name"].as_str().map(str::to_string),
            detail: json,
        }],
        "result" => {
            let result: ResultEvent = serde_json::from_value(json).unwrap_or_default();
            let mut events = Vec::with_capacity(2);
            if result.is_error {
                let message = result
                    .result
                    .clone()
                    .unwrap_or_else(|| "claude CLI reported an error".to_string());
                events.push(ProviderEvent::Result(result));
                events.push(ProviderEvent::Error { message });
            } else {
                events.push(ProviderEvent::Result(result));
            }
            events
        }
        _ => Vec::new(),
    }
}

fn content_blocks(json: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
    json["message"]["content"]
        .as_array()
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

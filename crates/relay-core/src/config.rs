use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Pipeline stage bounds (absolute wall-clock, measured from stage entry).
pub const DEFAULT_ACQUIRE_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CHECK_CONTEXT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INJECT_CONTEXT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_FINALIZE_TIMEOUT_MS: u64 = 10_000;
/// Rolling no-activity window for the streaming stage.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

pub const DEFAULT_MAX_EVENTS: usize = 100;
pub const DEFAULT_STUCK_AFTER_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Top-level config (relay.toml + RELAY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Per-stage timeouts and streaming behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_acquire_lock_timeout_ms")]
    pub acquire_lock_timeout_ms: u64,
    #[serde(default = "default_check_context_timeout_ms")]
    pub check_context_timeout_ms: u64,
    #[serde(default = "default_inject_context_timeout_ms")]
    pub inject_context_timeout_ms: u64,
    #[serde(default = "default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Append trailing result-event text (sub-agent output) to the response.
    #[serde(default = "bool_true")]
    pub capture_result_text: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            acquire_lock_timeout_ms: DEFAULT_ACQUIRE_LOCK_TIMEOUT_MS,
            check_context_timeout_ms: DEFAULT_CHECK_CONTEXT_TIMEOUT_MS,
            inject_context_timeout_ms: DEFAULT_INJECT_CONTEXT_TIMEOUT_MS,
            stream_timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            finalize_timeout_ms: DEFAULT_FINALIZE_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            capture_result_text: true,
        }
    }
}

impl PipelineConfig {
    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// In-memory session registry limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Size of the per-session event ring.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Non-idle sessions quiet for longer than this are reported as stuck.
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
    /// Messages that may wait behind an active turn, per session.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            stuck_after_secs: DEFAULT_STUCK_AFTER_SECS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Streaming provider process settings (Claude Code CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_command")]
    pub command: String,
    /// Model override passed as `--model`. Falls back to the CLI default.
    pub model: Option<String>,
    /// Tools allowed in pipe mode. `["*"]` skips permission checks entirely.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            model: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_acquire_lock_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_LOCK_TIMEOUT_MS
}
fn default_check_context_timeout_ms() -> u64 {
    DEFAULT_CHECK_CONTEXT_TIMEOUT_MS
}
fn default_inject_context_timeout_ms() -> u64 {
    DEFAULT_INJECT_CONTEXT_TIMEOUT_MS
}
fn default_stream_timeout_ms() -> u64 {
    DEFAULT_STREAM_TIMEOUT_MS
}
fn default_finalize_timeout_ms() -> u64 {
    DEFAULT_FINALIZE_TIMEOUT_MS
}
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}
fn default_max_events() -> usize {
    DEFAULT_MAX_EVENTS
}
fn default_stuck_after_secs() -> u64 {
    DEFAULT_STUCK_AFTER_SECS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_command() -> String {
    "claude".to_string()
}

impl RelayConfig {
    /// Load config from a TOML file with RELAY_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.relay/relay.toml
    ///
    /// A missing file is not an error; every field has a default.
    /// Nested keys use a double underscore: `RELAY_PIPELINE__IDLE_TIMEOUT_MS=90000`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stage_bounds() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.pipeline.check_context_timeout_ms, 5_000);
        assert_eq!(cfg.pipeline.inject_context_timeout_ms, 10_000);
        assert_eq!(cfg.pipeline.stream_timeout_ms, 300_000);
        assert_eq!(cfg.sessions.queue_capacity, 10);
        assert_eq!(cfg.sessions.stuck_after_secs, 300);
        assert!(cfg.pipeline.capture_result_text);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: RelayConfig = Figment::new()
            .merge(Toml::string(
                "[pipeline]\nidle_timeout_ms = 1500\n[provider]\ncommand = \"/opt/claude\"\n",
            ))
            .extract()
            .expect("extract failed");
        assert_eq!(cfg.pipeline.idle_timeout_ms, 1_500);
        assert_eq!(cfg.pipeline.idle_window(), Duration::from_millis(1_500));
        assert_eq!(cfg.pipeline.stream_timeout_ms, DEFAULT_STREAM_TIMEOUT_MS);
        assert_eq!(cfg.provider.command, "/opt/claude");
        assert_eq!(cfg.sessions.max_events, DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let cfg = RelayConfig::load(Some("/nonexistent/relay.toml")).expect("load failed");
        assert_eq!(cfg.provider.command, "claude");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let path = std::env::temp_dir().join(format!("relay-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[pipeline\nidle_timeout_ms = ").expect("write failed");
        let err = RelayConfig::load(path.to_str()).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}

use serde::{Deserialize, Serialize};

/// Token usage reported on a provider result event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Tokens occupying the context window for this turn.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// Final summary event of a provider run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Trailing result text. Sub-agent output only ever shows up here.
    pub result: Option<String>,
    /// Cost of the run in USD.
    pub total_cost_usd: Option<f64>,
    /// Older providers report the cost under this name instead.
    pub cost_usd: Option<f64>,
    pub usage: Option<Usage>,
    #[serde(default)]
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl ResultEvent {
    /// Event-specific cost, falling back to the legacy field.
    pub fn cost(&self) -> Option<f64> {
        self.total_cost_usd.or(self.cost_usd)
    }
}

/// One event of the ordered provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Incremental assistant text.
    MessageChunk { text: String },

    /// The provider announced the conversation's continuity id.
    SessionInit { session_id: String },

    /// Internal reasoning text.
    Thinking { text: String },

    /// The model started a tool call.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Intermediate output of a running tool.
    ToolProgress {
        name: Option<String>,
        detail: serde_json::Value,
    },

    /// A tool call finished.
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        is_error: bool,
        /// Upstream timestamp, when the provider reports one.
        timestamp: Option<String>,
    },

    /// Run summary: cost, usage, trailing text.
    Result(ResultEvent),

    /// The provider finished cleanly.
    Complete,

    /// The provider failed. Always fatal.
    Error { message: String },
}

impl ProviderEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::MessageChunk { .. } => "message_chunk",
            ProviderEvent::SessionInit { .. } => "session_init",
            ProviderEvent::Thinking { .. } => "thinking",
            ProviderEvent::ToolUse { .. } => "tool_use",
            ProviderEvent::ToolProgress { .. } => "tool_progress",
            ProviderEvent::ToolResult { .. } => "tool_result",
            ProviderEvent::Result(_) => "result",
            ProviderEvent::Complete => "complete",
            ProviderEvent::Error { .. } => "error",
        }
    }
}

//! relay-agent: the per-session turn pipeline, provider streaming and
//! cancellation.

pub mod cancel;
pub mod claude_cli;
pub mod collaborators;
pub mod error;
pub mod idle;
pub mod pipeline;
pub mod processor;
pub mod stream;

pub use cancel::TurnToken;
pub use claude_cli::ClaudeCliSource;
pub use collaborators::{
    ContextBuilder, EventSource, OutboundDelivery, ProcessorStreamer, ResponseStreamer,
    StreamRequest, StreamedResponse,
};
pub use error::{PipelineError, Result};
pub use idle::IdleTimeout;
pub use pipeline::{MessagePipeline, PipelineDeps, Stage, SubmitOutcome, TurnDispatcher};
pub use processor::{StreamHooks, StreamOutcome, StreamProcessor};
pub use stream::ProviderEvent;

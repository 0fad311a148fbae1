//! Per-session turn pipeline.
//!
//! A turn runs five stages in fixed order against one stored session
//! context: acquire lock, check context injection, inject context, stream
//! response, finalize. [`MessagePipeline`] runs them; [`TurnDispatcher`]
//! serializes turns per session and queues messages that arrive mid-turn.

pub mod dispatch;
pub mod runner;
pub mod stage;
pub mod stages;

pub use dispatch::{SubmitOutcome, TurnDispatcher, STOP_REASON};
pub use runner::MessagePipeline;
pub use stage::{PipelineDeps, Stage};

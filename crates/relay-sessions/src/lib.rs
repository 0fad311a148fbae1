//! relay-sessions: in-memory session registry and per-session side tables.
//!
//! Everything here is process-local. A [`SessionContextStore`] is created by
//! the host and passed to whoever needs it; there is no global instance.

pub mod error;
pub mod injection;
pub mod queue;
pub mod store;
pub mod types;

pub use error::{Result, SessionError};
pub use injection::{ContextInjectionState, NEW_ENTITY_KEY};
pub use queue::{ActivityCallback, QueuedTaskMessage, TaskMessageQueue};
pub use store::SessionContextStore;
pub use types::{
    ContextUsage, CurrentMessage, EditingContext, EditingTarget, InboundMessage, MessageQueues,
    OutboundMessage, SessionContext, SessionEvent, SessionHandle, SessionStatus,
};

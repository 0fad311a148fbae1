//! relay-core: shared configuration, identifiers and the notification
//! vocabulary used by every other relay crate.

pub mod config;
pub mod error;
pub mod notify;
pub mod truncate;
pub mod types;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use notify::{Notification, NotificationSink, NullSink};
pub use types::{MessageId, SessionId};

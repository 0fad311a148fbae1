use std::sync::atomic::{AtomicU64, Ordering};

use relay_core::{Notification, NotificationSink};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

const BROADCAST_CAPACITY: usize = 256;

/// One line of the outbound event stream.
#[derive(Debug, Serialize)]
pub struct EventFrame<'a, T: Serialize> {
    pub seq: u64,
    #[serde(flatten)]
    pub event: &'a T,
}

/// Fan-out of JSON event lines to every subscriber (the console printer,
/// tests). Doubles as the pipeline's notification sink.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
    seq: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Serialize `event` with the next sequence number and push it out.
    /// Silently drops if no subscribers exist.
    pub fn send<T: Serialize>(&self, event: &T) {
        let frame = EventFrame {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };
        match serde_json::to_string(&frame) {
            Ok(line) => {
                let _ = self.tx.send(line);
            }
            Err(e) => warn!(error = %e, "failed to serialize event"),
        }
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for EventBroadcaster {
    fn emit(&self, notification: Notification) {
        self.send(&notification);
    }
}

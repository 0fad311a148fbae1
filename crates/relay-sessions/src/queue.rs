//! `TaskMessageQueue`: bounded FIFO of messages that arrive while a turn
//! is already running for their session.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::config::DEFAULT_QUEUE_CAPACITY;
use relay_core::{MessageId, Notification, NotificationSink, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::types::{EditingTarget, InboundMessage};

/// Called on every successful enqueue. The streaming stage registers one that
/// resets its idle window: a user typing counts as activity.
pub type ActivityCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTaskMessage {
    pub content: String,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub editing: Option<EditingTarget>,
}

impl From<InboundMessage> for QueuedTaskMessage {
    fn from(m: InboundMessage) -> Self {
        Self {
            content: m.content,
            message_id: m.message_id,
            timestamp: m.created_at,
            editing: m.editing,
        }
    }
}

impl From<QueuedTaskMessage> for InboundMessage {
    fn from(m: QueuedTaskMessage) -> Self {
        Self {
            message_id: m.message_id,
            content: m.content,
            created_at: m.timestamp,
            editing: m.editing,
        }
    }
}

pub struct TaskMessageQueue {
    queues: DashMap<SessionId, VecDeque<QueuedTaskMessage>>,
    callbacks: DashMap<SessionId, ActivityCallback>,
    capacity: usize,
    sink: Arc<dyn NotificationSink>,
}

impl TaskMessageQueue {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            callbacks: DashMap::new(),
            capacity,
            sink,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `message` to the session's queue and return its 1-based position.
    ///
    /// At capacity the message is dropped, the queue is left untouched and
    /// `QueueFull` is returned.
    pub fn enqueue(&self, session_id: &SessionId, message: QueuedTaskMessage) -> Result<usize> {
        let message_id = message.message_id.clone();
        let position = {
            let mut queue = self.queues.entry(session_id.clone()).or_default();
            if queue.len() >= self.capacity {
                warn!(
                    session = %session_id,
                    capacity = self.capacity,
                    "task queue full, dropping message"
                );
                return Err(SessionError::QueueFull {
                    session_id: session_id.clone(),
                    capacity: self.capacity,
                });
            }
            queue.push_back(message);
            queue.len()
        };

        info!(session = %session_id, message = %message_id, position, "message queued");

        // Clone out of the map so the callback never runs under a shard lock.
        let callback = self.callbacks.get(session_id).map(|cb| Arc::clone(cb.value()));
        if let Some(cb) = callback {
            cb();
        }

        self.sink.emit(Notification::MessageQueued {
            session_id: session_id.clone(),
            message_id,
            position,
        });
        Ok(position)
    }

    /// Pop the oldest message. The session's queue is removed once empty.
    pub fn dequeue(&self, session_id: &SessionId) -> Option<QueuedTaskMessage> {
        let (message, remaining) = {
            let mut queue = self.queues.get_mut(session_id)?;
            let message = queue.pop_front()?;
            (message, queue.len())
        };
        if remaining == 0 {
            self.queues.remove_if(session_id, |_, q| q.is_empty());
        }

        debug!(session = %session_id, message = %message.message_id, remaining, "message dequeued");
        self.sink.emit(Notification::MessageDequeued {
            session_id: session_id.clone(),
            message_id: message.message_id.clone(),
            remaining,
        });
        Some(message)
    }

    /// Discard the session's queue and activity callback.
    pub fn clear(&self, session_id: &SessionId) {
        let dropped = self.queues.remove(session_id).map(|(_, q)| q.len()).unwrap_or(0);
        self.callbacks.remove(session_id);
        if dropped > 0 {
            info!(session = %session_id, dropped, "task queue cleared");
        }
    }

    pub fn set_activity_callback(&self, session_id: &SessionId, callback: ActivityCallback) {
        self.callbacks.insert(session_id.clone(), callback);
    }

    pub fn clear_activity_callback(&self, session_id: &SessionId) {
        self.callbacks.remove(session_id);
    }

    pub fn has_activity_callback(&self, session_id: &SessionId) -> bool {
        self.callbacks.contains_key(session_id)
    }

    pub fn len(&self, session_id: &SessionId) -> usize {
        self.queues.get(session_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, session_id: &SessionId) -> bool {
        self.len(session_id) == 0
    }

    /// Whether a queue entry currently exists for the session.
    pub fn has_queue(&self, session_id: &SessionId) -> bool {
        self.queues.contains_key(session_id)
    }
}

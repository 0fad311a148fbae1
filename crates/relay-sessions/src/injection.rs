//! Tracks whether full entity context has already been sent to the provider
//! for a session's current entity.

use dashmap::DashMap;
use relay_core::SessionId;
use tracing::debug;

/// Entity key used for entities that have no id yet (unsaved / new).
pub const NEW_ENTITY_KEY: &str = "__new__";

#[derive(Debug, Clone, PartialEq, Eq)]
struct InjectionEntry {
    entity_key: String,
    injected: bool,
}

#[derive(Debug, Default)]
pub struct ContextInjectionState {
    entries: DashMap<SessionId, InjectionEntry>,
}

impl ContextInjectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_key(entity_id: Option<&str>) -> &str {
        entity_id.unwrap_or(NEW_ENTITY_KEY)
    }

    /// True only if context was injected for exactly this entity key.
    /// A different entity on the same session counts as not injected.
    pub fn is_injected(&self, session_id: &SessionId, entity_key: &str) -> bool {
        self.entries
            .get(session_id)
            .is_some_and(|e| e.injected && e.entity_key == entity_key)
    }

    pub fn mark_injected(&self, session_id: &SessionId, entity_key: &str) {
        debug!(session = %session_id, entity = entity_key, "context marked injected");
        self.entries.insert(
            session_id.clone(),
            InjectionEntry {
                entity_key: entity_key.to_string(),
                injected: true,
            },
        );
    }

    /// Forget the session's injection record (entity switch, teardown).
    pub fn clear(&self, session_id: &SessionId) {
        self.entries.remove(session_id);
    }
}

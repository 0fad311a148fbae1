use chrono::Utc;
use dashmap::DashMap;
use relay_core::config::SessionsConfig;
use relay_core::SessionId;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::types::{SessionContext, SessionHandle, SessionStatus};

/// Single source of truth for in-memory session state.
///
/// The store owns every [`SessionContext`]; callers only ever hold
/// [`SessionHandle`]s pointing into it. One store is built by the host and
/// passed explicitly to the pipeline, dispatcher and diagnostics.
pub struct SessionContextStore {
    sessions: DashMap<SessionId, SessionHandle>,
    max_events: usize,
    stuck_after: chrono::Duration,
}

impl SessionContextStore {
    pub fn new() -> Self {
        Self::from_config(&SessionsConfig::default())
    }

    pub fn from_config(cfg: &SessionsConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            max_events: cfg.max_events,
            stuck_after: chrono::Duration::seconds(cfg.stuck_after_secs as i64),
        }
    }

    /// Return the stored context for `id`, creating an idle one on first use.
    ///
    /// Repeated calls return handles to the same instance.
    #[instrument(skip(self), fields(session = %id))]
    pub fn get_or_create(&self, id: &SessionId) -> SessionHandle {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("creating session context");
                SessionHandle::new(SessionContext::new(id.clone(), self.max_events))
            })
            .clone()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|h| h.clone())
    }

    /// Accept `handle` as the authoritative state for its session.
    ///
    /// Fails when the session is not in the store. When `handle` is not the
    /// stored instance (a copy was mutated and resubmitted) the mismatch is
    /// logged and the submitted context replaces the stored one.
    #[instrument(skip(self, handle))]
    pub fn update(&self, handle: &SessionHandle) -> Result<()> {
        let session_id = handle.session_id();
        let Some(mut stored) = self.sessions.get_mut(&session_id) else {
            warn!(session = %session_id, "update for session missing from store");
            return Err(SessionError::NonExistentSession { session_id });
        };
        if !stored.ptr_eq(handle) {
            warn!(
                session = %session_id,
                "update received a context that is not the stored instance; accepting it"
            );
            *stored = handle.clone();
        }
        drop(stored);
        handle.lock().touch();
        Ok(())
    }

    /// Remove a session. Returns whether anything was removed; never fails.
    #[instrument(skip(self), fields(session = %id))]
    pub fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            info!("session context deleted");
        }
        removed
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Sessions that need attention: every `error` session, plus non-idle
    /// sessions with no activity for longer than the stuck threshold.
    /// Idle sessions are never reported, however old.
    pub fn bad_sessions(&self) -> Vec<SessionHandle> {
        let cutoff = Utc::now() - self.stuck_after;
        self.sessions
            .iter()
            .filter(|entry| {
                let ctx = entry.value().lock();
                match ctx.status {
                    SessionStatus::Error => true,
                    SessionStatus::Idle => false,
                    _ => ctx.last_activity_at < cutoff,
                }
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Pretty-printed JSON of the whole context, for debugging.
    ///
    /// Unknown ids log a single line and return `None`.
    pub fn dump_session(&self, id: &SessionId) -> Option<String> {
        let Some(handle) = self.get(id) else {
            info!(session = %id, "dump requested for unknown session");
            return None;
        };
        let snapshot = handle.snapshot();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(session = %id, error = %e, "failed to serialize session dump");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session. Intended for test harnesses.
    pub fn reset(&self) {
        self.sessions.clear();
    }
}

impl Default for SessionContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    fn age(handle: &SessionHandle, status: SessionStatus, minutes: i64) {
        let mut ctx = handle.lock();
        ctx.status = status;
        ctx.last_activity_at = Utc::now() - chrono::Duration::minutes(minutes);
    }

    #[test]
    fn get_or_create_returns_same_instance() {
        let store = SessionContextStore::new();
        let a = store.get_or_create(&sid("s1"));
        let b = store.get_or_create(&sid("s1"));
        assert!(a.ptr_eq(&b));
        assert_eq!(a.status(), SessionStatus::Idle);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_unknown_returns_none() {
        let store = SessionContextStore::new();
        assert!(store.get(&sid("nope")).is_none());
    }

    #[test]
    fn update_missing_session_fails() {
        let store = SessionContextStore::new();
        let orphan = SessionHandle::new(SessionContext::new(sid("ghost"), 10));
        let err = store.update(&orphan).unwrap_err();
        assert!(matches!(err, SessionError::NonExistentSession { .. }));
        assert_eq!(err.code(), "NON_EXISTENT_SESSION");
    }

    #[test]
    fn update_after_delete_fails() {
        let store = SessionContextStore::new();
        let h = store.get_or_create(&sid("s1"));
        assert!(store.delete(&sid("s1")));
        assert!(store.update(&h).is_err());
    }

    #[test]
    fn update_with_copy_is_accepted_as_authoritative() {
        let store = SessionContextStore::new();
        let stored = store.get_or_create(&sid("s1"));
        let copy = SessionHandle::new(stored.snapshot());
        copy.lock().continuity_id = Some("from-copy".into());

        store.update(&copy).expect("copy should be accepted");

        let now_stored = store.get(&sid("s1")).expect("session present");
        assert!(now_stored.ptr_eq(&copy));
        assert_eq!(now_stored.lock().continuity_id.as_deref(), Some("from-copy"));
    }

    #[test]
    fn delete_is_idempotent() {
        let store = SessionContextStore::new();
        store.get_or_create(&sid("s1"));
        assert!(store.delete(&sid("s1")));
        assert!(!store.delete(&sid("s1")));
        assert!(!store.delete(&sid("never-existed")));
    }

    #[test]
    fn session_ids_are_listed_sorted() {
        let store = SessionContextStore::new();
        store.get_or_create(&sid("b"));
        store.get_or_create(&sid("a"));
        assert_eq!(store.session_ids(), vec![sid("a"), sid("b")]);
    }

    #[test]
    fn bad_sessions_classification() {
        let store = SessionContextStore::new();
        age(&store.get_or_create(&sid("err-fresh")), SessionStatus::Error, 0);
        age(&store.get_or_create(&sid("stuck")), SessionStatus::Streaming, 6);
        age(&store.get_or_create(&sid("busy-fresh")), SessionStatus::Streaming, 1);
        age(&store.get_or_create(&sid("idle-old")), SessionStatus::Idle, 60);

        let mut bad: Vec<String> = store
            .bad_sessions()
            .iter()
            .map(|h| h.session_id().0)
            .collect();
        bad.sort();
        assert_eq!(bad, vec!["err-fresh".to_string(), "stuck".to_string()]);
    }

    #[test]
    fn dump_session_contains_status_and_unknown_is_none() {
        let store = SessionContextStore::new();
        store.get_or_create(&sid("s1"));
        let dump = store.dump_session(&sid("s1")).expect("dump");
        assert!(dump.contains("\"status\": \"idle\""));
        assert!(store.dump_session(&sid("missing")).is_none());
    }

    #[test]
    fn reset_clears_everything() {
        let store = SessionContextStore::new();
        store.get_or_create(&sid("s1"));
        store.get_or_create(&sid("s2"));
        store.reset();
        assert!(store.is_empty());
    }

    #[test]
    fn events_are_bounded_by_config() {
        let store = SessionContextStore::from_config(&SessionsConfig {
            max_events: 5,
            ..SessionsConfig::default()
        });
        let h = store.get_or_create(&sid("s1"));
        {
            let mut ctx = h.lock();
            for i in 0..12 {
                ctx.push_event("test", i.to_string());
            }
        }
        let ctx = h.lock();
        let details: Vec<&str> = ctx.events.iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["7", "8", "9", "10", "11"]);
    }
}

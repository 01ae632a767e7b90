use crate::store::{ControllerStore, SessionRecord, StoreError};
use std::sync::Arc;

/// Per-target session persistence with a freshness threshold.
///
/// One active session per target; `save` is last-write-wins with no merge,
/// and `load` refuses sessions older than the freshness threshold so a
/// long-dormant cookie jar is never replayed against a target.
pub struct SessionStore {
    store: Arc<ControllerStore>,
    freshness_secs: u64,
}

impl SessionStore {
    pub fn new(store: Arc<ControllerStore>, freshness_secs: u64) -> Self {
        Self {
            store,
            freshness_secs,
        }
    }

    /// Build a fresh, cookie-free session bound to one identity.
    pub fn fresh(identity_id: usize, now_secs: u64) -> SessionRecord {
        SessionRecord {
            identity_id: identity_id as u64,
            cookies: Vec::new(),
            storage: Vec::new(),
            had_success: false,
            created_at_secs: now_secs,
            last_used_at_secs: now_secs,
        }
    }

    /// Most recent persisted session, or None if absent or stale.
    /// A stale session is dropped from the store on the way out.
    pub fn load(&self, target: &str, now_secs: u64) -> Result<Option<SessionRecord>, StoreError> {
        match self.store.load_session(target)? {
            Some(session) => {
                let age = now_secs.saturating_sub(session.last_used_at_secs);
                if age < self.freshness_secs {
                    Ok(Some(session))
                } else {
                    tracing::debug!(%target, age_secs = age, "Discarding stale session");
                    self.store.delete_session(target)?;
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Replace any prior persisted session for this target.
    pub fn save(&self, target: &str, session: &SessionRecord) -> Result<(), StoreError> {
        self.store.save_session(target, session)
    }

    /// Clear the persisted session so the next attempt starts cookie-free.
    pub fn invalidate(&self, target: &str) -> Result<(), StoreError> {
        self.store.delete_session(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session_store(freshness_secs: u64) -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ControllerStore::new(dir.path()).unwrap());
        (dir, SessionStore::new(store, freshness_secs))
    }

    #[test]
    fn test_save_then_load_within_freshness() {
        let (_dir, sessions) = session_store(3_600);
        let now = 10_000;

        let mut s = SessionStore::fresh(1, now);
        s.cookies.push(("sid".to_string(), "xyz".to_string()));
        sessions.save("board-a", &s).unwrap();

        let loaded = sessions.load("board-a", now + 10).unwrap().unwrap();
        assert_eq!(loaded.identity_id, 1);
        assert_eq!(loaded.cookies, s.cookies);
        assert_eq!(loaded.created_at_secs, now);
    }

    #[test]
    fn test_stale_session_is_dropped() {
        let (_dir, sessions) = session_store(3_600);
        let now = 10_000;

        sessions
            .save("board-a", &SessionStore::fresh(0, now))
            .unwrap();

        assert!(sessions.load("board-a", now + 3_600).unwrap().is_none());
        // The stale record is gone for good, not just filtered.
        assert!(sessions.load("board-a", now).unwrap().is_none());
    }

    #[test]
    fn test_invalidate_clears_session() {
        let (_dir, sessions) = session_store(3_600);

        sessions
            .save("board-a", &SessionStore::fresh(0, 10_000))
            .unwrap();
        sessions.invalidate("board-a").unwrap();
        assert!(sessions.load("board-a", 10_001).unwrap().is_none());
    }

    #[test]
    fn test_missing_session_loads_none() {
        let (_dir, sessions) = session_store(3_600);
        assert!(sessions.load("never-seen", 1).unwrap().is_none());
    }
}

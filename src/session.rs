#![cfg(feature = "web")]

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::transform::FilterState;

/// Cookie carrying the session id
pub const SESSION_COOKIE: &str = "sheetboard_session";

/// Dashboard session data
///
/// Holds the widget state of one browser between requests.
#[derive(Debug, Clone)]
pub struct Session {
    /// Random session identifier (uuid v4)
    pub id: String,

    /// Last filter the browser applied
    pub filter: FilterState,

    /// Time when the session expires unless used again
    pub expires_at: SystemTime,
}

/// In-memory session storage
///
/// Stores all active sessions in a thread-safe map. Sessions live only as
/// long as the process.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a session with the default filter
    ///
    /// Expired sessions are purged first, so the store only grows with live sessions.
    ///
    /// # Returns
    /// * `Session` - The new session, already stored
    pub fn create(&self) -> Session {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            filter: FilterState::default(),
            expires_at: SystemTime::now() + self.ttl,
        };

        let now = SystemTime::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, existing| existing.expires_at > now);
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up a session
    ///
    /// Expired sessions are removed and reported as missing.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(id) {
            if session.expires_at > SystemTime::now() {
                return Some(session.clone());
            }
        }
        sessions.remove(id);
        None
    }

    /// The session for a cookie value, or a fresh one when it is missing or expired
    pub fn resolve(&self, id: Option<&str>) -> Session {
        id.and_then(|id| self.get(id)).unwrap_or_else(|| self.create())
    }

    /// Store a new filter and extend the session's lifetime
    ///
    /// # Returns
    /// * `bool` - false when the session no longer exists
    pub fn update_filter(&self, id: &str, filter: FilterState) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(id) {
            Some(session) => {
                session.filter = filter;
                session.expires_at = SystemTime::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    /// Drop expired sessions, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_create_and_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        let session = store.create();
        assert_eq!(store.len(), 1);

        let found = store.get(&session.id).unwrap();
        assert_eq!(found.id, session.id);
        assert!(found.filter.is_default());
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn test_update_filter_is_kept_per_session() {
        let store = SessionStore::new(Duration::from_secs(60));
        let a = store.create();
        let b = store.create();

        let filter = FilterState {
            from: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..FilterState::default()
        };
        assert!(store.update_filter(&a.id, filter.clone()));
        assert_eq!(store.get(&a.id).unwrap().filter, filter);
        assert!(store.get(&b.id).unwrap().filter.is_default());
        assert!(!store.update_filter("missing", filter));
    }

    #[test]
    fn test_expired_sessions_are_dropped() {
        let store = SessionStore::new(Duration::ZERO);
        let session = store.create();
        assert!(store.get(&session.id).is_none());
        assert!(store.is_empty());

        // Creating a session sweeps the ones that already expired
        store.create();
        store.create();
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 1);
    }

    #[test]
    fn test_resolve_reuses_or_creates() {
        let store = SessionStore::new(Duration::from_secs(60));
        let first = store.resolve(None);
        let again = store.resolve(Some(&first.id));
        assert_eq!(first.id, again.id);

        let other = store.resolve(Some("stale-cookie"));
        assert_ne!(other.id, first.id);
        assert_eq!(store.len(), 2);
    }
}

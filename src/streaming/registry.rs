//! Process-wide table of live stream sessions
//!
//! Each entry owns the cancellation token of one relay loop. Cancelling it
//! makes the relay finish, which runs the ordinary close path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{session_key, StopOutcome};

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub key: String,
    pub stream_url: String,
    pub client: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: u64,
    pub key: String,
    pub stream_url: String,
    pub client: String,
    pub started_at: DateTime<Utc>,
}

impl From<&SessionHandle> for SessionInfo {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            id: handle.id,
            key: handle.key.clone(),
            stream_url: handle.stream_url.clone(),
            client: handle.client.clone(),
            started_at: handle.started_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session. An existing session with the same identity
    /// is cancelled and replaced.
    pub fn register(&self, stream_url: &str, client: &str) -> SessionHandle {
        let handle = SessionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            key: session_key(stream_url, client),
            stream_url: stream_url.to_string(),
            client: client.to_string(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        };

        if let Some(previous) = self.sessions().insert(handle.key.clone(), handle.clone()) {
            info!("Replacing session {} (id {})", previous.key, previous.id);
            previous.cancel.cancel();
        }

        debug!("Registered session {} (id {})", handle.key, handle.id);
        handle
    }

    pub fn lookup(&self, key: &str) -> Option<SessionInfo> {
        self.sessions().get(key).map(SessionInfo::from)
    }

    /// Remove the entry only if it still belongs to registration `id`
    pub fn remove(&self, key: &str, id: u64) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(key) {
            Some(handle) if handle.id == id => {
                sessions.remove(key);
                debug!("Removed session {} (id {})", key, id);
                true
            }
            _ => false,
        }
    }

    /// Cancel the live session with this identity
    pub fn force_close(&self, key: &str) -> StopOutcome {
        match self.sessions().remove(key) {
            Some(handle) => {
                info!("Force closing session {} (id {})", key, handle.id);
                handle.cancel.cancel();
                StopOutcome::Found
            }
            None => {
                info!("Stop requested for unknown session {}", key);
                StopOutcome::NotFound
            }
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions().values().map(SessionInfo::from).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_close_cancels_and_removes() {
        let registry = SessionRegistry::new();
        let handle = registry.register("http://up/1", "10.0.0.1");

        assert!(registry.lookup(&handle.key).is_some());
        assert_eq!(registry.force_close(&handle.key), StopOutcome::Found);
        assert!(handle.cancel.is_cancelled());
        assert!(registry.lookup(&handle.key).is_none());
        assert_eq!(registry.force_close(&handle.key), StopOutcome::NotFound);
    }

    #[test]
    fn test_remove_ignores_stale_registration() {
        let registry = SessionRegistry::new();
        let first = registry.register("http://up/1", "c");
        let second = registry.register("http://up/1", "c");

        assert!(first.cancel.is_cancelled());
        assert!(!registry.remove(&first.key, first.id));
        assert_eq!(registry.lookup(&second.key).map(|s| s.id), Some(second.id));
        assert!(registry.remove(&second.key, second.id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_clients_are_distinct_sessions() {
        let registry = SessionRegistry::new();
        registry.register("http://up/1", "a");
        registry.register("http://up/1", "b");
        assert_eq!(registry.list().len(), 2);
    }
}

//! Live session registry.
//!
//! Owned by the [`Host`](crate::host::Host). Sessions are inserted before
//! their read loop starts and removed exactly once when their task ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;
use uuid::Uuid;

use super::session::{SessionHandle, SessionInfo, SessionState};

/// Map of session id to session handle.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.lock().insert(handle.id(), handle);
    }

    /// Remove a session.
    ///
    /// Returns the handle on the first call only. A second removal of the
    /// same id is a logic error and is logged as such.
    pub fn remove(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.lock().remove(&id);
        if removed.is_none() {
            error!(session_id = %id, "session removed from registry twice");
        }
        removed
    }

    /// Handle of a registered session.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Handles of every registered session.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Snapshot of every registered session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.lock().values().map(|h| h.info()).collect()
    }

    /// Snapshot of sessions that completed the handshake.
    #[must_use]
    pub fn verified(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .values()
            .filter(|h| h.state() == SessionState::Verified)
            .map(|h| h.info())
            .collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

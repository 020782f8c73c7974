//! Read-only, display-safe projection of the registry.
//!
//! Snapshots are cached by registry epoch, so repeated reads between changes
//! never walk the map. Rows are rebuilt on every call from the cached
//! sessions, which keeps `last_heartbeat_at` current.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use solo_core::UserId;

use crate::registry::{RegistrySnapshot, Session, SessionRegistry};

/// One active session as shown to observers. Never exposes the connection
/// handle itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionView {
    /// Session owner.
    pub user_id: UserId,
    /// Partial connection identifier.
    pub session_id: String,
    /// When the session was registered.
    pub established_at: DateTime<Utc>,
    /// Last inbound activity.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Client label, when the client supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id().clone(),
            session_id: session.connection_id().masked(),
            established_at: session.established_at(),
            last_heartbeat_at: session.last_heartbeat_at(),
            client: session.connection().label().map(str::to_owned),
        }
    }
}

/// Response body of the active-sessions query.
#[derive(Clone, Debug, Serialize)]
pub struct ActiveSessions {
    /// Sessions ordered by establishment time.
    pub sessions: Vec<SessionView>,
    /// `sessions.len()`.
    pub count: usize,
    /// Registry epoch the view reflects.
    pub epoch: u64,
    /// When the view was produced.
    pub timestamp: DateTime<Utc>,
}

/// Epoch-cached query service.
pub struct SessionQueryService {
    registry: Arc<SessionRegistry>,
    cache: Mutex<Option<Arc<RegistrySnapshot>>>,
}

impl SessionQueryService {
    /// Create a query service over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let epoch = self.registry.epoch();
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.epoch == epoch {
                return Arc::clone(cached);
            }
        }
        let fresh = Arc::new(self.registry.snapshot());
        let mut cache = self.cache.lock();
        // a concurrent reader may have stored a newer snapshot meanwhile
        if cache.as_ref().is_none_or(|c| c.epoch < fresh.epoch) {
            *cache = Some(Arc::clone(&fresh));
        }
        fresh
    }

    /// Current active sessions.
    pub fn active_sessions(&self) -> ActiveSessions {
        let snapshot = self.snapshot();
        let sessions: Vec<SessionView> = snapshot.sessions.iter().map(SessionView::from).collect();
        ActiveSessions {
            count: sessions.len(),
            sessions,
            epoch: snapshot.epoch,
            timestamp: Utc::now(),
        }
    }

    /// Whether `user_id` currently holds a session.
    pub fn is_active(&self, user_id: &UserId) -> bool {
        self.snapshot()
            .sessions
            .iter()
            .any(|s| s.user_id() == user_id)
    }

    /// Epoch of the cached snapshot, if any.
    pub fn cached_epoch(&self) -> Option<u64> {
        self.cache.lock().as_ref().map(|c| c.epoch)
    }
}

//! Session registry: the authoritative `user -> connection` map.
//!
//! At most one [`Session`] exists per user. Every mutation goes through a
//! per-key `DashMap` entry guard, so registrations for different users never
//! contend on a global lock, and registrations for the same user are totally
//! ordered by the guard.
//!
//! Each mutation bumps a registry-wide epoch while still holding the entry
//! guard. [`SessionRegistry::snapshot`] reads the epoch before and after
//! walking the map and accepts the walk when both reads agree. Under steady
//! churn that may never happen, so after [`OPTIMISTIC_SNAPSHOT_ATTEMPTS`]
//! failed walks the snapshot takes the writer gate exclusively and walks a
//! map nobody is mutating.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use solo_core::{ConnectionId, SessionError, UserId};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::websocket::connection::ConnectionHandle;

/// One authenticated user bound to one connection.
#[derive(Clone, Debug)]
pub struct Session {
    user_id: UserId,
    connection: Arc<ConnectionHandle>,
    established_at: DateTime<Utc>,
}

impl Session {
    fn new(user_id: UserId, connection: Arc<ConnectionHandle>) -> Self {
        Self {
            user_id,
            connection,
            established_at: Utc::now(),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The session's connection.
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.connection
    }

    /// Shorthand for `connection().id()`.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// When the session was registered.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Last inbound activity on the connection.
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.connection.last_heartbeat_at()
    }
}

/// Consistent point-in-time view of the registry.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    /// Epoch the view was taken at.
    pub epoch: u64,
    /// Sessions ordered by `established_at`, then user id.
    pub sessions: Vec<Session>,
}

/// Lock-free snapshot walks tried before falling back to the writer gate.
pub const OPTIMISTIC_SNAPSHOT_ATTEMPTS: usize = 4;

/// The session registry.
pub struct SessionRegistry {
    sessions: DashMap<UserId, Session>,
    // Shared by every mutation, taken exclusively by a fallback snapshot.
    // Always acquired before any shard lock.
    writers: RwLock<()>,
    epoch: AtomicU64,
    epoch_tx: watch::Sender<u64>,
    accepting: AtomicBool,
}

impl RegistrySnapshot {
    fn ordered(epoch: u64, mut sessions: Vec<Session>) -> Self {
        sessions.sort_by(|a, b| {
            a.established_at
                .cmp(&b.established_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Self { epoch, sessions }
    }
}

impl SessionRegistry {
    /// Create an empty registry at epoch 0.
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            writers: RwLock::new(()),
            epoch: AtomicU64::new(0),
            epoch_tx,
            accepting: AtomicBool::new(true),
        }
    }

    /// Insert or replace the session for `user_id`.
    ///
    /// Returns the displaced session, if any. Of two racing registrations for
    /// the same user exactly one observes the other as displaced.
    pub fn register(
        &self,
        user_id: UserId,
        connection: Arc<ConnectionHandle>,
    ) -> solo_core::Result<Option<Session>> {
        if !self.is_accepting() {
            return Err(unavailable());
        }
        let session = Session::new(user_id.clone(), connection);
        let connection_id = session.connection_id().clone();

        let _writer = self.writers.read();
        let (prior, epoch) = match self.sessions.entry(user_id.clone()) {
            Entry::Occupied(mut entry) => {
                if !self.is_accepting() {
                    return Err(unavailable());
                }
                let prior = entry.insert(session);
                (Some(prior), self.bump())
            }
            Entry::Vacant(entry) => {
                if !self.is_accepting() {
                    return Err(unavailable());
                }
                let _inserted = entry.insert(session);
                (None, self.bump())
            }
        };

        debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            displaced = prior.as_ref().map(|p| p.connection_id().as_str()),
            epoch,
            "session registered"
        );
        Ok(prior)
    }

    /// Remove the session for `user_id` only if it is still bound to
    /// `expected`.
    ///
    /// A mismatch (or a missing entry) yields `StaleUnregister` and leaves the
    /// registry untouched.
    pub fn unregister(
        &self,
        user_id: &UserId,
        expected: &ConnectionId,
    ) -> solo_core::Result<Session> {
        let _writer = self.writers.read();
        match self.sessions.entry(user_id.clone()) {
            Entry::Occupied(entry) if entry.get().connection_id() == expected => {
                let epoch = self.bump();
                let removed = entry.remove();
                debug!(user_id = %user_id, connection_id = %expected, epoch, "session unregistered");
                Ok(removed)
            }
            _ => Err(SessionError::StaleUnregister {
                user_id: user_id.clone(),
                expected: expected.clone(),
            }),
        }
    }

    /// Point read.
    pub fn lookup(&self, user_id: &UserId) -> Option<Session> {
        self.sessions.get(user_id).map(|s| s.value().clone())
    }

    /// Consistent, ordered view of all sessions.
    ///
    /// Always returns: if writers keep moving the epoch during the lock-free
    /// walks, a final walk holds off mutations until it finishes.
    pub fn snapshot(&self) -> RegistrySnapshot {
        for _ in 0..OPTIMISTIC_SNAPSHOT_ATTEMPTS {
            let before = self.epoch.load(Ordering::SeqCst);
            let sessions = self.collect();
            let after = self.epoch.load(Ordering::SeqCst);
            if before == after {
                return RegistrySnapshot::ordered(after, sessions);
            }
            std::hint::spin_loop();
        }

        let _exclusive = self.writers.write();
        debug!("registry snapshot fell back to the writer gate");
        let epoch = self.epoch.load(Ordering::SeqCst);
        RegistrySnapshot::ordered(epoch, self.collect())
    }

    fn collect(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Current epoch. Changes on every successful register or unregister.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Subscribe to epoch changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether new registrations are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting registrations and drain every session.
    ///
    /// Later `register` calls fail with `RegistryUnavailable`. The drained
    /// sessions are returned so the caller can close their connections.
    pub fn close(&self) -> Vec<Session> {
        self.accepting.store(false, Ordering::SeqCst);
        let users: Vec<UserId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        let mut drained = Vec::with_capacity(users.len());
        for user_id in users {
            let _writer = self.writers.read();
            if let Entry::Occupied(entry) = self.sessions.entry(user_id) {
                let _ = self.bump();
                drained.push(entry.remove());
            }
        }
        info!(drained = drained.len(), "session registry closed");
        drained
    }

    // Called with the writer gate shared and an entry guard held.
    fn bump(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.epoch_tx.send_if_modified(|current| {
            if epoch > *current {
                *current = epoch;
                true
            } else {
                false
            }
        });
        epoch
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable() -> SessionError {
    SessionError::RegistryUnavailable("registry is shutting down".into())
}

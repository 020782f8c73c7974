//! `session_update` fan-out to connected clients.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use solo_core::{ConnectionId, ServerMessage};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ConnectionHandle;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;

/// Tracks open connections and pushes session-change notices to them.
pub struct SessionBroadcaster {
    /// Connected clients indexed by connection ID.
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl SessionBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ConnectionHandle>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id().clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &ConnectionId) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(connection_id);
    }

    /// Tell every open connection that the active-session set changed.
    ///
    /// Never waits on a slow client: a full queue drops the notice for that
    /// client only. Returns the number of clients that accepted it.
    pub async fn announce(&self, epoch: u64) -> usize {
        let message = ServerMessage::SessionUpdate { epoch };
        let frame = match message.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(epoch, error = %e, "failed to serialize session update");
                return 0;
            }
        };
        let conns = self.connections.read().await;
        let mut delivered = 0;
        for conn in conns.values().filter(|c| c.is_open()) {
            if conn.try_send(Arc::clone(&frame)) {
                delivered += 1;
            } else {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(connection_id = %conn.id(), epoch, "failed to send session update");
            }
        }
        debug!(epoch, recipients = delivered, "session update broadcast");
        delivered
    }

    /// Number of tracked connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Forward registry epoch changes as `session_update` broadcasts until
    /// `cancel` fires or the registry is dropped.
    ///
    /// Bursts of changes collapse into one notice carrying the latest epoch.
    pub async fn run_bridge(
        self: Arc<Self>,
        mut epochs: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let epoch = *epochs.borrow_and_update();
                    let _ = self.announce(epoch).await;
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("session update bridge stopped");
    }
}

impl Default for SessionBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

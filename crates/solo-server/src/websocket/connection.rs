//! Connection handle: one live push channel to one client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use solo_core::{CloseReason, ConnectionId, ServerMessage, SessionError, TokenId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle state of a connection. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport accepted, handshake not finished.
    Connecting = 0,
    /// Ready to carry messages.
    Open = 1,
    /// Close requested; queued frames are draining.
    Closing = 2,
    /// Gone for good.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

struct LastSeen {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Wraps one duplex push channel.
///
/// Outbound text frames go through a bounded `mpsc` queue drained by the
/// socket writer task. Closing cancels [`ConnectionHandle::closed`], which is
/// the writer's cue to flush and send a close frame carrying
/// [`ConnectionHandle::close_reason`].
pub struct ConnectionHandle {
    id: ConnectionId,
    label: Option<String>,
    token_id: Option<TokenId>,
    state: AtomicU8,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<LastSeen>,
    dropped_messages: AtomicU64,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: None,
            token_id: None,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            tx,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            connected_at: now,
            last_seen: Mutex::new(LastSeen {
                at: Instant::now(),
                wall: now,
            }),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create an already-open handle plus the receiving end of its queue.
    pub fn open_channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self::new(ConnectionId::new(), tx);
        let _ = handle.mark_open();
        (handle, rx)
    }

    /// Attach a client label (user agent, device name).
    #[must_use]
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label.filter(|l| !l.trim().is_empty());
        self
    }

    /// Attach the id of the access token the client presented.
    #[must_use]
    pub fn with_token_id(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Client label, if the client offered one.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Access-token id bound to this connection.
    pub fn token_id(&self) -> Option<&TokenId> {
        self.token_id.as_ref()
    }

    /// When the transport was accepted.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether messages can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `Connecting -> Open`. Returns `false` from any other state.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Advance to `target` unless the handle is already there or further.
    fn advance(&self, target: ConnectionState) -> bool {
        let target = target as u8;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= target {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Send a message, waiting for queue space.
    ///
    /// Fails with `ChannelClosed` if the handle is not open, or if it closes
    /// while waiting for capacity. A failed send moves the handle to `Closed`.
    pub async fn send(&self, message: &ServerMessage) -> solo_core::Result<()> {
        if !self.is_open() {
            return Err(self.channel_closed());
        }
        let Some(frame) = self.encode(message) else {
            return Ok(());
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(self.channel_closed()),
            sent = self.tx.send(frame) => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.terminate(CloseReason::TransportClosed);
                    Err(self.channel_closed())
                }
            },
        }
    }

    /// Enqueue a pre-encoded frame without waiting.
    ///
    /// Returns `false` if the handle is not open or the queue is full or
    /// closed, and increments the dropped message counter.
    pub fn try_send(&self, frame: Arc<String>) -> bool {
        if self.is_open() && self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Request a close with the given reason.
    ///
    /// Idempotent: returns `true` only for the call that moved the handle out
    /// of `Connecting`/`Open`. Later calls keep the first reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.advance(ConnectionState::Closing) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.closed.cancel();
        debug!(connection_id = %self.id, ?reason, "connection closing");
        true
    }

    /// Mark the transport as gone. Called by the writer once the close frame
    /// is out, or when the socket fails.
    pub fn finish(&self) {
        let _ = self.advance(ConnectionState::Closed);
        self.closed.cancel();
    }

    fn terminate(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.finish();
    }

    /// Resolves once a close was requested or the transport went away.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Why the handle was closed, if it was.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let mut seen = self.last_seen.lock();
        seen.at = Instant::now();
        seen.wall = Utc::now();
    }

    /// Wall-clock time of the last inbound activity.
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.last_seen.lock().wall
    }

    /// How long the client has been silent as of `now`.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen.lock().at)
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn encode(&self, message: &ServerMessage) -> Option<Arc<String>> {
        match message.to_json() {
            Ok(json) => Some(Arc::new(json)),
            Err(e) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %self.id, kind = message.kind(), error = %e, "failed to encode message");
                None
            }
        }
    }

    fn channel_closed(&self) -> SessionError {
        SessionError::ChannelClosed {
            connection_id: self.id.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_connection() -> (ConnectionHandle, mpsc::Receiver<Arc<String>>) {
        ConnectionHandle::open_channel(8)
    }

    #[test]
    fn new_handle_is_connecting() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new(ConnectionId::from("c1"), tx);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_open());
        assert!(conn.mark_open());
        assert!(conn.is_open());
        assert!(!conn.mark_open());
    }

    #[tokio::test]
    async fn send_delivers_json_frame() {
        let (conn, mut rx) = make_connection();
        conn.send(&ServerMessage::SessionUpdate { epoch: 3 })
            .await
            .unwrap();
        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "session_update");
        assert_eq!(json["epoch"], 3);
    }

    #[tokio::test]
    async fn send_on_connecting_handle_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionHandle::new(ConnectionId::from("c2"), tx);
        let err = conn.send(&ServerMessage::heartbeat()).await.unwrap_err();
        assert_matches!(err, SessionError::ChannelClosed { connection_id } if connection_id.as_str() == "c2");
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(CloseReason::Logout));
        assert_matches!(
            conn.send(&ServerMessage::heartbeat()).await,
            Err(SessionError::ChannelClosed { .. })
        );
    }

    #[tokio::test]
    async fn send_to_dropped_receiver_closes_handle() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert!(conn.send(&ServerMessage::heartbeat()).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::TransportClosed));
    }

    #[tokio::test]
    async fn blocked_send_is_released_by_close() {
        let (conn, _rx) = ConnectionHandle::open_channel(1);
        let conn = Arc::new(conn);
        assert!(conn.try_send(Arc::new("fill".into())));

        let sender = Arc::clone(&conn);
        let pending =
            tokio::spawn(async move { sender.send(&ServerMessage::heartbeat()).await });
        tokio::task::yield_now().await;
        let _ = conn.close(CloseReason::Superseded);
        assert_matches!(pending.await.unwrap(), Err(SessionError::ChannelClosed { .. }));
    }

    #[test]
    fn try_send_full_queue_counts_drop() {
        let (conn, _rx) = ConnectionHandle::open_channel(1);
        assert!(conn.try_send(Arc::new("a".into())));
        assert!(!conn.try_send(Arc::new("b".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn try_send_after_close_is_dropped() {
        let (conn, _rx) = make_connection();
        let _ = conn.close(CloseReason::Shutdown);
        assert!(!conn.try_send(Arc::new("late".into())));
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_reason() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(CloseReason::Superseded));
        assert!(!conn.close(CloseReason::HeartbeatTimeout));
        assert_eq!(conn.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn state_never_moves_backwards() {
        let (conn, _rx) = make_connection();
        conn.finish();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.close(CloseReason::Logout));
        assert!(!conn.mark_open());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn closed_future_resolves_on_close() {
        let (conn, _rx) = make_connection();
        let conn = Arc::new(conn);
        let waiter = Arc::clone(&conn);
        let task = tokio::spawn(async move { waiter.closed().await });
        let _ = conn.close(CloseReason::Logout);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_silence() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(conn.silence(Instant::now()), Duration::from_secs(40));
        conn.touch();
        assert_eq!(conn.silence(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn label_blank_is_ignored() {
        let (conn, _rx) = make_connection();
        let conn = conn.with_label(Some("   ".into()));
        assert!(conn.label().is_none());
        let (conn, _rx) = make_connection();
        let conn = conn.with_label(Some("Firefox".into()));
        assert_eq!(conn.label(), Some("Firefox"));
    }
}

//! Forced invalidation of a displaced session.
//!
//! The new login is already registered by the time the dispatcher runs; this
//! is cleanup, and its failures never reach the login path.
//!
//! 1. Build a `force_logout` notice.
//! 2. Try to send it once, bounded by `send_timeout`.
//! 3. If it was delivered, wait up to `grace_period` (or until the client
//!    closes on its own).
//! 4. Close the connection with [`CloseReason::Superseded`]. No retry.

use std::time::Duration;

use metrics::counter;
use solo_core::{CloseReason, ConnectionId, InvalidationNotice, ServerMessage, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::INVALIDATIONS_TOTAL;
use crate::registry::Session;

/// What happened to the notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the client.
    Delivered,
    /// The connection was already closed.
    ChannelClosed,
    /// The send did not finish within `send_timeout`.
    TimedOut,
}

impl Delivery {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::ChannelClosed => "channel_closed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Result of invalidating one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// User whose old session was invalidated.
    pub user_id: UserId,
    /// Connection that was invalidated.
    pub connection_id: ConnectionId,
    /// Notice delivery result.
    pub delivery: Delivery,
    /// Whether this dispatch performed the close (`false` if the connection
    /// was already closing).
    pub closed_by_dispatcher: bool,
}

/// Delivers termination notices and closes superseded connections.
#[derive(Clone, Debug)]
pub struct InvalidationDispatcher {
    grace_period: Duration,
    send_timeout: Duration,
}

impl InvalidationDispatcher {
    /// Create a dispatcher.
    pub fn new(grace_period: Duration, send_timeout: Duration) -> Self {
        Self {
            grace_period,
            send_timeout,
        }
    }

    /// Run [`Self::invalidate`] on a background task.
    pub fn dispatch(
        &self,
        prior: Session,
        superseding_context: Option<String>,
    ) -> JoinHandle<InvalidationOutcome> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.invalidate(prior, superseding_context).await })
    }

    /// Notify and close a displaced session.
    pub async fn invalidate(
        &self,
        prior: Session,
        superseding_context: Option<String>,
    ) -> InvalidationOutcome {
        let connection = prior.connection();
        let notice = InvalidationNotice::new_login_elsewhere(superseding_context);
        let message = ServerMessage::ForceLogout(notice);

        let delivery = match tokio::time::timeout(self.send_timeout, connection.send(&message)).await
        {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(e)) => {
                debug!(user_id = %prior.user_id(), error = %e, "invalidation notice not delivered");
                Delivery::ChannelClosed
            }
            Err(_) => {
                warn!(
                    user_id = %prior.user_id(),
                    connection_id = %prior.connection_id(),
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "invalidation notice send timed out"
                );
                Delivery::TimedOut
            }
        };

        if delivery == Delivery::Delivered && !self.grace_period.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.grace_period) => {}
                () = connection.closed() => {}
            }
        }

        let closed_by_dispatcher = connection.close(CloseReason::Superseded);
        counter!(INVALIDATIONS_TOTAL, "delivery" => delivery.as_str()).increment(1);
        info!(
            user_id = %prior.user_id(),
            connection_id = %prior.connection_id(),
            delivery = delivery.as_str(),
            closed_by_dispatcher,
            "session invalidated"
        );

        InvalidationOutcome {
            user_id: prior.user_id().clone(),
            connection_id: prior.connection_id().clone(),
            delivery,
            closed_by_dispatcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registry::SessionRegistry;
    use crate::websocket::connection::ConnectionHandle;
    use tokio::sync::mpsc;

    fn displaced(capacity: usize) -> (Session, mpsc::Receiver<Arc<String>>) {
        let registry = SessionRegistry::new();
        let (conn, rx) = ConnectionHandle::open_channel(capacity);
        let user = UserId::from("alice");
        let _ = registry.register(user.clone(), Arc::new(conn)).unwrap();
        let (next, _) = ConnectionHandle::open_channel(1);
        let prior = registry.register(user, Arc::new(next)).unwrap().unwrap();
        (prior, rx)
    }

    fn dispatcher() -> InvalidationDispatcher {
        InvalidationDispatcher::new(Duration::from_millis(500), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_notice_then_closes() {
        let (prior, mut rx) = displaced(4);
        let outcome = dispatcher()
            .invalidate(prior.clone(), Some("Chrome on macOS".into()))
            .await;

        assert_eq!(outcome.delivery, Delivery::Delivered);
        assert!(outcome.closed_by_dispatcher);
        assert_eq!(prior.connection().close_reason(), Some(CloseReason::Superseded));

        let frame = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "force_logout");
        assert_eq!(json["reason"], "NewLoginElsewhere");
        assert!(json["occurred_at"].is_string());
        assert_eq!(json["superseding_context"], "Chrome on macOS");
        assert!(rx.try_recv().is_err(), "exactly one notice");
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_grace_period() {
        let (prior, _rx) = displaced(4);
        let conn = Arc::clone(prior.connection());
        let task = dispatcher().dispatch(prior, None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.is_open(), "still open inside the grace window");

        let outcome = task.await.unwrap();
        assert!(outcome.closed_by_dispatcher);
        assert!(!conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_ends_grace_early() {
        let (prior, _rx) = displaced(4);
        let conn = Arc::clone(prior.connection());
        let started = tokio::time::Instant::now();
        let task = InvalidationDispatcher::new(Duration::from_secs(30), Duration::from_secs(2))
            .dispatch(prior, None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = conn.close(CloseReason::TransportClosed);
        let outcome = task.await.unwrap();

        assert!(!outcome.closed_by_dispatcher);
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(conn.close_reason(), Some(CloseReason::TransportClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn already_closed_connection_skips_notice() {
        let (prior, mut rx) = displaced(4);
        let _ = prior.connection().close(CloseReason::TransportClosed);
        let started = tokio::time::Instant::now();

        let outcome = dispatcher().invalidate(prior, None).await;

        assert_eq!(outcome.delivery, Delivery::ChannelClosed);
        assert!(!outcome.closed_by_dispatcher);
        assert_eq!(started.elapsed(), Duration::ZERO, "no grace wait without a notice");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn backpressured_send_times_out_then_closes() {
        let (prior, _rx) = displaced(1);
        assert!(prior.connection().try_send(Arc::new("fill".into())));

        let outcome = dispatcher().invalidate(prior.clone(), None).await;

        assert_eq!(outcome.delivery, Delivery::TimedOut);
        assert!(outcome.closed_by_dispatcher);
        assert_eq!(prior.connection().close_reason(), Some(CloseReason::Superseded));
    }

    #[tokio::test]
    async fn zero_grace_closes_immediately() {
        let (prior, mut rx) = displaced(4);
        let outcome = InvalidationDispatcher::new(Duration::ZERO, Duration::from_secs(1))
            .invalidate(prior, None)
            .await;
        assert_eq!(outcome.delivery, Delivery::Delivered);
        assert!(outcome.closed_by_dispatcher);
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn delivery_labels() {
        assert_eq!(Delivery::Delivered.as_str(), "delivered");
        assert_eq!(Delivery::ChannelClosed.as_str(), "channel_closed");
        assert_eq!(Delivery::TimedOut.as_str(), "timed_out");
    }
}

//! Liveness sweep over registered sessions.
//!
//! Clients send a heartbeat every `heartbeat_interval`; any inbound frame
//! counts. A periodic sweep evicts sessions silent for longer than
//! `stale_after`: the connection is closed with
//! [`CloseReason::HeartbeatTimeout`] and the registry entry is removed with
//! compare-and-remove.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use solo_core::{CloseReason, ConnectionId, UserId};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::KEEPALIVE_EVICTIONS_TOTAL;
use crate::registry::{Session, SessionRegistry};

/// Result of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions examined.
    pub inspected: usize,
    /// Sessions evicted, as `(user, connection)`.
    pub evicted: Vec<(UserId, ConnectionId)>,
    /// Stale sessions that were replaced before they could be removed.
    pub already_replaced: usize,
}

/// Periodic liveness monitor.
pub struct KeepaliveMonitor {
    registry: Arc<SessionRegistry>,
    stale_after: Duration,
    sweep_interval: Duration,
}

impl KeepaliveMonitor {
    /// Create a monitor.
    pub fn new(registry: Arc<SessionRegistry>, stale_after: Duration, sweep_interval: Duration) -> Self {
        Self {
            registry,
            stale_after,
            sweep_interval,
        }
    }

    /// Silence threshold.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Sweep as of now.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Sweep as of `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        self.sweep_sessions(self.registry.snapshot().sessions, now)
    }

    /// Evict the stale members of `sessions`, typically a registry snapshot
    /// that may already be out of date.
    ///
    /// A failure on one session never stops the sweep for the others.
    pub fn sweep_sessions(&self, sessions: Vec<Session>, now: Instant) -> SweepReport {
        let mut report = SweepReport {
            inspected: sessions.len(),
            ..SweepReport::default()
        };

        for session in sessions {
            let silence = session.connection().silence(now);
            if silence <= self.stale_after {
                continue;
            }
            warn!(
                user_id = %session.user_id(),
                connection_id = %session.connection_id(),
                silent_ms = silence.as_millis() as u64,
                "heartbeat timeout, evicting session"
            );
            let _ = session.connection().close(CloseReason::HeartbeatTimeout);

            match self.registry.unregister(session.user_id(), session.connection_id()) {
                Ok(_) => {
                    counter!(KEEPALIVE_EVICTIONS_TOTAL).increment(1);
                    report
                        .evicted
                        .push((session.user_id().clone(), session.connection_id().clone()));
                }
                Err(e) if !e.is_fatal() => {
                    debug!(user_id = %session.user_id(), error = %e, "stale session already replaced");
                    report.already_replaced += 1;
                }
                Err(e) => {
                    warn!(user_id = %session.user_id(), error = %e, "failed to evict stale session");
                }
            }
        }

        if !report.evicted.is_empty() {
            info!(
                inspected = report.inspected,
                evicted = report.evicted.len(),
                "keepalive sweep evicted sessions"
            );
        }
        report
    }

    /// Sweep every `sweep_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep();
                }
                () = cancel.cancelled() => {
                    debug!("keepalive monitor stopped");
                    return;
                }
            }
        }
    }
}

//! Metric names, their help text, and the Prometheus recorder behind `/metrics`.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
pub use metrics_exporter_prometheus::PrometheusHandle;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::info;

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Broadcast drops total (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Handshakes rejected total (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Registered sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Logins that displaced an existing session (counter).
pub const SESSION_CONFLICTS_TOTAL: &str = "session_conflicts_total";
/// Invalidations performed (counter, labels: delivery).
pub const INVALIDATIONS_TOTAL: &str = "invalidations_total";
/// Sessions evicted by the keepalive sweep (counter).
pub const KEEPALIVE_EVICTIONS_TOTAL: &str = "keepalive_evictions_total";
/// HTTP logins total (counter, labels: outcome).
pub const LOGINS_TOTAL: &str = "logins_total";

/// Attach `# HELP` text and units to every metric the gateway records.
///
/// Goes to whichever recorder is current, so call it after installing one.
pub fn describe() {
    describe_counter!(WS_CONNECTIONS_TOTAL, Unit::Count, "WebSocket upgrades accepted");
    describe_counter!(WS_DISCONNECTIONS_TOTAL, Unit::Count, "WebSocket connections closed");
    describe_gauge!(WS_CONNECTIONS_ACTIVE, Unit::Count, "Open WebSocket connections");
    describe_histogram!(
        WS_CONNECTION_DURATION_SECONDS,
        Unit::Seconds,
        "Lifetime of a WebSocket connection"
    );
    describe_counter!(
        WS_BROADCAST_DROPS_TOTAL,
        Unit::Count,
        "session_update frames dropped on a full outbound queue"
    );
    describe_counter!(
        WS_HANDSHAKE_REJECTIONS_TOTAL,
        Unit::Count,
        "WebSocket handshakes refused by reason"
    );
    describe_gauge!(SESSIONS_ACTIVE, Unit::Count, "Users holding the active session");
    describe_counter!(
        SESSION_CONFLICTS_TOTAL,
        Unit::Count,
        "Logins that displaced another connection of the same user"
    );
    describe_counter!(
        INVALIDATIONS_TOTAL,
        Unit::Count,
        "force_logout dispatches by delivery outcome"
    );
    describe_counter!(
        KEEPALIVE_EVICTIONS_TOTAL,
        Unit::Count,
        "Sessions dropped for missing heartbeats"
    );
    describe_counter!(LOGINS_TOTAL, Unit::Count, "Password logins by outcome");
}

/// Install the global Prometheus recorder and describe the gateway metrics.
///
/// Call once at startup. A second call fails with
/// [`BuildError::FailedToSetGlobalRecorder`].
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle to a recorder that nothing writes to. Used where a server is
/// built without touching the process-wide recorder.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Prometheus text exposition for `/metrics`.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders_nothing() {
        assert!(render(&detached_handle()).trim().is_empty());
    }

    #[test]
    fn recorded_login_outcome_is_exported_with_help() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!(LOGINS_TOTAL, "outcome" => "rejected").increment(2);
            metrics::gauge!(SESSIONS_ACTIVE).set(3.0);
        });

        let text = render(&handle);
        assert!(text.contains("# HELP logins_total Password logins by outcome"), "{text}");
        assert!(text.contains(r#"logins_total{outcome="rejected"} 2"#), "{text}");
        assert!(text.contains("sessions_active 3"), "{text}");
    }
}

//! Server configuration.

use std::time::Duration;

use solo_settings::SoloSettings;

/// Runtime configuration for [`crate::server::SoloServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Origins allowed by CORS. Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// Expected client heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Silence after which a session is evicted.
    pub stale_after: Duration,
    /// Keepalive sweep period.
    pub sweep_interval: Duration,
    /// Delay between a delivered invalidation notice and the close.
    pub grace_period: Duration,
    /// Bound on the single invalidation send attempt.
    pub send_timeout: Duration,
    /// How long graceful shutdown waits for background tasks.
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &SoloSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            cors_origins: settings.server.cors_origins.clone(),
            outbound_queue: settings.server.outbound_queue,
            heartbeat_interval: settings.keepalive.heartbeat_interval(),
            stale_after: settings.keepalive.stale_after(),
            sweep_interval: settings.keepalive.sweep_interval(),
            grace_period: settings.invalidation.grace_period(),
            send_timeout: settings.invalidation.send_timeout(),
            ..Self::default()
        }
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            cors_origins: Vec::new(),
            outbound_queue: 64,
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            grace_period: Duration::from_millis(500),
            send_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_any_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_keepalive_policy() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.stale_after, cfg.heartbeat_interval * 2);
        assert!(cfg.sweep_interval <= cfg.heartbeat_interval);
    }

    #[test]
    fn from_settings_copies_values() {
        let mut settings = SoloSettings::default();
        settings.server.port = 9100;
        settings.keepalive.heartbeat_interval_ms = 10_000;
        settings.keepalive.stale_multiplier = 3;
        settings.invalidation.grace_period_ms = 0;

        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.stale_after, Duration::from_secs(30));
        assert_eq!(cfg.grace_period, Duration::ZERO);
        assert_eq!(cfg.cors_origins, vec!["http://localhost:3000".to_string()]);
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may carry any subset of fields; missing ones take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "keepalive": { "heartbeatIntervalMs": 15000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SoloSettings {
    /// HTTP / WebSocket listener settings.
    pub server: ServerSettings,
    /// Heartbeat and liveness sweep policy.
    pub keepalive: KeepaliveSettings,
    /// Forced-invalidation delivery policy.
    pub invalidation: InvalidationSettings,
    /// Access tokens and the built-in account directory.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl SoloSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let keepalive = &self.keepalive;
        if keepalive.heartbeat_interval_ms == 0 {
            return Err(SettingsError::constraint(
                "keepalive.heartbeatIntervalMs",
                "must be positive",
            ));
        }
        if keepalive.sweep_interval_ms == 0
            || keepalive.sweep_interval_ms > keepalive.heartbeat_interval_ms
        {
            return Err(SettingsError::constraint(
                "keepalive.sweepIntervalMs",
                format!(
                    "{} must be between 1 and heartbeatIntervalMs ({})",
                    keepalive.sweep_interval_ms, keepalive.heartbeat_interval_ms
                ),
            ));
        }
        if keepalive.stale_multiplier < 1 {
            return Err(SettingsError::constraint(
                "keepalive.staleMultiplier",
                "must be at least 1",
            ));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::constraint("auth.jwtSecret", "must not be empty"));
        }
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::constraint("server.outboundQueue", "must be positive"));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Origins allowed by CORS. Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            outbound_queue: 64,
        }
    }
}

/// Heartbeat policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Expected heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How often the monitor sweeps, in milliseconds. Must not exceed the
    /// heartbeat interval.
    pub sweep_interval_ms: u64,
    /// A connection silent for longer than `staleMultiplier` intervals is evicted.
    pub stale_multiplier: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            sweep_interval_ms: 15_000,
            stale_multiplier: 2,
        }
    }
}

impl KeepaliveSettings {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Silence threshold after which a connection is stale.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.stale_multiplier
    }
}

/// Forced-invalidation policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvalidationSettings {
    /// Delay between a delivered notice and the server-side close.
    pub grace_period_ms: u64,
    /// Upper bound on the single notice send attempt.
    pub send_timeout_ms: u64,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 500,
            send_timeout_ms: 2_000,
        }
    }
}

impl InvalidationSettings {
    /// Grace window as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Send bound as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// One entry of the built-in account directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    /// Login name; doubles as the user id.
    pub username: String,
    /// Plain-text password. Verification policy lives outside this crate.
    pub password: String,
    /// Display name.
    pub name: String,
    /// Whether the user may see administrative views.
    #[serde(default)]
    pub is_admin: bool,
}

impl AccountSettings {
    fn new(username: &str, password: &str, name: &str, is_admin: bool) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            name: name.to_string(),
            is_admin,
        }
    }
}

/// Access-token and account settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC secret for access tokens.
    pub jwt_secret: String,
    /// Access-token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Built-in account directory.
    pub accounts: Vec<AccountSettings>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            token_ttl_secs: 3_600,
            accounts: vec![
                AccountSettings::new("user1", "password1", "User One", true),
                AccountSettings::new("user2", "password2", "User Two", false),
                AccountSettings::new("user3", "password3", "User Three", false),
            ],
        }
    }
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: LogLevel,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Output format for [`solo_core::logging::init_subscriber`].
    pub fn format(&self) -> solo_core::logging::LogFormat {
        if self.json {
            solo_core::logging::LogFormat::Json
        } else {
            solo_core::logging::LogFormat::Compact
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_validate() {
        SoloSettings::default().validate().unwrap();
    }

    #[test]
    fn keepalive_defaults() {
        let k = KeepaliveSettings::default();
        assert_eq!(k.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(k.stale_after(), Duration::from_secs(60));
        assert!(k.sweep_interval() <= k.heartbeat_interval());
    }

    #[test]
    fn sweep_longer_than_heartbeat_rejected() {
        let mut s = SoloSettings::default();
        s.keepalive.sweep_interval_ms = s.keepalive.heartbeat_interval_ms + 1;
        assert_matches!(
            s.validate(),
            Err(SettingsError::Constraint { field: "keepalive.sweepIntervalMs", .. })
        );
    }

    #[test]
    fn zero_multiplier_rejected() {
        let mut s = SoloSettings::default();
        s.keepalive.stale_multiplier = 0;
        assert_eq!(
            s.validate().unwrap_err().field(),
            Some("keepalive.staleMultiplier")
        );
    }

    #[test]
    fn empty_secret_rejected() {
        let mut s = SoloSettings::default();
        s.auth.jwt_secret.clear();
        assert_eq!(
            s.validate().unwrap_err().to_string(),
            "auth.jwtSecret: must not be empty"
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: SoloSettings =
            serde_json::from_str(r#"{"keepalive":{"heartbeatIntervalMs":10000}}"#).unwrap();
        assert_eq!(s.keepalive.heartbeat_interval_ms, 10_000);
        assert_eq!(s.keepalive.sweep_interval_ms, 15_000);
        assert_eq!(s.server.port, 8000);
    }

    #[test]
    fn camel_case_field_names() {
        let json = serde_json::to_value(SoloSettings::default()).unwrap();
        assert!(json["keepalive"].get("heartbeatIntervalMs").is_some());
        assert!(json["invalidation"].get("gracePeriodMs").is_some());
        assert!(json["auth"].get("tokenTtlSecs").is_some());
        assert!(json["auth"]["accounts"][0].get("isAdmin").is_some());
    }

    #[test]
    fn default_accounts() {
        let auth = AuthSettings::default();
        assert_eq!(auth.accounts.len(), 3);
        assert!(auth.accounts[0].is_admin);
        assert_eq!(auth.accounts[1].username, "user2");
    }

    #[test]
    fn log_level_filter_strings() {
        assert_eq!(LogLevel::Debug.as_filter_str(), "debug");
        assert_eq!(LogLevel::default().as_filter_str(), "info");
    }

    #[test]
    fn logging_format_follows_json_flag() {
        let mut l = LoggingSettings::default();
        assert_eq!(l.format(), solo_core::logging::LogFormat::Compact);
        l.json = true;
        assert_eq!(l.format(), solo_core::logging::LogFormat::Json);
    }
}

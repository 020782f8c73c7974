//! Push-channel wire protocol.
//!
//! Every server-to-client frame is a JSON object whose `type` field names the
//! message kind. Clients send either the bare heartbeat token or a tagged JSON
//! object; anything else is an application message that only refreshes
//! liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// Bare-text heartbeat token sent by clients.
pub const HEARTBEAT_TOKEN: &str = "heartbeat";

/// Legacy bare-text liveness probe, treated exactly like [`HEARTBEAT_TOKEN`].
pub const PING_TOKEN: &str = "ping";

/// Human-readable text shipped with every forced-logout notice.
const FORCE_LOGOUT_MESSAGE: &str = "Signed in from another location. This session has ended.";

/// Why a session was invalidated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// The same user authenticated from a newer client.
    NewLoginElsewhere,
}

/// Payload delivered to a superseded session before its channel closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationNotice {
    /// Why the session ended.
    pub reason: InvalidationReason,
    /// When the superseding login was registered.
    pub occurred_at: DateTime<Utc>,
    /// Best-effort description of the new session (client label).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseding_context: Option<String>,
    /// Text suitable for showing to the user as-is.
    pub message: String,
}

impl InvalidationNotice {
    /// Build a `NewLoginElsewhere` notice stamped with the current time.
    #[must_use]
    pub fn new_login_elsewhere(superseding_context: Option<String>) -> Self {
        Self {
            reason: InvalidationReason::NewLoginElsewhere,
            occurred_at: Utc::now(),
            superseding_context,
            message: FORCE_LOGOUT_MESSAGE.to_string(),
        }
    }
}

/// Server-to-client message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the channel opens.
    ConnectionEstablished {
        /// The server-assigned connection id.
        connection_id: ConnectionId,
        /// Server time at open.
        timestamp: DateTime<Utc>,
    },
    /// Answer to a client heartbeat.
    Heartbeat {
        /// Server time of the answer.
        timestamp: DateTime<Utc>,
    },
    /// The session was superseded; the client should present this and close.
    ForceLogout(InvalidationNotice),
    /// The active-session set changed; observers should refresh.
    SessionUpdate {
        /// Registry epoch after the change.
        epoch: u64,
    },
}

impl ServerMessage {
    /// Heartbeat answer stamped with the current time.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    /// Wire discriminant of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::Heartbeat { .. } => "heartbeat",
            Self::ForceLogout(_) => "force_logout",
            Self::SessionUpdate { .. } => "session_update",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedClientMessage {
    Heartbeat,
}

/// Client-to-server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Liveness signal.
    Heartbeat,
    /// Any other payload. Refreshes liveness, otherwise ignored.
    Other(String),
}

impl ClientMessage {
    /// Classify an inbound text frame.
    pub fn decode(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed == HEARTBEAT_TOKEN || trimmed == PING_TOKEN {
            return Self::Heartbeat;
        }
        match serde_json::from_str::<TaggedClientMessage>(trimmed) {
            Ok(TaggedClientMessage::Heartbeat) => Self::Heartbeat,
            Err(_) => Self::Other(text.to_string()),
        }
    }
}

/// Why the server closed a channel. Maps onto WebSocket close codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Replaced by a newer login for the same user.
    Superseded,
    /// Explicit logout.
    Logout,
    /// No liveness signal within the staleness threshold.
    HeartbeatTimeout,
    /// The client or transport went away.
    TransportClosed,
    /// The server is shutting down.
    Shutdown,
    /// Handshake carried no access token.
    TokenMissing,
    /// Token subject differs from the requested user id.
    UserMismatch,
    /// Token failed verification.
    TokenInvalid,
    /// The registry refused the registration.
    RegistryUnavailable,
}

impl CloseReason {
    /// WebSocket close code.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Superseded => 4000,
            Self::TokenMissing => 4001,
            Self::UserMismatch => 4002,
            Self::TokenInvalid => 4003,
            Self::Logout | Self::HeartbeatTimeout | Self::TransportClosed => 1000,
            Self::Shutdown => 1001,
            Self::RegistryUnavailable => 1013,
        }
    }

    /// Close-frame reason text.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Superseded => "New login elsewhere",
            Self::Logout => "Logout",
            Self::HeartbeatTimeout => "Timeout",
            Self::TransportClosed => "Closed",
            Self::Shutdown => "Server shutting down",
            Self::TokenMissing => "Token missing",
            Self::UserMismatch => "User ID mismatch",
            Self::TokenInvalid => "Token validation failed",
            Self::RegistryUnavailable => "Try again later",
        }
    }
}

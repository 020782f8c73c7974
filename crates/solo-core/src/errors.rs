//! Session error taxonomy.
//!
//! Three outcomes can go wrong in the session core, and only one of them is
//! fatal to the caller:
//!
//! - [`SessionError::ChannelClosed`]: a send or close hit a handle that is no
//!   longer open. The desired outcome (a dead channel) already holds.
//! - [`SessionError::StaleUnregister`]: compare-and-remove found a different
//!   connection registered. A newer login won the race.
//! - [`SessionError::RegistryUnavailable`]: the registry cannot give an
//!   authoritative prior-session answer. The login must be retried.

use thiserror::Error;

use crate::ids::{ConnectionId, UserId};

/// Errors raised by the session registry, connection handles and gateway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Send or close attempted on a handle that is not open.
    #[error("channel closed: {connection_id}")]
    ChannelClosed {
        /// The connection that rejected the operation.
        connection_id: ConnectionId,
    },

    /// Compare-and-remove target mismatch.
    #[error("stale unregister for {user_id}: {expected} is no longer the registered connection")]
    StaleUnregister {
        /// User whose entry was targeted.
        user_id: UserId,
        /// Connection the caller expected to remove.
        expected: ConnectionId,
    },

    /// The registry could not serve the request.
    #[error("session registry unavailable: {0}")]
    RegistryUnavailable(String),
}

impl SessionError {
    /// Whether the caller may retry the same operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(_))
    }

    /// Whether the error should fail the surrounding operation.
    ///
    /// `ChannelClosed` and `StaleUnregister` describe outcomes that are
    /// already correct and are absorbed by the gateway.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(_))
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChannelClosed { .. } => "CHANNEL_CLOSED",
            Self::StaleUnregister { .. } => "STALE_UNREGISTER",
            Self::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

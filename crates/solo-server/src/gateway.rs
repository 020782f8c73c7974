//! Entry points the authentication and transport layers call into.

use std::sync::Arc;

use metrics::{counter, gauge};
use solo_core::{CloseReason, ConnectionId, SessionError, TokenId, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{InvalidationDispatcher, InvalidationOutcome};
use crate::metrics::{SESSION_CONFLICTS_TOTAL, SESSIONS_ACTIVE};
use crate::query::{ActiveSessions, SessionQueryService};
use crate::registry::{Session, SessionRegistry};
use crate::websocket::connection::ConnectionHandle;

/// Result of a successful login registration.
#[derive(Debug)]
pub struct LoginOutcome {
    /// Session the login displaced, if any.
    pub displaced: Option<Session>,
    /// Background invalidation of the displaced session.
    pub dispatch: Option<JoinHandle<InvalidationOutcome>>,
}

impl LoginOutcome {
    /// Whether this login replaced an existing session.
    pub fn was_conflict(&self) -> bool {
        self.displaced.is_some()
    }
}

/// Ties the registry, dispatcher and query service together.
pub struct SessionGateway {
    registry: Arc<SessionRegistry>,
    dispatcher: InvalidationDispatcher,
    query: SessionQueryService,
}

impl SessionGateway {
    /// Create a gateway.
    pub fn new(registry: Arc<SessionRegistry>, dispatcher: InvalidationDispatcher) -> Self {
        let query = SessionQueryService::new(Arc::clone(&registry));
        Self {
            registry,
            dispatcher,
            query,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register `connection` as the session of `user_id`.
    ///
    /// Fails with `ChannelClosed` if the client already left, leaving any
    /// existing session untouched, and with `RegistryUnavailable` during
    /// shutdown. A displaced session is invalidated in the background; that
    /// work never fails the login.
    pub fn on_login_succeeded(
        &self,
        user_id: UserId,
        connection: Arc<ConnectionHandle>,
    ) -> solo_core::Result<LoginOutcome> {
        let context = connection.label().map(str::to_owned);
        let connection_id = connection.id().clone();
        if !connection.is_open() {
            return Err(SessionError::ChannelClosed { connection_id });
        }
        let displaced = self.registry.register(user_id.clone(), connection)?;
        gauge!(SESSIONS_ACTIVE).set(self.registry.len() as f64);

        let Some(prior) = displaced else {
            info!(user_id = %user_id, connection_id = %connection_id, "session established");
            return Ok(LoginOutcome {
                displaced: None,
                dispatch: None,
            });
        };

        if prior.connection_id() == &connection_id {
            debug!(user_id = %user_id, "connection re-registered");
            return Ok(LoginOutcome {
                displaced: None,
                dispatch: None,
            });
        }

        counter!(SESSION_CONFLICTS_TOTAL).increment(1);
        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            displaced = %prior.connection_id(),
            "session replaced by new login"
        );
        let dispatch = self.dispatcher.dispatch(prior.clone(), context);
        Ok(LoginOutcome {
            displaced: Some(prior),
            dispatch: Some(dispatch),
        })
    }

    /// Remove the session of `user_id` if it is still bound to
    /// `connection_id`, and close its connection. Returns whether anything
    /// was removed.
    ///
    /// A stale unregister means a newer login already won; it is ignored.
    pub fn on_logout(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        match self.registry.unregister(user_id, connection_id) {
            Ok(session) => {
                let _ = session.connection().close(CloseReason::Logout);
                gauge!(SESSIONS_ACTIVE).set(self.registry.len() as f64);
                info!(user_id = %user_id, connection_id = %connection_id, "session ended");
                true
            }
            Err(e @ SessionError::StaleUnregister { .. }) => {
                debug!(error = %e, "ignoring stale unregister");
                false
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "unregister failed");
                false
            }
        }
    }

    /// End the session of `user_id` if it was opened with `token_id`.
    /// Returns whether a session was ended.
    pub fn revoke(&self, user_id: &UserId, token_id: &TokenId) -> bool {
        let Some(session) = self.registry.lookup(user_id) else {
            return false;
        };
        if session.connection().token_id() != Some(token_id) {
            debug!(user_id = %user_id, "logout token does not own the active session");
            return false;
        }
        self.on_logout(user_id, session.connection_id())
    }

    /// Display-safe list of active sessions.
    pub fn get_active_sessions(&self) -> ActiveSessions {
        self.query.active_sessions()
    }

    /// Whether `user_id` has a live session.
    pub fn is_active(&self, user_id: &UserId) -> bool {
        self.query.is_active(user_id)
    }

    /// Refuse new logins and close every live session.
    pub fn shutdown(&self) -> usize {
        let drained = self.registry.close();
        for session in &drained {
            let _ = session.connection().close(CloseReason::Shutdown);
        }
        gauge!(SESSIONS_ACTIVE).set(0.0);
        drained.len()
    }
}

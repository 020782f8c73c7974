//! REST handlers under `/api`.

use axum::Json;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Serialize;
use solo_core::SessionError;
use tracing::{info, warn};

use crate::auth::{AuthError, Claims, Credentials, Principal};
use crate::metrics::LOGINS_TOTAL;
use crate::query::ActiveSessions;
use crate::server::AppState;

/// HTTP-facing error. Renders as `{"detail": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials or token.
    #[error("{0}")]
    Unauthorized(String),
    /// The session core cannot serve the request right now.
    #[error("{0}")]
    Unavailable(String),
    /// Unexpected failure.
    #[error("{0}")]
    Internal(String),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => Self::Unauthorized(e.to_string()),
            AuthError::TokenMissing => Self::Unauthorized("Not authenticated".into()),
            AuthError::TokenInvalid(_) => Self::Unauthorized("Could not validate credentials".into()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        if e.is_retryable() {
            Self::Unavailable(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Body of a successful login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// Bearer token for `/ws/{user_id}?token=` and `/api/auth/logout`.
    pub access_token: String,
    /// Always `"bearer"`.
    pub token_type: &'static str,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Token id; the WebSocket opened with this token is bound to it.
    pub session_id: String,
    /// The authenticated user.
    pub user: Principal,
}

/// Body of a logout.
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    /// Human-readable result.
    pub message: &'static str,
    /// Whether a live session was ended.
    pub session_ended: bool,
}

/// One entry of `GET /api/users`.
#[derive(Debug, Serialize)]
pub struct UserEntry {
    /// User fields.
    #[serde(flatten)]
    pub principal: Principal,
    /// Whether the user holds a live session.
    pub is_active: bool,
}

/// Body of `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown began.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections, including ones not yet registered.
    pub connections: usize,
    /// Registered sessions.
    pub active_sessions: usize,
    /// Current registry epoch.
    pub epoch: u64,
}

/// Body of `GET /api/users`.
#[derive(Debug, Serialize)]
pub struct UsersResponse {
    /// Every known user.
    pub users: Vec<UserEntry>,
}

fn bearer_claims(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .ok_or(AuthError::TokenMissing)?;
    Ok(state.tokens.verify(token)?)
}

/// POST /api/auth/login
///
/// Issues a token. The session itself is registered when the client opens
/// the WebSocket with that token.
pub async fn login(
    State(state): State<AppState>,
    Form(credentials): Form<Credentials>,
) -> Result<Json<LoginResponse>, ApiError> {
    let principal = match state.authenticator.authenticate(&credentials).await {
        Ok(principal) => principal,
        Err(e) => {
            counter!(LOGINS_TOTAL, "outcome" => "rejected").increment(1);
            warn!(username = %credentials.username, "login rejected");
            return Err(e.into());
        }
    };
    let issued = state.tokens.issue(&principal)?;
    counter!(LOGINS_TOTAL, "outcome" => "accepted").increment(1);
    info!(
        user_id = %principal.username,
        replaces_active = state.gateway.is_active(&principal.username),
        "login accepted"
    );
    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        token_type: "bearer",
        expires_in: issued.expires_in,
        session_id: issued.token_id.to_string(),
        user: principal,
    }))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, ApiError> {
    let claims = bearer_claims(&state, &headers)?;
    let session_ended = state.gateway.revoke(&claims.user_id(), &claims.token_id());
    info!(user_id = %claims.sub, session_ended, "logout");
    Ok(Json(LogoutResponse {
        message: "Logout successful",
        session_ended,
    }))
}

/// GET /api/auth/active-sessions
pub async fn active_sessions(State(state): State<AppState>) -> Json<ActiveSessions> {
    Json(state.gateway.get_active_sessions())
}

/// GET /api/users
pub async fn users(State(state): State<AppState>) -> Json<UsersResponse> {
    let users = state
        .authenticator
        .principals()
        .into_iter()
        .map(|principal| UserEntry {
            is_active: state.gateway.is_active(&principal.username),
            principal,
        })
        .collect();
    Json(UsersResponse { users })
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.gateway.registry();
    Json(HealthResponse {
        status: if state.shutdown.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.broadcast.connection_count().await,
        active_sessions: registry.len(),
        epoch: registry.epoch(),
    })
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}

//! `SoloServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderValue;
use axum::response::Response;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use solo_core::UserId;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{Authenticator, TokenIssuer};
use crate::config::ServerConfig;
use crate::dispatcher::InvalidationDispatcher;
use crate::gateway::SessionGateway;
use crate::http;
use crate::keepalive::KeepaliveMonitor;
use crate::registry::SessionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::websocket::broadcast::SessionBroadcaster;
use crate::websocket::session::{WsContext, WsParams, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Login, logout and query entry points.
    pub gateway: Arc<SessionGateway>,
    /// `session_update` fan-out to open connections.
    pub broadcast: Arc<SessionBroadcaster>,
    /// Credential check.
    pub authenticator: Arc<dyn Authenticator>,
    /// Access-token issue and verification.
    pub tokens: Arc<TokenIssuer>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
    /// When the server started.
    pub start_time: Instant,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// Server ping period on each socket.
    pub ping_interval: Duration,
}

impl AppState {
    fn ws_context(&self) -> WsContext {
        WsContext {
            gateway: Arc::clone(&self.gateway),
            broadcast: Arc::clone(&self.broadcast),
            tokens: Arc::clone(&self.tokens),
            outbound_queue: self.outbound_queue,
            ping_interval: self.ping_interval,
            shutdown: self.shutdown.token(),
        }
    }
}

/// The single-session gateway server.
pub struct SoloServer {
    config: ServerConfig,
    gateway: Arc<SessionGateway>,
    broadcast: Arc<SessionBroadcaster>,
    keepalive: Arc<KeepaliveMonitor>,
    authenticator: Arc<dyn Authenticator>,
    tokens: Arc<TokenIssuer>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl SoloServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        tokens: TokenIssuer,
        metrics: PrometheusHandle,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = InvalidationDispatcher::new(config.grace_period, config.send_timeout);
        let keepalive = Arc::new(KeepaliveMonitor::new(
            Arc::clone(&registry),
            config.stale_after,
            config.sweep_interval,
        ));
        Self {
            gateway: Arc::new(SessionGateway::new(registry, dispatcher)),
            broadcast: Arc::new(SessionBroadcaster::new()),
            keepalive,
            authenticator,
            tokens: Arc::new(tokens),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
            config,
        }
    }

    fn state(&self) -> AppState {
        AppState {
            gateway: Arc::clone(&self.gateway),
            broadcast: Arc::clone(&self.broadcast),
            authenticator: Arc::clone(&self.authenticator),
            tokens: Arc::clone(&self.tokens),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            outbound_queue: self.config.outbound_queue,
            ping_interval: self.config.heartbeat_interval,
        }
    }

    fn cors(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .config
            .cors_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        if origins.is_empty() {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/auth/login", post(http::login))
            .route("/api/auth/logout", post(http::logout))
            .route("/api/auth/active-sessions", get(http::active_sessions))
            .route("/api/users", get(http::users))
            .route("/api/health", get(http::health))
            .route("/metrics", get(http::metrics))
            .route("/ws/{user_id}", get(ws_handler))
            .with_state(self.state())
            .layer(self.cors())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, then serve in the background together with the keepalive
    /// monitor and the `session_update` bridge. All three are tracked by the
    /// shutdown coordinator.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        self.shutdown.track(
            "keepalive",
            tokio::spawn(Arc::clone(&self.keepalive).run(token.clone())),
        );
        self.shutdown.track(
            "session-bridge",
            tokio::spawn(
                Arc::clone(&self.broadcast)
                    .run_bridge(self.gateway.registry().subscribe(), token.clone()),
            ),
        );
        self.shutdown.track(
            "http",
            tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(e) = serve.await {
                    warn!(error = %e, "server exited with error");
                }
            }),
        );

        info!(%addr, "solo server listening");
        Ok(addr)
    }

    /// Close every session and stop the background tasks, waiting at most
    /// the configured shutdown timeout.
    pub async fn shutdown_gracefully(&self) -> ShutdownReport {
        self.shutdown
            .graceful_shutdown(&self.gateway, self.config.shutdown_timeout)
            .await
    }

    /// Login, logout and query entry points.
    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.gateway
    }

    /// Connection fan-out.
    pub fn broadcast(&self) -> &Arc<SessionBroadcaster> {
        &self.broadcast
    }

    /// Keepalive monitor.
    pub fn keepalive(&self) -> &Arc<KeepaliveMonitor> {
        &self.keepalive
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws/{user_id}
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let ctx = state.ws_context();
    let user_id = UserId::from(user_id);
    ws.on_upgrade(move |socket| run_ws_session(socket, user_id, params, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Credentials, MockAuthenticator, Principal};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn principal(name: &str) -> Principal {
        Principal {
            username: UserId::from(name),
            name: name.to_uppercase(),
            is_admin: false,
        }
    }

    fn make_server(auth: MockAuthenticator) -> SoloServer {
        SoloServer::new(
            ServerConfig::default(),
            Arc::new(auth),
            TokenIssuer::new("test-secret", 3600),
            crate::metrics::detached_handle(),
        )
    }

    fn accepting_auth() -> MockAuthenticator {
        let mut auth = MockAuthenticator::new();
        let _ = auth.expect_authenticate().returning(|c: &Credentials| {
            if c.password == "secret" {
                Ok(principal(&c.username))
            } else {
                Err(AuthError::InvalidCredentials)
            }
        });
        let _ = auth
            .expect_principals()
            .returning(|| vec![principal("user1"), principal("user2")]);
        auth
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn login_request(user: &str, password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("username={user}&password={password}")))
            .unwrap()
    }

    #[tokio::test]
    async fn login_returns_bearer_token() {
        let server = make_server(accepting_auth());
        let resp = server
            .router()
            .oneshot(login_request("user1", "secret"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json(resp).await;
        assert_eq!(body["token_type"], "bearer");
        assert_eq!(body["user"]["username"], "user1");
        assert_eq!(body["expires_in"], 3600);
        let token = body["access_token"].as_str().unwrap();
        let claims = server.tokens.verify(token).unwrap();
        assert_eq!(claims.sid, body["session_id"].as_str().unwrap());
    }

    #[tokio::test]
    async fn login_with_bad_password_is_401() {
        let server = make_server(accepting_auth());
        let resp = server
            .router()
            .oneshot(login_request("user1", "nope"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(resp).await["detail"], "Incorrect username or password");
    }

    #[tokio::test]
    async fn logout_without_token_is_401() {
        let server = make_server(accepting_auth());
        let req = Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_with_token_but_no_session() {
        let server = make_server(accepting_auth());
        let token = server.tokens.issue(&principal("user1")).unwrap().access_token;
        let req = Request::builder()
            .method("POST")
            .uri("/api/auth/logout")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["message"], "Logout successful");
        assert_eq!(body["session_ended"], false);
    }

    #[tokio::test]
    async fn active_sessions_starts_empty() {
        let server = make_server(accepting_auth());
        let resp = server
            .router()
            .oneshot(get_request("/api/auth/active-sessions"))
            .await
            .unwrap();
        let body = json(resp).await;
        assert_eq!(body["count"], 0);
        assert!(body["sessions"].as_array().unwrap().is_empty());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn users_lists_principals_with_activity() {
        let server = make_server(accepting_auth());
        let resp = server.router().oneshot(get_request("/api/users")).await.unwrap();
        let body = json(resp).await;
        let users = body["users"].as_array().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0]["username"], "user1");
        assert_eq!(users[0]["is_active"], false);
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server(MockAuthenticator::new());
        let resp = server.router().oneshot(get_request("/api/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["epoch"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let server = make_server(MockAuthenticator::new());
        let resp = server.router().oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn listen_tracks_background_tasks() {
        let server = make_server(MockAuthenticator::new());
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.shutdown().tracked(), 3);

        let report = server.shutdown_gracefully().await;
        assert_eq!(report.finished_tasks, 3);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(MockAuthenticator::new());
        let resp = server.router().oneshot(get_request("/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_flips_health_status() {
        let server = make_server(MockAuthenticator::new());
        let report = server.shutdown_gracefully().await;
        assert!(report.is_clean());
        assert!(server.shutdown().is_shutting_down());
        assert!(!server.gateway().registry().is_accepting());

        let resp = server.router().oneshot(get_request("/api/health")).await.unwrap();
        assert_eq!(json(resp).await["status"], "shutting_down");
    }
}

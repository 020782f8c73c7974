//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use solo_core::{ClientMessage, CloseReason, ConnectionId, ServerMessage, SessionError, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::broadcast::SessionBroadcaster;
use super::connection::ConnectionHandle;
use crate::auth::{AuthError, Claims, TokenIssuer};
use crate::gateway::SessionGateway;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_HANDSHAKE_REJECTIONS_TOTAL,
};

/// How long the session waits for the writer to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Query string of `GET /ws/{user_id}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WsParams {
    /// Access token from the login response.
    pub token: Option<String>,
    /// Free-form client label shown to the session it displaces.
    pub client: Option<String>,
}

/// Everything a WebSocket session needs from the server.
#[derive(Clone)]
pub struct WsContext {
    /// Session core entry points.
    pub gateway: Arc<SessionGateway>,
    /// `session_update` fan-out.
    pub broadcast: Arc<SessionBroadcaster>,
    /// Access-token verification.
    pub tokens: Arc<TokenIssuer>,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

/// Check the handshake token against the requested user.
pub fn authorize(
    tokens: &TokenIssuer,
    requested: &UserId,
    token: Option<&str>,
) -> Result<Claims, CloseReason> {
    let token = token.filter(|t| !t.is_empty()).ok_or(CloseReason::TokenMissing)?;
    let claims = tokens.verify(token).map_err(|e| match e {
        AuthError::TokenMissing => CloseReason::TokenMissing,
        AuthError::TokenInvalid(_) | AuthError::InvalidCredentials => CloseReason::TokenInvalid,
    })?;
    if &claims.user_id() != requested {
        return Err(CloseReason::UserMismatch);
    }
    Ok(claims)
}

fn close_frame(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.description().into(),
    }))
}

/// Run a WebSocket session for a connected client.
///
/// 1. Verifies the token and closes with 4001/4002/4003 on failure
/// 2. Sends `connection_established`
/// 3. Registers the connection as the user's session, displacing any other
/// 4. Answers heartbeats and refreshes liveness on every inbound frame
/// 5. Unregisters (compare-and-remove) on disconnect
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn run_ws_session(mut ws: WebSocket, user_id: UserId, params: WsParams, ctx: WsContext) {
    let claims = match authorize(&ctx.tokens, &user_id, params.token.as_deref()) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(code = reason.code(), reason = reason.description(), "websocket handshake rejected");
            counter!(WS_HANDSHAKE_REJECTIONS_TOTAL, "reason" => reason.description()).increment(1);
            let _ = ws.send(close_frame(reason)).await;
            return;
        }
    };

    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(ctx.outbound_queue.max(1));
    let connection = Arc::new(
        ConnectionHandle::new(ConnectionId::new(), send_tx)
            .with_label(params.client)
            .with_token_id(claims.token_id()),
    );
    let _ = connection.mark_open();
    let connection_id = connection.id().clone();

    let connection_start = Instant::now();
    info!(connection_id = %connection_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(run_writer(
        ws_tx,
        send_rx,
        Arc::clone(&connection),
        ctx.ping_interval,
    ));

    let established = ServerMessage::ConnectionEstablished {
        connection_id: connection_id.clone(),
        timestamp: chrono::Utc::now(),
    };
    if let Err(e) = connection.send(&established).await {
        debug!(error = %e, "client gone before handshake completed");
    }

    ctx.broadcast.add(Arc::clone(&connection)).await;

    match ctx
        .gateway
        .on_login_succeeded(user_id.clone(), Arc::clone(&connection))
    {
        Ok(outcome) => {
            if let Some(prior) = outcome.displaced {
                debug!(displaced = %prior.connection_id(), "displaced previous session");
            }
        }
        Err(e @ SessionError::ChannelClosed { .. }) => {
            debug!(error = %e, "client left before registration");
        }
        Err(e @ SessionError::RegistryUnavailable(_)) => {
            warn!(error = %e, "registration refused");
            let _ = connection.close(CloseReason::RegistryUnavailable);
        }
        Err(e) => {
            warn!(error = %e, "registration failed");
            let _ = connection.close(CloseReason::RegistryUnavailable);
        }
    }

    // Process incoming frames until the client leaves or the handle closes
    loop {
        tokio::select! {
            () = connection.closed() => break,
            () = ctx.shutdown.cancelled() => {
                let _ = connection.close(CloseReason::Shutdown);
                break;
            }
            frame = ws_rx.next() => {
                let Some(Ok(msg)) = frame else { break };
                match msg {
                    Message::Text(text) => {
                        connection.touch();
                        match ClientMessage::decode(&text) {
                            ClientMessage::Heartbeat => {
                                if let Err(e) = connection.send(&ServerMessage::heartbeat()).await {
                                    debug!(error = %e, "heartbeat ack not sent");
                                }
                            }
                            ClientMessage::Other(payload) => {
                                debug!(len = payload.len(), "client message");
                            }
                        }
                    }
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => connection.touch(),
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break;
                    }
                }
            }
        }
    }

    // Clean up
    let _ = connection.close(CloseReason::TransportClosed);
    let _ = ctx.gateway.on_logout(&user_id, &connection_id);
    ctx.broadcast.remove(&connection_id).await;

    let mut writer = writer;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!("writer did not finish in time, aborting");
        writer.abort();
    }
    connection.finish();

    info!(
        connection_id = %connection_id,
        reason = connection.close_reason().map(CloseReason::description),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

/// Forward queued frames to the socket, ping periodically, and send the close
/// frame once the handle is closed.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    connection: Arc<ConnectionHandle>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                    connection.finish();
                    return;
                }
            }
            () = connection.closed() => break,
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    connection.finish();
                    return;
                }
            }
        }
    }

    // Flush anything queued before the close was requested
    while let Ok(text) = send_rx.try_recv() {
        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
            connection.finish();
            return;
        }
    }

    let reason = connection.close_reason().unwrap_or(CloseReason::TransportClosed);
    if reason != CloseReason::TransportClosed {
        let _ = ws_tx.send(close_frame(reason)).await;
    }
    let _ = ws_tx.close().await;
    connection.finish();
}

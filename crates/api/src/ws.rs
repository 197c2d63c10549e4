//! WebSocket endpoint of the realtime transport.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use axum_extra::{headers, TypedHeader};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};
use tradedesk_core::UserId;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Who is on the other end, as declared in the connect URL.
/// Only used for logging; every event carries its own actor fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub is_admin: bool,
}

/// WebSocket upgrade handler. Refuses origins outside the allow-list.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(identity): Query<ClientIdentity>,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    headers: HeaderMap,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .map(|o| state.config.origin_allowed(o))
            .unwrap_or(false);
        if !allowed {
            warn!(origin = ?origin, "Rejected WebSocket upgrade from disallowed origin");
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }

    let agent = user_agent
        .map(|TypedHeader(ua)| ua.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(user_agent = %agent, user_id = ?identity.user_id, "WebSocket upgrade");

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Drive one connection until it closes, then drop its room memberships.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: ClientIdentity) {
    let (conn, mut outbound) = state.rooms.connect().await;
    let span = tracing::info_span!(
        "ws",
        conn = %conn,
        user_id = ?identity.user_id,
        admin = identity.is_admin
    );

    async move {
        let (mut sender, mut receiver) = socket.split();
        info!("Client connected");

        let ping_interval = state.config.ping_interval();
        let idle_timeout = state.config.idle_timeout();

        // Outbound: queued events plus periodic protocol pings.
        let send_task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(ping_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        event = outbound.recv() => {
                            let Some(event) = event else { break };
                            match event.to_frame() {
                                Ok(json) => {
                                    if sender.send(Message::Text(json.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Failed to encode event"),
                            }
                        }
                        _ = ticker.tick() => {
                            if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = sender.close().await;
            }
            .in_current_span(),
        );

        // Inbound: events are handled one at a time, in arrival order.
        loop {
            match tokio::time::timeout(idle_timeout, receiver.next()).await {
                Err(_) => {
                    info!(idle_secs = idle_timeout.as_secs(), "Closing idle connection");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(Message::Text(text)))) => {
                    state.relay.handle_frame(conn, text.as_str()).await;
                }
                // Pings are answered by axum; pongs only count as liveness.
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
            }
        }

        // Dropping the registry's sender ends the send task, which closes the socket.
        let rooms = state.rooms.disconnect(conn).await;
        let abort = send_task.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, send_task).await.is_err() {
            abort.abort();
        }
        info!(rooms = rooms.len(), "Client disconnected");
    }
    .instrument(span)
    .await
}

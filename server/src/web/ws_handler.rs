use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::engine::events::ServerEvent;

use super::app_state::AppState;
use super::rate_limit::client_ip;

/// GET /ws: upgrade to a voice-room control socket.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(Some(peer), &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

/// Run one connection: a writer task draining the outbound queue, a
/// keepalive task, and the reader loop on this task. Any of them ending
/// tears the connection down.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, ip: String) {
    let engine = state.engine.clone();
    let timeouts = state.timeouts.clone();
    let (conn, mut outbound) = engine.connect(&ip);
    let (mut sink, mut stream) = socket.split();

    let conn_id = conn.id;
    let write_timeout = timeouts.write_timeout;
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_wire() {
                Ok(text) => text,
                Err(e) => {
                    error!(%conn_id, kind = event.kind(), error = %e, "failed to encode event");
                    continue;
                }
            };
            match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%conn_id, error = %e, "socket write failed");
                    break;
                }
                Err(_) => {
                    warn!(%conn_id, "socket write timed out");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let keepalive_conn = conn.clone();
    let ping_interval = timeouts.ping_interval;
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            keepalive_conn.send(ServerEvent::Ping);
        }
    });

    loop {
        let next = tokio::select! {
            frame = tokio::time::timeout(timeouts.idle_timeout, stream.next()) => frame,
            _ = &mut writer => {
                debug!(%conn_id, "writer stopped");
                break;
            }
        };
        let frame = match next {
            Err(_) => {
                info!(%conn_id, %ip, "idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(%conn_id, error = %e, "socket read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => engine.handle_text(&conn, text.as_str()),
            Message::Binary(_) => {
                conn.send(ServerEvent::error(
                    "INVALID_PAYLOAD",
                    "binary frames are not supported",
                ));
            }
            Message::Close(_) => break,
            // Protocol pings are answered by axum; either way the client is alive.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    engine.disconnect(conn_id);
    keepalive.abort();
    writer.abort();
}

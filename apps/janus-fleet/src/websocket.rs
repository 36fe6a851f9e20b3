//! Client-facing acceptor.
//!
//! One WebSocket route; the connection identity comes from the `id` query
//! parameter and a connection without one is closed immediately. Each
//! accepted connection gets an outbox pump, a keepalive deadline reset by
//! any traffic, and a shutdown notifier used by superseding reconnects and
//! gateway teardown.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::protocol::{ClientEnvelope, ClientResponse, GREETING};

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the acceptor on an already-bound listener. The returned task is the
/// acceptor's lifetime; abort it to close the acceptor.
pub fn serve(gateway: Arc<Gateway>, listener: TcpListener) -> tokio::task::JoinHandle<()> {
    let app = router(gateway);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("acceptor failed: {err}");
        }
    })
}

async fn health_check() -> &'static str {
    "OK"
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    match params.get("id").cloned().filter(|id| !id.is_empty()) {
        Some(user_id) => ws.on_upgrade(move |socket| handle_socket(socket, user_id, gateway)),
        None => ws.on_upgrade(|mut socket| async move {
            // No identity on the handshake: close without exchanging frames.
            let _ = socket.send(Message::Close(None)).await;
        }),
    }
}

async fn handle_socket(socket: WebSocket, user_id: String, gateway: Arc<Gateway>) {
    info!(%user_id, "new connection");
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let shutdown = gateway.register_connection(&user_id, tx).await;

    // Outbox pump: everything addressed to this user goes out here.
    let writer = {
        let user_id = user_id.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            debug!(%user_id, "outbox pump ended");
        })
    };

    gateway.send_text(&user_id, GREETING.to_string());

    let keep_alive = gateway.config().keep_alive_timeout();
    let deadline = sleep(keep_alive);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!(%user_id, "connection shut down");
                break;
            }
            _ = &mut deadline => {
                info!(%user_id, "keepalive timeout");
                break;
            }
            frame = receiver.next() => {
                let Some(frame) = frame else { break };
                // Any traffic counts as liveness.
                deadline.as_mut().reset(Instant::now() + keep_alive);
                match frame {
                    Ok(Message::Text(text)) => handle_frame(&gateway, &user_id, &text).await,
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            handle_frame(&gateway, &user_id, &text).await;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%user_id, "socket error: {err}");
                        break;
                    }
                }
            }
        }
    }

    // A superseding connection may already own the slot; only the current
    // registration cleans up the user's handles.
    let was_current = gateway.unregister_connection(&user_id, &shutdown);
    writer.abort();
    if was_current && gateway.config().detach_on_drop {
        gateway.detach_user_handles(&user_id, None).await;
        info!(%user_id, "handles cleared");
    }
    debug!(%user_id, "connection closed");
}

async fn handle_frame(gateway: &Arc<Gateway>, user_id: &str, text: &str) {
    let response = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => gateway.process_request(user_id, envelope).await,
        Err(err) => {
            // Best-effort transaction echo off the raw JSON.
            let transaction = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|value| {
                    value
                        .get("transaction")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            warn!(%user_id, "malformed message: {err}");
            ClientResponse::error(format!("invalid message: {err}"), transaction)
        }
    };
    gateway.send_response(user_id, &response);
}

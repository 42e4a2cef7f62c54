//! WebSocket endpoint: client registration, greeting and request handling.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use super::prelude::*;
use super::rpc::{self, SUPPORTED_METHODS};
use crate::constants::{NOTIFY_CAMERA_STATUS, NOTIFY_WELCOME, SERVER_NAME, SERVER_VERSION};
use crate::protocol::notification;

/// Upper bound on a single frame write before the client is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn send_text(sink: &mut SplitSink<WebSocket, Message>, text: String) -> bool {
    match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {e}");
            false
        }
        Err(_) => {
            warn!("WebSocket write timed out after {WRITE_TIMEOUT:?}");
            false
        }
    }
}

/// Welcome notification followed by the current state of every camera.
fn greeting(state: &AppState) -> Vec<String> {
    let welcome = notification(
        NOTIFY_WELCOME,
        json!({
            "server": SERVER_NAME,
            "version": SERVER_VERSION,
            "timestamp": Utc::now(),
            "available_methods": SUPPORTED_METHODS,
        }),
    );
    std::iter::once(welcome)
        .chain(
            state
                .baseline_payloads()
                .into_iter()
                .map(|payload| notification(NOTIFY_CAMERA_STATUS, payload)),
        )
        .collect()
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Register before taking the baseline so no update falls in between;
    // anything broadcast meanwhile waits in the queue.
    let (client_id, mut outbound) = state.hub.register(Some(addr)).await;

    for message in greeting(&state) {
        if !send_text(&mut sender, message).await {
            state.hub.unregister(&client_id).await;
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if !send_text(&mut sender, message).await {
                break;
            }
        }
    });

    let reader_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = rpc::handle_text(&reader_state, text.as_str()).await {
                        if !reader_state.hub.send_to(&client_id, reply).await {
                            break;
                        }
                    }
                }
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring {} byte binary frame from {client_id}", data.len());
                }
                Ok(Message::Close(_)) => {
                    debug!("Client {client_id} sent close");
                    break;
                }
                // pings are answered by axum
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => {
                    warn!("WebSocket error for client {client_id}: {e}");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(&client_id).await;
}

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::fleet::Fleet;
use crate::hub::{is_server_channel, Hub, Publisher, ROSTER_REQUEST_CHANNEL, RUNTIMES_CHANNEL};
use crate::runtime::RuntimeCatalog;

#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub hub: Arc<Hub>,
    pub runtimes: Arc<dyn RuntimeCatalog>,
}

/// What a client sends over the socket.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    channel: String,
    #[serde(default)]
    data: Value,
}

pub async fn version() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn list_runtimes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtimes.discover().await)
}

pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.fleet.snapshots().await)
}

pub async fn socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut updates = state.hub.subscribe();
    let mut closed = state.hub.closed();
    if *closed.borrow() {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(envelope) => {
                        let Ok(text) = serde_json::to_string(&envelope) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagging behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = closed.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("websocket receive failed: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(state: &AppState, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("ignoring malformed client message: {}", e);
            return;
        }
    };

    match message.channel.as_str() {
        ROSTER_REQUEST_CHANNEL => state.fleet.hello().await,
        RUNTIMES_CHANNEL => {
            let runtimes = state.runtimes.discover().await;
            state.hub.publish(RUNTIMES_CHANNEL, json!(runtimes));
        }
        channel if is_server_channel(channel) => {
            let Some(command) = message.data.as_str().map(str::to_string) else {
                tracing::debug!(channel, "server command without text");
                return;
            };
            // Stops can take a while; keep the socket responsive.
            let fleet = state.fleet.clone();
            let channel = message.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = fleet.dispatch(&channel, &command).await {
                    tracing::debug!(channel = %channel, "command {:?} failed: {}", command, e);
                }
            });
        }
        other => tracing::debug!(channel = other, "message on unknown channel"),
    }
}

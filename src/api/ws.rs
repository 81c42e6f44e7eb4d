//! Live-updates WebSocket stream: sends the latest snapshot on connect, then
//! forwards every subsequent publish from the broadcaster until the client
//! disconnects or falls behind.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::debug;

use crate::api::AppState;
use crate::broadcaster::RecvOutcome;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    if let Some(snapshot) = state.tracker.snapshot_message_bytes().await {
        if socket.send(Message::Binary(snapshot)).await.is_err() {
            return;
        }
    }

    let broadcaster = state.tracker.broadcaster();
    let mut subscription = broadcaster.subscribe();
    loop {
        tokio::select! {
            outcome = subscription.recv() => {
                match outcome {
                    RecvOutcome::Update(bytes) => {
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    RecvOutcome::Lagged => {
                        debug!("WebSocket subscriber lagged behind the broadcast channel, dropping connection");
                        break;
                    }
                    RecvOutcome::Closed => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

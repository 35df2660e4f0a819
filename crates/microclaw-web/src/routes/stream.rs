//! Live device log stream.
//!
//! `GET /ws/logs` upgrades to a WebSocket and forwards every published event
//! as one text frame, `[TAG] text` by default or a JSON object with
//! `?format=json`. Frames sent by the client are ignored; the subscription is
//! dropped when the socket closes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use microclaw_protocol::{encode_event, StreamFormat, StreamParams};
use tracing::{debug, info, warn};

use crate::AppState;

/// GET /ws/logs
pub async fn logs_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.format))
}

async fn handle_socket(socket: WebSocket, state: AppState, format: StreamFormat) {
    let mut subscription = state.coordinator.subscribe();
    let id = subscription.id();
    info!("Log stream client {} connected", id);

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Log stream client {} closed", id);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Log stream client {} error: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }

            event = subscription.recv() => {
                let Some(event) = event else {
                    break;
                };
                let frame = match encode_event(&event, format) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unencodable event: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    debug!("Log stream client {} went away", id);
                    break;
                }
            }
        }
    }

    state.coordinator.unsubscribe(&subscription);
    info!("Log stream client {} disconnected", id);
}

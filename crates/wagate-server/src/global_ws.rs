//! Event-stream WebSocket: pushes registry events to dashboard clients.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use wagate_core::RegistryEvent;
use wagate_types::WsServerMessage;

/// `GET /ws/events`
pub async fn upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_events_websocket(socket, state))
}

/// Convert a registry event into its wire message.
pub fn to_ws_message(event: RegistryEvent) -> WsServerMessage {
    match event {
        RegistryEvent::StatusChanged {
            identity,
            old_status,
            new_status,
            user,
        } => WsServerMessage::StatusChange {
            identity,
            old_status,
            new_status,
            user,
        },
        RegistryEvent::PairingCodeIssued { identity, code } => {
            WsServerMessage::PairingCode { identity, code }
        }
        RegistryEvent::ReconnectScheduled {
            identity,
            attempt,
            delay,
        } => WsServerMessage::Reconnecting {
            identity,
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        },
        RegistryEvent::Removed { identity, reason } => {
            WsServerMessage::Removed { identity, reason }
        }
        RegistryEvent::MessageReceived {
            identity,
            from,
            text,
            timestamp,
        } => WsServerMessage::Message {
            identity,
            from,
            text,
            timestamp,
        },
    }
}

async fn handle_events_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = BroadcastStream::new(state.registry.subscribe());

    tracing::info!(target: "wagate::ws", "Event stream client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let msg = match event {
                Ok(event) => to_ws_message(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "wagate::ws", "Event stream client lagged, {} events dropped", skipped);
                    WsServerMessage::Error {
                        code: "lagged".to_string(),
                        message: format!("{} events dropped", skipped),
                    }
                }
            };

            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(_) => continue,
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound traffic is only pings and close frames.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Close(_) = msg {
                tracing::debug!(target: "wagate::ws", "Event stream client sent close");
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::info!(target: "wagate::ws", "Event stream client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wagate_types::{Identity, RemovalReason};

    #[test]
    fn test_reconnect_event_carries_millis() {
        let msg = to_ws_message(RegistryEvent::ReconnectScheduled {
            identity: Identity::parse("628111").unwrap(),
            attempt: 2,
            delay: Duration::from_secs(6),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "reconnecting");
        assert_eq!(json["delay_ms"], 6000);
    }

    #[test]
    fn test_removed_event() {
        let msg = to_ws_message(RegistryEvent::Removed {
            identity: Identity::parse("628111").unwrap(),
            reason: RemovalReason::Disconnected,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "removed");
        assert_eq!(json["identity"], "628111");
        assert_eq!(json["reason"], "disconnected");
    }
}

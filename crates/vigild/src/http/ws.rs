//! WebSocket endpoints.
//!
//! One socket carries both binary frames and JSON text events; subscribers
//! get both through a single hub subscription, so per-topic ordering
//! survives the transport merge. The socket is split so inbound control
//! messages never stall outbound delivery.

use crate::hub::{Interest, Message};
use crate::presence::all_presence_payload;
use crate::state::SharedState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};

type WsSender = SplitSink<WebSocket, WsMessage>;

pub async fn camera_stream(
    State(state): State<SharedState>,
    Path(camera_id): Path<i64>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| camera_stream_socket(state, camera_id, socket))
}

async fn camera_stream_socket(state: SharedState, camera_id: i64, socket: WebSocket) {
    let topic = format!("camera:{camera_id}");
    let subscription = state.hub.subscribe(&topic, Interest::Both);
    let (mut sender, mut receiver) = socket.split();
    tracing::info!(camera_id, "camera stream subscriber connected");

    // Initial status hello.
    let status = state
        .workers
        .status(camera_id)
        .await
        .unwrap_or_else(crate::events::WorkerStatus::offline);
    let hello = status.to_event(camera_id).to_string();
    if sender.send(WsMessage::Text(hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let outgoing = match envelope.message {
                    Message::Frame(bytes) => WsMessage::Binary(bytes.to_vec()),
                    Message::Event(value) => WsMessage::Text(value.to_string()),
                };
                if sender.send(outgoing).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match handle_control(&mut sender, incoming).await {
                    ControlFlow::Continue => {}
                    ControlFlow::Closed => break,
                }
            }
        }
    }
    tracing::info!(
        camera_id,
        dropped = subscription.dropped(),
        "camera stream subscriber disconnected"
    );
}

pub async fn all_rooms_presence(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| all_rooms_presence_socket(state, socket))
}

async fn all_rooms_presence_socket(state: SharedState, socket: WebSocket) {
    let subscription = state.hub.subscribe("rooms:all", Interest::Events);
    let (mut sender, mut receiver) = socket.split();
    tracing::info!("presence dashboard subscriber connected");

    if send_all_presence(&state, &mut sender, "initial_all_presence").await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Message::Event(value) = envelope.message else { continue };
                if sender.send(WsMessage::Text(value.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                // A refresh request is the one non-ping control message here.
                if let Some(Ok(WsMessage::Text(text))) = &incoming {
                    if is_refresh(text) {
                        if send_all_presence(&state, &mut sender, "all_presence_refresh")
                            .await
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    }
                }
                match handle_control(&mut sender, incoming).await {
                    ControlFlow::Continue => {}
                    ControlFlow::Closed => break,
                }
            }
        }
    }
    tracing::info!(
        dropped = subscription.dropped(),
        "presence dashboard subscriber disconnected"
    );
}

enum ControlFlow {
    Continue,
    Closed,
}

/// Shared inbound handling: answer pings, detect closure, ignore the rest.
async fn handle_control(
    sender: &mut WsSender,
    incoming: Option<Result<WsMessage, axum::Error>>,
) -> ControlFlow {
    match incoming {
        Some(Ok(WsMessage::Text(text))) => {
            if is_ping(&text)
                && sender
                    .send(WsMessage::Text(r#"{"type":"pong"}"#.to_string()))
                    .await
                    .is_err()
            {
                return ControlFlow::Closed;
            }
            ControlFlow::Continue
        }
        Some(Ok(WsMessage::Close(_))) | None => ControlFlow::Closed,
        Some(Ok(_)) => ControlFlow::Continue,
        Some(Err(_)) => ControlFlow::Closed,
    }
}

async fn send_all_presence(
    state: &SharedState,
    sender: &mut WsSender,
    kind: &str,
) -> Result<(), ()> {
    let payload = match all_presence_payload(&state.store, &state.presence, Utc::now()).await {
        Ok((rooms, total_people)) => serde_json::json!({
            "type": kind,
            "rooms": rooms,
            "total_people": total_people,
            "timestamp": Utc::now().to_rfc3339(),
        }),
        Err(err) => {
            tracing::warn!(error = %err, "presence payload failed");
            serde_json::json!({ "type": "error", "message": "presence unavailable" })
        }
    };
    sender
        .send(WsMessage::Text(payload.to_string()))
        .await
        .map_err(|_| ())
}

fn message_type(text: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("type")?
        .as_str()
        .map(str::to_string)
}

fn is_ping(text: &str) -> bool {
    message_type(text).as_deref() == Some("ping")
}

fn is_refresh(text: &str) -> bool {
    message_type(text).as_deref() == Some("refresh")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_parsing() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(is_refresh(r#"{"type":"refresh"}"#));
        assert!(!is_ping(r#"{"type":"refresh"}"#));
        assert!(!is_ping("not json"));
    }
}

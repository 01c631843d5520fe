//! WebSocket transport for chat turns: GET /chat/ws/:id

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::orchestrator::TurnEvent;
use crate::session::TurnTicket;
use crate::shared_state::AppState;
use crate::store::FileRef;

const EVENT_BUFFER: usize = 256;
const CONTROL_BUFFER: usize = 16;

/// Client frame: `{message, files}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

impl ClientFrame {
    fn is_empty(&self) -> bool {
        self.message.trim().is_empty() && self.files.is_empty()
    }
}

/// `error` frame for a rejected client frame. The `invalid_frame` flag keeps it
/// apart from the terminal `error` of a turn.
fn invalid_frame_json(message: &str) -> String {
    json!({ "type": "error", "message": message, "invalid_frame": true }).to_string()
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, conversation_id, state))
}

/// Sends a single `error` frame and closes the socket.
async fn reject(mut socket: WebSocket, message: &str) {
    let frame = json!({ "type": "error", "message": message }).to_string();
    if socket.send(WsMessage::Text(frame)).await.is_ok() {
        let _ = socket.send(WsMessage::Close(None)).await;
    }
}

async fn handle_socket(socket: WebSocket, conversation_id: String, state: AppState) {
    match state.db.conversations.get_conversation(&conversation_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!("Chat connection for unknown conversation {}", conversation_id);
            reject(socket, "Conversation not found").await;
            return;
        }
        Err(e) => {
            warn!("Failed to load conversation {}: {}", conversation_id, e);
            reject(socket, &format!("Storage error: {}", e)).await;
            return;
        }
    }

    info!("Chat connection opened for conversation {}", conversation_id);
    state.sessions.connect(&conversation_id);

    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let (control_tx, mut control_rx) = mpsc::channel::<String>(CONTROL_BUFFER);

    let writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                Some(event) = event_rx.recv() => serde_json::to_string(&event)
                    .map_err(|e| warn!("Failed to encode turn event: {}", e))
                    .ok(),
                Some(message) = control_rx.recv() => Some(invalid_frame_json(&message)),
                else => break,
            };
            let Some(text) = text else {
                continue;
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Turns run on their own task in arrival order, so closing the socket
    // never cancels one that is already queued or running.
    let (turn_tx, mut turn_rx) = mpsc::unbounded_channel::<(TurnTicket, ClientFrame)>();
    {
        let state = state.clone();
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            while let Some((ticket, frame)) = turn_rx.recv().await {
                ticket
                    .run(state.orchestrator.handle_user_turn(&conversation_id, &frame.message, frame.files, &event_tx))
                    .await;
            }
        });
    }

    while let Some(incoming) = receiver.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) if frame.is_empty() => debug!("Ignoring empty chat frame"),
                Ok(frame) => {
                    let ticket = state.sessions.enqueue_turn(&conversation_id);
                    if turn_tx.send((ticket, frame)).is_err() {
                        warn!("Turn runner for {} has stopped", conversation_id);
                        break;
                    }
                }
                Err(e) => {
                    if control_tx.send(format!("Invalid message frame: {}", e)).await.is_err() {
                        break;
                    }
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Chat socket error for {}: {}", conversation_id, e);
                break;
            }
        }
    }

    drop(turn_tx);
    drop(control_tx);
    writer.abort();
    state.sessions.disconnect(&conversation_id);
    info!("Chat connection closed for conversation {}", conversation_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_defaults() {
        let frame: ClientFrame = serde_json::from_str(r#"{"message": "Hi"}"#).unwrap();
        assert_eq!(frame.message, "Hi");
        assert!(frame.files.is_empty());

        let blank: ClientFrame = serde_json::from_str(r#"{"message": "   "}"#).unwrap();
        assert!(blank.is_empty());

        let attachment_only: ClientFrame =
            serde_json::from_str(r#"{"files": [{"id": "f1", "name": "a.pdf", "mime_type": "application/pdf"}]}"#)
                .unwrap();
        assert!(!attachment_only.is_empty());
    }

    #[test]
    fn test_invalid_frame_error_is_flagged() {
        let value: serde_json::Value = serde_json::from_str(&invalid_frame_json("Invalid message frame: eof")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["invalid_frame"], true);
        assert_eq!(value["message"], "Invalid message frame: eof");
    }
}

//! Non-streaming chat fallback: POST /chat/message

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};
use validator::Validate;

use super::ApiError;
use crate::orchestrator::{TurnEvent, TurnOutcome};
use crate::shared_state::AppState;
use crate::store::FileRef;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    /// A new conversation is created when absent.
    pub conversation_id: Option<String>,
    #[validate(length(min = 1))]
    pub message: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub conversation_id: String,
    pub response: String,
    pub function_results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// POST /chat/message
///
/// Runs one turn to completion and answers with the final text. The turn is
/// queued behind any WebSocket turn of the same conversation and keeps running
/// if the HTTP client goes away.
pub async fn send_message(
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    payload.validate()?;
    let SendMessageRequest { conversation_id, message, files } = payload;
    let conversation_id = match conversation_id {
        Some(id) => id,
        None => {
            let conversation = state.db.conversations.create_conversation(None)?;
            info!("Created conversation {} for a direct message", conversation.id);
            conversation.id
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let ticket = state.sessions.enqueue_turn(&conversation_id);
    let turn = {
        let orchestrator = state.orchestrator.clone();
        let conversation_id = conversation_id.clone();
        tokio::spawn(async move {
            ticket
                .run(orchestrator.handle_user_turn(&conversation_id, &message, files, &event_tx))
                .await
        })
    };

    let mut response = String::new();
    let mut function_results = Vec::new();
    let mut title = None;
    let mut failure = None;
    while let Some(event) = event_rx.recv().await {
        match event {
            TurnEvent::FunctionResult { result } => function_results.push(result),
            TurnEvent::TitleUpdate { title: t } => title = Some(t),
            TurnEvent::Complete { full_response } => response = full_response,
            TurnEvent::Error { message } => failure = Some(message),
            TurnEvent::Chunk { .. } | TurnEvent::FunctionCall { .. } => {}
        }
    }

    let outcome = turn.await.map_err(|e| {
        error!("Turn task for {} did not finish: {}", conversation_id, e);
        ApiError::internal("Turn was interrupted")
    })?;
    match outcome {
        TurnOutcome::Completed => Ok(Json(SendMessageResponse { conversation_id, response, function_results, title })),
        TurnOutcome::Rejected => Err(ApiError::not_found(failure.unwrap_or_else(|| "Conversation not found".into()))),
        TurnOutcome::Failed => Err(ApiError::upstream(failure.unwrap_or_else(|| "Turn failed".into()))),
    }
}

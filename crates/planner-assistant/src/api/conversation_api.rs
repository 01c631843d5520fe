//! REST endpoints for conversations and their message history

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::ApiError;
use crate::shared_state::AppState;
use crate::store::{Conversation, ConversationSummary, StoredMessage};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CreateConversationRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateTitleRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<StoredMessage>,
}

fn require_conversation(state: &AppState, id: &str) -> Result<Conversation, ApiError> {
    state
        .db
        .conversations
        .get_conversation(id)?
        .ok_or_else(|| ApiError::not_found("Conversation not found"))
}

/// POST /chat/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    payload.validate()?;
    let conversation = state.db.conversations.create_conversation(payload.title.as_deref())?;
    info!("Created conversation {}", conversation.id);
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /chat/conversations?limit=
pub async fn get_conversations(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ConversationsResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let conversations = state.db.conversations.list_conversations(limit)?;
    Ok(Json(ConversationsResponse { conversations }))
}

/// GET /chat/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let conversation = require_conversation(&state, &id)?;
    let messages = state.db.conversations.get_messages(&id, None)?;
    Ok(Json(ConversationDetailResponse { conversation, messages }))
}

/// GET /chat/conversations/:id/messages?limit=
///
/// With a limit, the most recent messages are returned, still oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    require_conversation(&state, &id)?;
    let messages = match query.limit {
        Some(limit) => state.db.conversations.get_recent_messages(&id, limit.clamp(1, MAX_LIST_LIMIT))?,
        None => state.db.conversations.get_messages(&id, None)?,
    };
    Ok(Json(MessagesResponse { messages }))
}

/// PUT /chat/conversations/:id/title
pub async fn update_conversation_title(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateTitleRequest>,
) -> Result<Json<Conversation>, ApiError> {
    payload.validate()?;
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("Title cannot be blank"));
    }
    if !state.db.conversations.update_title(&id, title)? {
        return Err(ApiError::not_found("Conversation not found"));
    }
    Ok(Json(require_conversation(&state, &id)?))
}

/// DELETE /chat/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.db.conversations.delete_conversation(&id)? {
        return Err(ApiError::not_found("Conversation not found"));
    }
    info!("Deleted conversation {}", id);
    Ok(StatusCode::NO_CONTENT)
}

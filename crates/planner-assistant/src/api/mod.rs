//! HTTP and WebSocket handlers

pub mod calendar_api;
pub mod chat_api;
pub mod chat_ws;
pub mod conversation_api;
pub mod status_api;

pub use calendar_api::{add_tracked_calendar, list_provider_calendars, list_tracked_calendars, remove_tracked_calendar, update_tracked_calendar};
pub use chat_api::send_message;
pub use chat_ws::chat_ws;
pub use conversation_api::{
    create_conversation, delete_conversation, get_conversation, get_conversations, get_messages, update_conversation_title,
};
pub use status_api::{health, status};

use crate::error::ToolError;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_GATEWAY, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({
                "error": self.message,
                "code": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("Request failed: {:#}", e);
        ApiError::internal(format!("Database error: {}", e))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<ToolError> for ApiError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::NotFound(_) => ApiError::not_found(e.to_string()),
            ToolError::Upstream(_) => ApiError::upstream(e.to_string()),
            ToolError::Storage(_) => ApiError::internal(e.to_string()),
            _ => ApiError::bad_request(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_errors_map_to_statuses() {
        let cases = vec![
            (ToolError::NotFound("Calendar 3 not found".into()), StatusCode::NOT_FOUND),
            (ToolError::Upstream(anyhow::anyhow!("timeout")), StatusCode::BAD_GATEWAY),
            (ToolError::NotTracked("x".into()), StatusCode::BAD_REQUEST),
            (ToolError::Storage(anyhow::anyhow!("locked")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }
}

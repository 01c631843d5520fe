//! Language model abstraction used by the turn orchestrator.
pub mod anthropic;

pub use anthropic::{AnthropicClient, StreamAssembler};

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One block of message content, in the model API's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: vec![ContentBlock::Text { text: text.into() }] }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: vec![ContentBlock::Text { text: text.into() }] }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Incremental assistant text, forwarded as it arrives.
    TextDelta(String),
    /// A complete tool invocation with parsed input.
    ToolUse { id: String, name: String, input: Value },
    /// End of the model message, with the API's stop reason.
    Stop(String),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelEvent>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Whether credentials are present; used for status reporting only.
    fn is_configured(&self) -> bool;

    fn model_name(&self) -> String;

    /// Starts one streamed model response. An `Err` here or inside the
    /// stream is a transport failure.
    async fn stream_turn(&self, request: ModelRequest) -> anyhow::Result<ModelStream>;

    /// A 2-5 word title for a conversation's first exchange.
    async fn generate_title(&self, user_message: &str, assistant_message: &str) -> anyhow::Result<String>;
}

//! Anthropic Messages API client with streamed tool use.
use super::{ChatMessage, LanguageModel, ModelEvent, ModelRequest, ModelStream, ToolDefinition};
use crate::config::Config;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const TITLE_MAX_TOKENS: u32 = 20;
const TITLE_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "is_blank")]
    system: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "has_no_tools")]
    tools: &'a [ToolDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    stream: bool,
}

fn is_blank(system: &&str) -> bool {
    system.is_empty()
}

fn has_no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

/// Turns decoded server-sent event payloads into [`ModelEvent`]s.
///
/// Text deltas pass straight through. Tool-use input arrives as JSON
/// fragments per content block and is emitted once the block stops.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: HashMap<u64, PendingToolUse>,
    stop_reason: Option<String>,
    finished: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle(&mut self, payload: &Value) -> anyhow::Result<Vec<ModelEvent>> {
        let event_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
        let mut events = Vec::new();

        match event_type {
            "content_block_start" => {
                let block = &payload["content_block"];
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.pending.insert(
                            index,
                            PendingToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                input_json: String::new(),
                            },
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                events.push(ModelEvent::TextDelta(text.to_string()));
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &payload["delta"];
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            events.push(ModelEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(pending), Some(fragment)) = (
                            self.pending.get_mut(&index),
                            delta.get("partial_json").and_then(Value::as_str),
                        ) {
                            pending.input_json.push_str(fragment);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(pending) = self.pending.remove(&index) {
                    let input = if pending.input_json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&pending.input_json).unwrap_or_else(|e| {
                            warn!("Malformed tool input for {}: {}", pending.name, e);
                            json!({})
                        })
                    };
                    events.push(ModelEvent::ToolUse { id: pending.id, name: pending.name, input });
                }
            }
            "message_delta" => {
                if let Some(reason) = payload["delta"].get("stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "message_stop" => {
                self.finished = true;
                events.push(ModelEvent::Stop(self.stop_reason.take().unwrap_or_else(|| "end_turn".to_string())));
            }
            "error" => {
                let message = payload["error"]["message"].as_str().unwrap_or("unknown stream error");
                let kind = payload["error"]["type"].as_str().unwrap_or("error");
                return Err(anyhow::anyhow!("Model stream error ({}): {}", kind, message));
            }
            // message_start, ping and future event types carry nothing we need.
            _ => {}
        }
        Ok(events)
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    title_model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        title_model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            title_model: title_model.into(),
            max_tokens,
        }
    }

    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        info!("Anthropic client initialized for model {}", config.ai_model);
        Self::new(
            http,
            config.anthropic_base_url.clone(),
            config.anthropic_api_key.clone(),
            config.ai_model.clone(),
            config.title_model.clone(),
            config.max_tokens,
        )
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn post(&self, body: &MessagesRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let response = self
            .http
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Model API request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        warn!("Model API returned {}: {}", status, text);
        Err(match status.as_u16() {
            401 | 403 => anyhow::anyhow!("Anthropic API key is invalid or expired. Check ANTHROPIC_API_KEY."),
            429 => anyhow::anyhow!("Model rate limit exceeded. Please wait a moment and try again."),
            _ => anyhow::anyhow!("Model API returned {}: {}", status, text),
        })
    }
}

/// Splits a server-sent event byte stream into lines and feeds each `data:`
/// payload through a [`StreamAssembler`].
fn decode_event_stream<S, B>(byte_stream: S) -> impl Stream<Item = anyhow::Result<ModelEvent>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    async_stream::try_stream! {
        let mut assembler = StreamAssembler::new();
        // Raw bytes: a chunk boundary may fall inside a multi-byte character.
        let mut buffer: Vec<u8> = Vec::new();
        futures_util::pin_mut!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("Model stream read error: {}", e))?;
            buffer.extend_from_slice(chunk.as_ref());
            while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=newline_pos).collect();
                let line = String::from_utf8(raw)
                    .map_err(|e| anyhow::anyhow!("Model stream line is not valid UTF-8: {}", e))?;
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let payload: Value = serde_json::from_str(data.trim())
                    .map_err(|e| anyhow::anyhow!("Malformed stream event: {}", e))?;
                for event in assembler.handle(&payload)? {
                    yield event;
                }
                if assembler.is_finished() {
                    return;
                }
            }
        }
        if !assembler.is_finished() {
            Err::<(), anyhow::Error>(anyhow::anyhow!("Model stream ended before the message was complete"))?;
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(TITLE_EXCERPT_CHARS).collect()
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn stream_turn(&self, request: ModelRequest) -> anyhow::Result<ModelStream> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools: &request.tools,
            tool_choice: (!request.tools.is_empty()).then(|| json!({"type": "auto"})),
            stream: true,
        };
        debug!(
            "Streaming model turn: {} messages, {} tools",
            request.messages.len(),
            request.tools.len()
        );
        let response = self.post(&body).await?;
        Ok(Box::pin(decode_event_stream(response.bytes_stream())))
    }

    async fn generate_title(&self, user_message: &str, assistant_message: &str) -> anyhow::Result<String> {
        let prompt = format!(
            "Generate a very short title (2-5 words) for this conversation. Focus on the main topic or task. \
             No quotes, no punctuation. Just the title.\n\nUser said: {}\n\nAssistant responded about: {}",
            excerpt(user_message),
            excerpt(assistant_message)
        );
        let messages = [ChatMessage::user_text(prompt)];
        let body = MessagesRequest {
            model: &self.title_model,
            max_tokens: TITLE_MAX_TOKENS,
            system: "",
            messages: &messages,
            tools: &[],
            tool_choice: None,
            stream: false,
        };
        let response: Value = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse title response: {}", e))?;

        let title = response["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find_map(|b| b.get("text").and_then(Value::as_str)))
            .unwrap_or_default()
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string();
        if title.is_empty() {
            return Err(anyhow::anyhow!("Title model returned no text"));
        }
        info!("Generated title: '{}'", title);
        Ok(title)
    }
}

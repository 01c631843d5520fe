//! The tool-calling turn loop: user message in, streamed events out.
use crate::context::ContextBuilder;
use crate::llm::{ChatMessage, ChatRole, ContentBlock, LanguageModel, ModelEvent, ModelRequest};
use crate::metrics;
use crate::store::{FileRef, MessageRole, NewMessage, PlannerDatabase, StoredMessage};
use crate::tools::{tool_definitions, ToolExecutor};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Server-to-client event of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Chunk { content: String },
    FunctionCall { function: String, arguments: Value },
    FunctionResult { result: Value },
    TitleUpdate { title: String },
    Complete { full_response: String },
    Error { message: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Complete { .. } | TurnEvent::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed,
    /// The conversation does not exist; nothing was persisted.
    Rejected,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::Failed => "failed",
            TurnOutcome::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_tool_rounds: usize,
    pub history_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { max_tool_rounds: 5, history_limit: 20 }
    }
}

/// Model text for a user message: its content plus a line per attachment.
pub fn describe_user_content(content: &str, attachments: &[FileRef]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let mut text = content.to_string();
    for file in attachments {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("[Attached file: {} ({})]", file.name, file.mime_type));
    }
    text
}

/// The last `limit` user/assistant messages as model input. Tool results and
/// system notes are not replayed; consecutive same-role messages are merged and
/// the history always opens with a user message.
pub fn replay_history(messages: &[StoredMessage], limit: usize) -> Vec<ChatMessage> {
    let replayable: Vec<&StoredMessage> = messages
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .filter(|m| !m.content.is_empty() || !m.attachments.is_empty())
        .collect();
    let start = replayable.len().saturating_sub(limit);

    let mut history: Vec<ChatMessage> = Vec::new();
    for message in &replayable[start..] {
        let (role, text) = match message.role {
            MessageRole::User => (ChatRole::User, describe_user_content(&message.content, &message.attachments)),
            _ => (ChatRole::Assistant, message.content.clone()),
        };
        if history.is_empty() && role == ChatRole::Assistant {
            continue;
        }
        match history.last_mut() {
            Some(last) if last.role == role => last.content.push(ContentBlock::Text { text }),
            _ => history.push(ChatMessage { role, content: vec![ContentBlock::Text { text }] }),
        }
    }
    history
}

pub struct TurnOrchestrator {
    db: Arc<PlannerDatabase>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolExecutor>,
    context: ContextBuilder,
    settings: OrchestratorSettings,
}

impl TurnOrchestrator {
    pub fn new(
        db: Arc<PlannerDatabase>,
        model: Arc<dyn LanguageModel>,
        tools: Arc<ToolExecutor>,
        context: ContextBuilder,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { db, model, tools, context, settings }
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Runs one user turn to a terminal `complete` or `error` event. Events
    /// are best effort: a dropped receiver never stops the turn, and every
    /// message is persisted regardless.
    pub async fn handle_user_turn(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: Vec<FileRef>,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        let started = Instant::now();
        info!("Turn started for conversation {}", conversation_id);
        let outcome = self.run_turn(conversation_id, text, attachments, sink).await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::inc_turn(outcome.as_str());
        metrics::observe_turn_duration(elapsed);
        info!("Turn {} for conversation {} in {:.2}s", outcome.as_str(), conversation_id, elapsed);
        outcome
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: Vec<FileRef>,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        let conversation = match self.db.conversations.get_conversation(conversation_id) {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!("Turn for unknown conversation {}", conversation_id);
                emit(sink, TurnEvent::Error { message: "Conversation not found".into() }).await;
                return TurnOutcome::Rejected;
            }
            Err(e) => {
                error!("Failed to load conversation {}: {}", conversation_id, e);
                emit(sink, TurnEvent::Error { message: format!("Storage error: {}", e) }).await;
                return TurnOutcome::Rejected;
            }
        };

        if let Err(e) = self
            .db
            .conversations
            .append_message(conversation_id, NewMessage::user(text, attachments))
        {
            error!("Failed to persist user message: {}", e);
            emit(sink, TurnEvent::Error { message: format!("Storage error: {}", e) }).await;
            return TurnOutcome::Failed;
        }

        let stored = match self.db.conversations.get_messages(conversation_id, None) {
            Ok(messages) => messages,
            Err(e) => return self.fail(conversation_id, "", format!("Storage error: {}", e), sink).await,
        };
        // +1 for the message just appended.
        let mut messages = replay_history(&stored, self.settings.history_limit + 1);
        let system = self.context.build_preamble(chrono::Utc::now()).await;
        let tools = tool_definitions();

        let mut full_response = String::new();
        for round in 1..=self.settings.max_tool_rounds {
            debug!("Model round {} for conversation {}", round, conversation_id);
            let request = ModelRequest { system: system.clone(), messages: messages.clone(), tools: tools.clone() };

            let mut stream = match self.model.stream_turn(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let message = format!("Model request failed: {}", e);
                    return self.fail(conversation_id, &full_response, message, sink).await;
                }
            };

            let mut round_text = String::new();
            let mut tool_uses: Vec<(String, String, Value)> = Vec::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ModelEvent::TextDelta(delta)) => {
                        round_text.push_str(&delta);
                        emit(sink, TurnEvent::Chunk { content: delta }).await;
                    }
                    Ok(ModelEvent::ToolUse { id, name, input }) => tool_uses.push((id, name, input)),
                    Ok(ModelEvent::Stop(reason)) => debug!("Model round {} stopped: {}", round, reason),
                    Err(e) => {
                        full_response.push_str(&round_text);
                        let message = format!("Model stream failed: {}", e);
                        return self.fail(conversation_id, &full_response, message, sink).await;
                    }
                }
            }
            full_response.push_str(&round_text);

            if tool_uses.is_empty() {
                return self.complete(conversation_id, conversation.title.is_none(), text, full_response, sink).await;
            }

            let mut assistant_blocks = Vec::with_capacity(tool_uses.len() + 1);
            if !round_text.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: round_text });
            }
            let mut result_blocks = Vec::with_capacity(tool_uses.len());

            for (id, name, input) in tool_uses {
                assistant_blocks.push(ContentBlock::ToolUse { id: id.clone(), name: name.clone(), input: input.clone() });
                emit(sink, TurnEvent::FunctionCall { function: name.clone(), arguments: input.clone() }).await;

                let outcome = self.tools.execute(&name, &input).await;
                let result = outcome.to_value();
                let payload = json!({ "tool": name, "arguments": input, "result": result });
                if let Err(e) = self
                    .db
                    .conversations
                    .append_message(conversation_id, NewMessage::tool_result(outcome.message.clone(), payload))
                {
                    return self.fail(conversation_id, &full_response, format!("Storage error: {}", e), sink).await;
                }
                emit(sink, TurnEvent::FunctionResult { result: result.clone() }).await;

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: result.to_string(),
                    is_error: !outcome.success,
                });
            }

            messages.push(ChatMessage { role: ChatRole::Assistant, content: assistant_blocks });
            messages.push(ChatMessage { role: ChatRole::User, content: result_blocks });
        }

        let message = format!(
            "Stopped after {} tool rounds without a final answer",
            self.settings.max_tool_rounds
        );
        self.fail(conversation_id, &full_response, message, sink).await
    }

    async fn complete(
        &self,
        conversation_id: &str,
        needs_title: bool,
        user_text: &str,
        full_response: String,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        if let Err(e) = self
            .db
            .conversations
            .append_message(conversation_id, NewMessage::assistant(full_response.clone()))
        {
            error!("Failed to persist assistant message: {}", e);
            emit(sink, TurnEvent::Error { message: format!("Storage error: {}", e) }).await;
            return TurnOutcome::Failed;
        }

        if needs_title {
            self.generate_title(conversation_id, user_text, &full_response, sink).await;
        }

        emit(sink, TurnEvent::Complete { full_response }).await;
        TurnOutcome::Completed
    }

    async fn generate_title(&self, conversation_id: &str, user_text: &str, response: &str, sink: &mpsc::Sender<TurnEvent>) {
        let title = match self.model.generate_title(user_text, response).await {
            Ok(title) => title,
            Err(e) => {
                warn!("Title generation failed for {}: {}", conversation_id, e);
                return;
            }
        };
        match self.db.conversations.update_title(conversation_id, &title) {
            Ok(true) => {
                debug!("Titled conversation {}: {}", conversation_id, title);
                emit(sink, TurnEvent::TitleUpdate { title }).await;
            }
            Ok(false) => warn!("Conversation {} vanished before it could be titled", conversation_id),
            Err(e) => warn!("Failed to store title for {}: {}", conversation_id, e),
        }
    }

    /// Persists any text produced so far and a system note, then emits `error`.
    async fn fail(
        &self,
        conversation_id: &str,
        partial_text: &str,
        message: String,
        sink: &mpsc::Sender<TurnEvent>,
    ) -> TurnOutcome {
        error!("Turn failed for conversation {}: {}", conversation_id, message);
        let conversations = &self.db.conversations;
        if !partial_text.is_empty() {
            if let Err(e) = conversations.append_message(conversation_id, NewMessage::assistant(partial_text)) {
                error!("Failed to persist partial response: {}", e);
            }
        }
        if let Err(e) = conversations.append_message(conversation_id, NewMessage::system(message.clone())) {
            error!("Failed to persist failure note: {}", e);
        }
        emit(sink, TurnEvent::Error { message }).await;
        TurnOutcome::Failed
    }
}

async fn emit(sink: &mpsc::Sender<TurnEvent>, event: TurnEvent) {
    if sink.send(event).await.is_err() {
        debug!("Turn event dropped: receiver closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stored(position: i64, role: MessageRole, content: &str) -> StoredMessage {
        StoredMessage {
            id: position,
            conversation_id: "c".into(),
            position,
            role,
            content: content.into(),
            payload: None,
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_events_serialize_as_frames() {
        let frame = serde_json::to_value(TurnEvent::FunctionCall {
            function: "get_todos".into(),
            arguments: json!({}),
        })
        .unwrap();
        assert_eq!(frame, json!({"type": "function_call", "function": "get_todos", "arguments": {}}));

        let frame = serde_json::to_value(TurnEvent::Complete { full_response: "Done".into() }).unwrap();
        assert_eq!(frame, json!({"type": "complete", "full_response": "Done"}));
        assert!(TurnEvent::Error { message: "x".into() }.is_terminal());
        assert!(!TurnEvent::Chunk { content: "x".into() }.is_terminal());
    }

    #[test]
    fn test_history_skips_tool_results_and_merges_roles() {
        let messages = vec![
            stored(0, MessageRole::Assistant, "orphan"),
            stored(1, MessageRole::User, "first"),
            stored(2, MessageRole::ToolResult, "Scheduled"),
            stored(3, MessageRole::System, "Model request failed"),
            stored(4, MessageRole::User, "again"),
            stored(5, MessageRole::Assistant, "ok"),
        ];
        let history = replay_history(&messages, 20);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].content.len(), 2);
        assert_eq!(history[1].text(), "ok");
    }

    #[test]
    fn test_history_limit_keeps_latest() {
        let messages: Vec<StoredMessage> = (0..10)
            .map(|i| {
                let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
                stored(i, role, &format!("m{}", i))
            })
            .collect();
        let history = replay_history(&messages, 4);
        let texts: Vec<String> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["m6", "m7", "m8", "m9"]);
    }

    #[test]
    fn test_attachments_are_described() {
        let files = vec![FileRef { id: "f1".into(), name: "agenda.pdf".into(), mime_type: "application/pdf".into() }];
        assert_eq!(
            describe_user_content("See attached", &files),
            "See attached\n[Attached file: agenda.pdf (application/pdf)]"
        );
        assert_eq!(describe_user_content("", &files), "[Attached file: agenda.pdf (application/pdf)]");
    }
}

//! WebSocket chat transport over a real listener.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use planner_assistant::config::Config;
use planner_assistant::llm::{LanguageModel, ModelEvent, ModelRequest, ModelStream};
use planner_assistant::store::{MessageRole, PlannerDatabase};
use planner_assistant::{build_router, AppState, InMemoryCalendarProvider};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers every round with one text delta. With a gate it waits for
/// `release` before answering; with a delay it sleeps inside the round.
#[derive(Default)]
struct EchoModel {
    reply: String,
    started: Notify,
    release: Option<Notify>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl EchoModel {
    fn new(reply: &str) -> Self {
        Self { reply: reply.into(), ..Default::default() }
    }

    fn gated(reply: &str) -> Self {
        Self { release: Some(Notify::new()), ..Self::new(reply) }
    }

    fn slow(reply: &str, delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::new(reply) }
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn is_configured(&self) -> bool {
        true
    }

    fn model_name(&self) -> String {
        "echo".into()
    }

    async fn stream_turn(&self, _request: ModelRequest) -> anyhow::Result<ModelStream> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(release) = &self.release {
            release.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        let events = vec![Ok(ModelEvent::TextDelta(self.reply.clone())), Ok(ModelEvent::Stop("end_turn".into()))];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn generate_title(&self, _user: &str, _assistant: &str) -> anyhow::Result<String> {
        Ok("Chat".into())
    }
}

async fn serve(model: Arc<EchoModel>) -> (SocketAddr, AppState) {
    let config = Config::from_lookup(|key| match key {
        "CALENDAR_PROVIDER" => Some("memory".to_string()),
        _ => None,
    })
    .unwrap();
    let db = Arc::new(PlannerDatabase::new_in_memory().unwrap());
    let state = AppState::new(config, db, Arc::new(InMemoryCalendarProvider::new()), model);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn open(addr: SocketAddr, conversation_id: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/chat/ws/{}", addr, conversation_id)).await.unwrap();
    socket
}

async fn say(socket: &mut Socket, frame: &str) {
    socket.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next JSON text frame, or `None` once the server closes the socket.
async fn next_frame(socket: &mut Socket) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame");
        match message {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Frames up to and including the turn's `complete`.
async fn frames_until_complete(socket: &mut Socket) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(socket).await {
        let done = frame["type"] == "complete";
        frames.push(frame);
        if done {
            return frames;
        }
    }
    panic!("socket closed before the turn completed: {:?}", frames);
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

fn roles(state: &AppState, conversation_id: &str) -> Vec<MessageRole> {
    state
        .db
        .conversations
        .get_messages(conversation_id, None)
        .unwrap()
        .into_iter()
        .map(|m| m.role)
        .collect()
}

#[tokio::test]
async fn test_unknown_conversation_is_refused() {
    let (addr, state) = serve(Arc::new(EchoModel::new("Hi"))).await;
    let mut socket = open(addr, "does-not-exist").await;

    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["message"], "Conversation not found");
    assert!(frame.get("invalid_frame").is_none());
    assert_eq!(next_frame(&mut socket).await, None);
    assert!(state.sessions.get("does-not-exist").is_none());
}

#[tokio::test]
async fn test_invalid_frame_keeps_socket_open() {
    let (addr, state) = serve(Arc::new(EchoModel::new("Hello there"))).await;
    let id = state.db.conversations.create_conversation(None).unwrap().id;
    let mut socket = open(addr, &id).await;

    say(&mut socket, "not json").await;
    let frame = next_frame(&mut socket).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["invalid_frame"], true);
    assert!(frame["message"].as_str().unwrap().starts_with("Invalid message frame"));

    say(&mut socket, r#"{"message": "Hi"}"#).await;
    let frames = frames_until_complete(&mut socket).await;
    assert_eq!(types(&frames), vec!["chunk", "title_update", "complete"]);
    assert_eq!(frames[2]["full_response"], "Hello there");
}

#[tokio::test]
async fn test_empty_frame_is_ignored() {
    let (addr, state) = serve(Arc::new(EchoModel::new("Hello there"))).await;
    let id = state.db.conversations.create_conversation(None).unwrap().id;
    let mut socket = open(addr, &id).await;

    say(&mut socket, r#"{"message": "   "}"#).await;
    say(&mut socket, r#"{"message": "Hi"}"#).await;

    // The first frame after the blank one belongs to the real turn.
    let frames = frames_until_complete(&mut socket).await;
    assert_eq!(types(&frames), vec!["chunk", "title_update", "complete"]);
    let messages = state.db.conversations.get_messages(&id, None).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "Hi");
}

#[tokio::test]
async fn test_disconnect_mid_turn_still_persists_the_turn() {
    let model = Arc::new(EchoModel::gated("Booked it."));
    let (addr, state) = serve(model.clone()).await;
    let id = state.db.conversations.create_conversation(None).unwrap().id;
    let mut socket = open(addr, &id).await;

    say(&mut socket, r#"{"message": "Book lunch"}"#).await;
    tokio::time::timeout(FRAME_TIMEOUT, model.started.notified()).await.unwrap();
    let _ = socket.close(None).await;
    drop(socket);
    model.release.as_ref().unwrap().notify_one();

    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    loop {
        if roles(&state, &id) == vec![MessageRole::User, MessageRole::Assistant] {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "turn was not persisted after disconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let messages = state.db.conversations.get_messages(&id, None).unwrap();
    assert_eq!(messages[1].content, "Booked it.");
}

#[tokio::test]
async fn test_two_connections_take_turns() {
    let model = Arc::new(EchoModel::slow("Noted.", Duration::from_millis(100)));
    let (addr, state) = serve(model.clone()).await;
    let id = state.db.conversations.create_conversation(None).unwrap().id;
    let mut first = open(addr, &id).await;
    let mut second = open(addr, &id).await;

    say(&mut first, r#"{"message": "Plan Monday"}"#).await;
    say(&mut second, r#"{"message": "Plan Tuesday"}"#).await;

    let (a, b) = tokio::join!(frames_until_complete(&mut first), frames_until_complete(&mut second));
    assert_eq!(a.last().unwrap()["type"], "complete");
    assert_eq!(b.last().unwrap()["type"], "complete");

    assert_eq!(model.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(
        roles(&state, &id),
        vec![MessageRole::User, MessageRole::Assistant, MessageRole::User, MessageRole::Assistant]
    );
}

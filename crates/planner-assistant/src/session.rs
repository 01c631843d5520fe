//! Per-conversation session bookkeeping for the chat transport.
//!
//! Each conversation with a live connection or an unfinished turn has an entry
//! holding its turn lock. Turns of one conversation run one at a time; turns of
//! different conversations are independent.

use crate::metrics;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
pub struct SessionEntry {
    turn_lock: Mutex<()>,
    connections: AtomicUsize,
    pending_turns: AtomicUsize,
}

impl SessionEntry {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn pending_turns(&self) -> usize {
        self.pending_turns.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        self.connections() == 0 && self.pending_turns() == 0
    }
}

type SessionTable = Arc<DashMap<String, Arc<SessionEntry>>>;

fn remove_if_idle(sessions: &SessionTable, conversation_id: &str) {
    if sessions.remove_if(conversation_id, |_, entry| entry.is_idle()).is_some() {
        debug!("Released session for conversation {}", conversation_id);
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: SessionTable,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection for `conversation_id`.
    pub fn connect(&self, conversation_id: &str) {
        // Counted under the shard lock so a concurrent release cannot drop the entry.
        let entry = self.sessions.entry(conversation_id.to_string()).or_default();
        entry.connections.fetch_add(1, Ordering::SeqCst);
        metrics::inc_sessions();
        debug!("Connection opened for conversation {} ({} live)", conversation_id, entry.connections());
    }

    /// Drops a connection; the entry goes away once nothing else needs it.
    pub fn disconnect(&self, conversation_id: &str) {
        if let Some(entry) = self.sessions.get(conversation_id) {
            let _ = entry
                .connections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            metrics::dec_sessions();
        }
        remove_if_idle(&self.sessions, conversation_id);
    }

    /// Reserves a place in the conversation's turn queue.
    pub fn enqueue_turn(&self, conversation_id: &str) -> TurnTicket {
        let entry = self.sessions.entry(conversation_id.to_string()).or_default();
        entry.pending_turns.fetch_add(1, Ordering::SeqCst);
        TurnTicket {
            entry: entry.clone(),
            sessions: self.sessions.clone(),
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(conversation_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// A queued turn. Dropping it releases its place whether or not it ran.
pub struct TurnTicket {
    entry: Arc<SessionEntry>,
    sessions: SessionTable,
    conversation_id: String,
}

impl TurnTicket {
    /// Runs `turn` once every earlier turn of the conversation has finished.
    pub async fn run<F>(self, turn: F) -> F::Output
    where
        F: Future,
    {
        let _guard = self.entry.turn_lock.lock().await;
        turn.await
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        self.entry.pending_turns.fetch_sub(1, Ordering::SeqCst);
        remove_if_idle(&self.sessions, &self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_entry_lives_while_connected() {
        let registry = SessionRegistry::new();
        registry.connect("c1");
        registry.connect("c1");
        assert_eq!(registry.get("c1").unwrap().connections(), 2);

        registry.disconnect("c1");
        assert_eq!(registry.len(), 1);
        registry.disconnect("c1");
        assert!(registry.is_empty());

        // Unknown ids are a no-op.
        registry.disconnect("missing");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pending_turn_outlives_connection() {
        let registry = SessionRegistry::new();
        registry.connect("c1");
        let ticket = registry.enqueue_turn("c1");
        registry.disconnect("c1");
        assert_eq!(registry.get("c1").unwrap().pending_turns(), 1);

        ticket.run(async {}).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_turns_of_one_conversation_do_not_interleave() {
        let registry = Arc::new(SessionRegistry::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = registry.enqueue_turn("c1");
        let second = registry.enqueue_turn("c1");

        let log1 = log.clone();
        let a = tokio::spawn(first.run(async move {
            log1.lock().unwrap().push("first:start");
            tokio::time::sleep(Duration::from_millis(50)).await;
            log1.lock().unwrap().push("first:end");
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let log2 = log.clone();
        let b = tokio::spawn(second.run(async move {
            log2.lock().unwrap().push("second:start");
        }));

        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first:start", "first:end", "second:start"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_other_conversations_proceed_independently() {
        let registry = SessionRegistry::new();
        let slow = registry.enqueue_turn("c1");
        let _held = slow.entry.turn_lock.lock().await;

        let other = registry.enqueue_turn("c2");
        let finished = tokio::time::timeout(Duration::from_millis(100), other.run(async { 42 })).await;
        assert_eq!(finished.unwrap(), 42);
    }
}

use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Conversation row plus the number of messages it holds.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub message_count: i64,
}

pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    pub fn create_conversation(&self, title: Option<&str>) -> anyhow::Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![&id, title, now.to_rfc3339(), now.to_rfc3339()],
        )?;
        info!("Created conversation {}", id);
        Ok(Conversation {
            id,
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated first.
    pub fn list_conversations(&self, limit: usize) -> anyhow::Result<Vec<ConversationSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.title, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
             FROM conversations c
             ORDER BY c.updated_at DESC, c.rowid DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(ConversationSummary {
                conversation: row_to_conversation(row)?,
                message_count: row.get(4)?,
            });
        }
        Ok(conversations)
    }

    /// Returns false when the conversation does not exist.
    pub fn update_title(&self, id: &str, title: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), id],
        )?;
        if updated > 0 {
            info!("Updated conversation {} title to: {}", id, title);
        }
        Ok(updated > 0)
    }

    pub fn delete_conversation(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        if deleted > 0 {
            info!("Deleted conversation {}", id);
        }
        Ok(deleted > 0)
    }

    /// Appends a message at the next position. Position assignment and the
    /// insert share one immediate transaction so concurrent appends cannot collide.
    pub fn append_message(&self, conversation_id: &str, message: NewMessage) -> anyhow::Result<StoredMessage> {
        let mut conn = self.get_conn()?;
        let now = Utc::now();
        let payload_json = message.payload.as_ref().map(serde_json::to_string).transpose()?;
        let attachments_json = if message.attachments.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.attachments)?)
        };

        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM conversations WHERE id = ?1", [conversation_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(anyhow::anyhow!("Conversation {} not found", conversation_id));
        }

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO messages
             (conversation_id, position, role, content, payload, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation_id,
                position,
                message.role.as_str(),
                &message.content,
                payload_json,
                attachments_json,
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;
        tx.commit()?;

        debug!(
            "Appended {} message #{} to conversation {}",
            message.role.as_str(),
            position,
            conversation_id
        );
        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            position,
            role: message.role,
            content: message.content,
            payload: message.payload,
            attachments: message.attachments,
            created_at: now,
        })
    }

    /// Messages in position order, optionally capped to the first `limit`.
    pub fn get_messages(&self, conversation_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, position, role, content, payload, attachments, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY position LIMIT ?2",
        )?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut rows = stmt.query(params![conversation_id, limit])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_stored_message(row)?);
        }
        Ok(messages)
    }

    /// The last `limit` messages, returned oldest first.
    pub fn get_recent_messages(&self, conversation_id: &str, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, position, role, content, payload, attachments, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY position DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![conversation_id, limit as i64])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_stored_message(row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn message_count(&self, conversation_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_conversation(row: &Row) -> anyhow::Result<Conversation> {
    let created_at = parse_timestamp(&row.get::<_, String>(2)?)
        .unwrap_or_else(|| { warn!("Failed parse conversation created_at"); Utc::now() });
    let updated_at = parse_timestamp(&row.get::<_, String>(3)?)
        .unwrap_or_else(|| { warn!("Failed parse conversation updated_at"); Utc::now() });
    Ok(Conversation { id: row.get(0)?, title: row.get(1)?, created_at, updated_at })
}

fn row_to_stored_message(row: &Row) -> anyhow::Result<StoredMessage> {
    let role_str: String = row.get(3)?;
    let role = MessageRole::parse(&role_str)
        .ok_or_else(|| anyhow::anyhow!("Unknown message role '{}'", role_str))?;
    let payload = row
        .get::<_, Option<String>>(5)?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| anyhow::anyhow!("Payload JSON error: {}", e))?;
    let attachments = match row.get::<_, Option<String>>(6)? {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| anyhow::anyhow!("Attachments JSON error: {}", e))?,
        None => Vec::new(),
    };
    let created_at = parse_timestamp(&row.get::<_, String>(7)?)
        .unwrap_or_else(|| { warn!("Failed parse message created_at"); Utc::now() });

    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        position: row.get(2)?,
        role,
        content: row.get(4)?,
        payload,
        attachments,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::{FileRef, MessageRole, NewMessage, PlannerDatabase};
    use serde_json::json;

    #[test]
    fn test_messages_keep_insertion_order() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let conversation = store.create_conversation(None).unwrap();

        store.append_message(&conversation.id, NewMessage::user("first", Vec::new())).unwrap();
        store
            .append_message(
                &conversation.id,
                NewMessage::tool_result("add_todo", json!({"tool": "add_todo", "result": {"success": true}})),
            )
            .unwrap();
        store.append_message(&conversation.id, NewMessage::assistant("third")).unwrap();

        let messages = store.get_messages(&conversation.id, None).unwrap();
        let positions: Vec<i64> = messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].role, MessageRole::ToolResult);
        assert_eq!(messages[1].payload.as_ref().unwrap()["tool"], "add_todo");
        assert_eq!(messages[2].content, "third");
    }

    #[test]
    fn test_recent_messages_are_chronological() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let conversation = store.create_conversation(None).unwrap();
        for i in 0..5 {
            store
                .append_message(&conversation.id, NewMessage::user(format!("m{}", i), Vec::new()))
                .unwrap();
        }

        let recent = store.get_recent_messages(&conversation.id, 2).unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[test]
    fn test_attachments_round_trip_with_message() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let conversation = store.create_conversation(None).unwrap();
        let file = FileRef { id: "f1".into(), name: "agenda.pdf".into(), mime_type: "application/pdf".into() };

        store
            .append_message(&conversation.id, NewMessage::user("see attached", vec![file.clone()]))
            .unwrap();

        let messages = store.get_messages(&conversation.id, None).unwrap();
        assert_eq!(messages[0].attachments, vec![file]);
    }

    #[test]
    fn test_append_to_missing_conversation_fails() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let result = db.conversations.append_message("nope", NewMessage::user("hi", Vec::new()));
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_cascades_messages() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let conversation = store.create_conversation(Some("tmp")).unwrap();
        store.append_message(&conversation.id, NewMessage::user("hi", Vec::new())).unwrap();

        assert!(store.delete_conversation(&conversation.id).unwrap());
        assert!(store.get_conversation(&conversation.id).unwrap().is_none());
        assert_eq!(store.message_count(&conversation.id).unwrap(), 0);
        assert!(!store.delete_conversation(&conversation.id).unwrap());
    }

    #[test]
    fn test_list_orders_by_recent_activity() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let older = store.create_conversation(Some("older")).unwrap();
        let newer = store.create_conversation(Some("newer")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.append_message(&older.id, NewMessage::user("bump", Vec::new())).unwrap();

        let listed = store.list_conversations(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].conversation.id, older.id);
        assert_eq!(listed[0].message_count, 1);
        assert_eq!(listed[1].conversation.id, newer.id);
    }

    #[test]
    fn test_update_title() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.conversations;
        let conversation = store.create_conversation(None).unwrap();

        assert!(store.update_title(&conversation.id, "Dentist planning").unwrap());
        let fetched = store.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Dentist planning"));
        assert!(!store.update_title("missing", "x").unwrap());
    }
}

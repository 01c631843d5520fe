//! Planner database module - SQLite-backed storage for conversations, knowledge, calendars and todos
pub mod schema;
pub mod conversation_store;
pub mod knowledge_store;
pub mod calendar_store;
pub mod todo_store;
pub use schema::*;
pub use conversation_store::{ConversationStore, ConversationSummary};
pub use knowledge_store::KnowledgeStore;
pub use calendar_store::{CalendarStore, CalendarUpdate, NewCalendar};
pub use todo_store::{NewTodo, TodoStore, TodoUpdate};
use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub(crate) type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub(crate) fn get_conn(pool: &DbPool) -> anyhow::Result<PooledConn> {
    pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
}

/// Entry point to all persisted planner state.
pub struct PlannerDatabase {
    pub conversations: ConversationStore,
    pub knowledge: KnowledgeStore,
    pub calendars: CalendarStore,
    pub todos: TodoStore,
    pool: DbPool,
}

impl PlannerDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening planner database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        info!("Planner database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// In-memory database; a single pooled connection so every store sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(schema::SCHEMA_SQL)?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            knowledge: KnowledgeStore::new(Arc::clone(&pool)),
            calendars: CalendarStore::new(Arc::clone(&pool)),
            todos: TodoStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Liveness check used by the status endpoint.
    pub fn ping(&self) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

impl Drop for PlannerDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("planner.db");

        let id = {
            let db = PlannerDatabase::new(&path).unwrap();
            let conversation = db.conversations.create_conversation(Some("Weekly plan")).unwrap();
            db.conversations
                .append_message(&conversation.id, NewMessage::user("hello", Vec::new()))
                .unwrap();
            conversation.id
        };

        let db = PlannerDatabase::new(&path).unwrap();
        let conversation = db.conversations.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conversation.title.as_deref(), Some("Weekly plan"));
        assert_eq!(db.conversations.message_count(&id).unwrap(), 1);
    }

    #[test]
    fn test_ping_in_memory() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        assert!(db.ping().is_ok());
    }
}

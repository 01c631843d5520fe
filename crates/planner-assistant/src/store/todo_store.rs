use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::{debug, warn};

const TODO_COLUMNS: &str = "id, title, description, priority, start_date, due_date, estimated_minutes, \
                            completed, completed_at, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct NewTodo {
    pub title: String,
    pub description: Option<String>,
    pub priority: TodoPriority,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_minutes: Option<i64>,
}

/// Partial patch. Outer `None` leaves a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TodoUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<TodoPriority>,
    pub start_date: Option<Option<DateTime<Utc>>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub estimated_minutes: Option<Option<i64>>,
    pub completed: Option<bool>,
}

pub struct TodoStore {
    pool: DbPool,
}

impl TodoStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    pub fn add(&self, todo: NewTodo) -> anyhow::Result<Todo> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO todos
             (title, description, priority, start_date, due_date, estimated_minutes, completed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, FALSE, ?7, ?7)",
            params![
                &todo.title,
                &todo.description,
                todo.priority.as_str(),
                todo.start_date.map(|d| d.to_rfc3339()),
                todo.due_date.map(|d| d.to_rfc3339()),
                todo.estimated_minutes,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Added todo #{}: {}", id, todo.title);
        Ok(Todo {
            id,
            title: todo.title,
            description: todo.description,
            priority: todo.priority,
            start_date: todo.start_date,
            due_date: todo.due_date,
            estimated_minutes: todo.estimated_minutes,
            completed: false,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Open items first, then by due date (undated last).
    pub fn list(&self, include_completed: bool) -> anyhow::Result<Vec<Todo>> {
        let conn = self.get_conn()?;
        let filter = if include_completed { "" } else { "WHERE completed = FALSE" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM todos {} ORDER BY completed, due_date IS NULL, due_date, id",
            TODO_COLUMNS, filter
        ))?;
        let mut rows = stmt.query([])?;
        let mut todos = Vec::new();
        while let Some(row) = rows.next()? {
            todos.push(row_to_todo(row)?);
        }
        Ok(todos)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Todo>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM todos WHERE id = ?1", TODO_COLUMNS))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_todo(row)?)),
            None => Ok(None),
        }
    }

    /// Applies a patch. Completing stamps `completed_at`; reopening clears it.
    pub fn update(&self, id: i64, update: TodoUpdate) -> anyhow::Result<Option<Todo>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let current = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM todos WHERE id = ?1", TODO_COLUMNS))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_todo(row)?,
                None => return Ok(None),
            }
        };

        let now = Utc::now();
        let mut todo = current;
        if let Some(title) = update.title {
            todo.title = title;
        }
        if let Some(description) = update.description {
            todo.description = description;
        }
        if let Some(priority) = update.priority {
            todo.priority = priority;
        }
        if let Some(start_date) = update.start_date {
            todo.start_date = start_date;
        }
        if let Some(due_date) = update.due_date {
            todo.due_date = due_date;
        }
        if let Some(estimated_minutes) = update.estimated_minutes {
            todo.estimated_minutes = estimated_minutes;
        }
        if let Some(completed) = update.completed {
            todo.completed = completed;
            todo.completed_at = if completed { Some(now) } else { None };
        }
        todo.updated_at = now;

        tx.execute(
            "UPDATE todos SET title = ?1, description = ?2, priority = ?3, start_date = ?4, due_date = ?5,
                    estimated_minutes = ?6, completed = ?7, completed_at = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                &todo.title,
                &todo.description,
                todo.priority.as_str(),
                todo.start_date.map(|d| d.to_rfc3339()),
                todo.due_date.map(|d| d.to_rfc3339()),
                todo.estimated_minutes,
                todo.completed,
                todo.completed_at.map(|d| d.to_rfc3339()),
                now.to_rfc3339(),
                id,
            ],
        )?;
        tx.commit()?;
        Ok(Some(todo))
    }

    /// Hard delete; returns the removed item.
    pub fn delete(&self, id: i64) -> anyhow::Result<Option<Todo>> {
        let existing = self.get(id)?;
        if existing.is_some() {
            let conn = self.get_conn()?;
            conn.execute("DELETE FROM todos WHERE id = ?1", [id])?;
            debug!("Deleted todo #{}", id);
        }
        Ok(existing)
    }
}

fn optional_timestamp(row: &Row, idx: usize) -> anyhow::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<String>>(idx)?.and_then(|s| parse_timestamp(&s)))
}

fn row_to_todo(row: &Row) -> anyhow::Result<Todo> {
    let priority: String = row.get(3)?;
    let created_at = parse_timestamp(&row.get::<_, String>(9)?)
        .unwrap_or_else(|| { warn!("Failed parse todo created_at"); Utc::now() });
    let updated_at = parse_timestamp(&row.get::<_, String>(10)?)
        .unwrap_or_else(|| { warn!("Failed parse todo updated_at"); Utc::now() });
    Ok(Todo {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        priority: TodoPriority::parse(&priority).unwrap_or_default(),
        start_date: optional_timestamp(row, 4)?,
        due_date: optional_timestamp(row, 5)?,
        estimated_minutes: row.get(6)?,
        completed: row.get(7)?,
        completed_at: optional_timestamp(row, 8)?,
        created_at,
        updated_at,
    })
}

use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::Deserialize;
use tracing::{info, warn};

const CALENDAR_COLUMNS: &str =
    "id, name, external_id, permission, color, priority, active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewCalendar {
    pub name: String,
    pub external_id: String,
    pub permission: CalendarPermission,
    pub color: Option<String>,
    pub priority: i64,
}

impl NewCalendar {
    pub fn new(name: impl Into<String>, external_id: impl Into<String>, permission: CalendarPermission) -> Self {
        Self {
            name: name.into(),
            external_id: external_id.into(),
            permission,
            color: None,
            priority: 5,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalendarUpdate {
    pub name: Option<String>,
    pub permission: Option<CalendarPermission>,
    pub color: Option<String>,
    pub priority: Option<i64>,
    pub active: Option<bool>,
}

pub struct CalendarStore {
    pool: DbPool,
}

impl CalendarStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    pub fn add(&self, calendar: NewCalendar) -> anyhow::Result<TrackedCalendar> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO calendars (name, external_id, permission, color, priority, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, TRUE, ?6, ?6)",
            params![
                &calendar.name,
                &calendar.external_id,
                calendar.permission.as_str(),
                &calendar.color,
                calendar.priority,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "Tracking calendar #{} '{}' ({}) as {}",
            id,
            calendar.name,
            calendar.external_id,
            calendar.permission.as_str()
        );
        Ok(TrackedCalendar {
            id,
            name: calendar.name,
            external_id: calendar.external_id,
            permission: calendar.permission,
            color: calendar.color,
            priority: calendar.priority,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Active calendars ordered by priority, then insertion.
    pub fn list_active(&self) -> anyhow::Result<Vec<TrackedCalendar>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calendars WHERE active = TRUE ORDER BY priority, id",
            CALENDAR_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut calendars = Vec::new();
        while let Some(row) = rows.next()? {
            calendars.push(row_to_calendar(row)?);
        }
        Ok(calendars)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<TrackedCalendar>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM calendars WHERE id = ?1", CALENDAR_COLUMNS))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_calendar(row)?)),
            None => Ok(None),
        }
    }

    /// The active tracked calendar bound to a provider calendar id, if any.
    pub fn find_by_external_id(&self, external_id: &str) -> anyhow::Result<Option<TrackedCalendar>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM calendars WHERE external_id = ?1 AND active = TRUE ORDER BY id LIMIT 1",
            CALENDAR_COLUMNS
        ))?;
        let mut rows = stmt.query([external_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_calendar(row)?)),
            None => Ok(None),
        }
    }

    pub fn update(&self, id: i64, update: &CalendarUpdate) -> anyhow::Result<Option<TrackedCalendar>> {
        let updated = {
            let conn = self.get_conn()?;
            conn.execute(
                "UPDATE calendars SET
                    name = COALESCE(?1, name),
                    permission = COALESCE(?2, permission),
                    color = COALESCE(?3, color),
                    priority = COALESCE(?4, priority),
                    active = COALESCE(?5, active),
                    updated_at = ?6
                 WHERE id = ?7",
                params![
                    update.name,
                    update.permission.map(|p| p.as_str()),
                    update.color,
                    update.priority,
                    update.active,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?
        };
        if updated == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    /// Stops tracking; the row is kept with `active = FALSE`.
    pub fn deactivate(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE calendars SET active = FALSE, updated_at = ?1 WHERE id = ?2 AND active = TRUE",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if updated > 0 {
            info!("Stopped tracking calendar #{}", id);
        }
        Ok(updated > 0)
    }
}

fn row_to_calendar(row: &Row) -> anyhow::Result<TrackedCalendar> {
    let permission: String = row.get(3)?;
    let created_at = parse_timestamp(&row.get::<_, String>(7)?)
        .unwrap_or_else(|| { warn!("Failed parse calendar created_at"); Utc::now() });
    let updated_at = parse_timestamp(&row.get::<_, String>(8)?)
        .unwrap_or_else(|| { warn!("Failed parse calendar updated_at"); Utc::now() });
    Ok(TrackedCalendar {
        id: row.get(0)?,
        name: row.get(1)?,
        external_id: row.get(2)?,
        permission: CalendarPermission::parse(&permission)
            .ok_or_else(|| anyhow::anyhow!("Unknown calendar permission '{}'", permission))?,
        color: row.get(4)?,
        priority: row.get(5)?,
        active: row.get(6)?,
        created_at,
        updated_at,
    })
}

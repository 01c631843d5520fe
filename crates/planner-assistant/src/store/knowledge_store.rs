//! Knowledge, instructions and scheduling rules: the facts the assistant
//! carries between conversations.
use crate::store::schema::*;
use crate::store::{get_conn, DbPool, PooledConn};
use chrono::Utc;
use rusqlite::{params, Row};
use serde_json::Value;
use tracing::{debug, info, warn};

pub struct KnowledgeStore {
    pool: DbPool,
}

const KNOWLEDGE_COLUMNS: &str = "id, category, subject, content, source, active, created_at, updated_at";
const INSTRUCTION_COLUMNS: &str = "id, category, instruction, source, active, created_at, updated_at";
const RULE_COLUMNS: &str = "id, rule_type, name, config, active, created_at, updated_at";

impl KnowledgeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<PooledConn> {
        get_conn(&self.pool)
    }

    /// Saves a fact. An active entry in the same category whose subject contains
    /// `subject` (case-insensitive) is updated in place instead of duplicated.
    /// Returns the entry and whether it was newly created.
    pub fn save_knowledge(
        &self,
        category: &str,
        subject: &str,
        content: &str,
        source: &str,
    ) -> anyhow::Result<(KnowledgeEntry, bool)> {
        let mut conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;

        let existing: Option<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM knowledge
                 WHERE active = TRUE AND category = ?1 AND instr(LOWER(subject), LOWER(?2)) > 0
                 ORDER BY id LIMIT 1",
            )?;
            let mut rows = stmt.query(params![category, subject])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        let (id, created) = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE knowledge SET content = ?1, source = ?2, updated_at = ?3 WHERE id = ?4",
                    params![content, source, &now, id],
                )?;
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO knowledge (category, subject, content, source, active, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, TRUE, ?5, ?5)",
                    params![category, subject, content, source, &now],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };
        tx.commit()?;
        drop(conn);

        debug!("Saved knowledge #{} ({}/{}), created={}", id, category, subject, created);
        let entry = self
            .get_knowledge(id)?
            .ok_or_else(|| anyhow::anyhow!("Knowledge entry {} vanished after save", id))?;
        Ok((entry, created))
    }

    pub fn get_knowledge(&self, id: i64) -> anyhow::Result<Option<KnowledgeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM knowledge WHERE id = ?1", KNOWLEDGE_COLUMNS))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_knowledge(row)?)),
            None => Ok(None),
        }
    }

    /// Case-insensitive substring search over subject, content and category.
    pub fn search_knowledge(&self, query: &str) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge
             WHERE active = TRUE
               AND (instr(LOWER(subject), LOWER(?1)) > 0
                    OR instr(LOWER(content), LOWER(?1)) > 0
                    OR instr(LOWER(category), LOWER(?1)) > 0)
             ORDER BY category, id",
            KNOWLEDGE_COLUMNS
        ))?;
        let mut rows = stmt.query([query])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_knowledge(row)?);
        }
        Ok(entries)
    }

    pub fn list_knowledge(&self) -> anyhow::Result<Vec<KnowledgeEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge WHERE active = TRUE ORDER BY category, id",
            KNOWLEDGE_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_knowledge(row)?);
        }
        Ok(entries)
    }

    pub fn count_knowledge(&self) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM knowledge WHERE active = TRUE", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Returns the updated entry, or None when no entry has that id.
    pub fn update_knowledge(&self, id: i64, content: &str) -> anyhow::Result<Option<KnowledgeEntry>> {
        let updated = {
            let conn = self.get_conn()?;
            conn.execute(
                "UPDATE knowledge SET content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, Utc::now().to_rfc3339(), id],
            )?
        };
        if updated == 0 {
            return Ok(None);
        }
        self.get_knowledge(id)
    }

    /// Soft delete.
    pub fn deactivate_knowledge(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE knowledge SET active = FALSE, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn add_instruction(
        &self,
        category: &str,
        instruction: &str,
        source: InstructionSource,
    ) -> anyhow::Result<Instruction> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO instructions (category, instruction, source, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, TRUE, ?4, ?4)",
            params![category, instruction, source.as_str(), now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        info!("Added {} instruction #{} ({})", source.as_str(), id, category);
        Ok(Instruction {
            id,
            category: category.to_string(),
            instruction: instruction.to_string(),
            source,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_instructions(&self) -> anyhow::Result<Vec<Instruction>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instructions WHERE active = TRUE ORDER BY category, id",
            INSTRUCTION_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut instructions = Vec::new();
        while let Some(row) = rows.next()? {
            instructions.push(row_to_instruction(row)?);
        }
        Ok(instructions)
    }

    pub fn update_instruction(&self, id: i64, instruction: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE instructions SET instruction = ?1, updated_at = ?2 WHERE id = ?3",
            params![instruction, Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn deactivate_instruction(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE instructions SET active = FALSE, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn add_rule(&self, rule_type: &str, name: &str, config: &Value) -> anyhow::Result<SchedulingRule> {
        let now = Utc::now();
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO scheduling_rules (rule_type, name, config, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, TRUE, ?4, ?4)",
            params![rule_type, name, serde_json::to_string(config)?, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        info!("Added scheduling rule #{}: {}", id, name);
        Ok(SchedulingRule {
            id,
            rule_type: rule_type.to_string(),
            name: name.to_string(),
            config: config.clone(),
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_rules(&self) -> anyhow::Result<Vec<SchedulingRule>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduling_rules WHERE active = TRUE ORDER BY id",
            RULE_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next()? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    pub fn update_rule_config(&self, id: i64, config: &Value) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE scheduling_rules SET config = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(config)?, Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub fn deactivate_rule(&self, id: i64) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE scheduling_rules SET active = FALSE, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }
}

fn timestamp_at(row: &Row, idx: usize, what: &str) -> anyhow::Result<chrono::DateTime<Utc>> {
    Ok(parse_timestamp(&row.get::<_, String>(idx)?)
        .unwrap_or_else(|| { warn!("Failed parse {}", what); Utc::now() }))
}

fn row_to_knowledge(row: &Row) -> anyhow::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        category: row.get(1)?,
        subject: row.get(2)?,
        content: row.get(3)?,
        source: row.get(4)?,
        active: row.get(5)?,
        created_at: timestamp_at(row, 6, "knowledge created_at")?,
        updated_at: timestamp_at(row, 7, "knowledge updated_at")?,
    })
}

fn row_to_instruction(row: &Row) -> anyhow::Result<Instruction> {
    let source: String = row.get(3)?;
    Ok(Instruction {
        id: row.get(0)?,
        category: row.get(1)?,
        instruction: row.get(2)?,
        source: InstructionSource::parse(&source).unwrap_or(InstructionSource::User),
        active: row.get(4)?,
        created_at: timestamp_at(row, 5, "instruction created_at")?,
        updated_at: timestamp_at(row, 6, "instruction updated_at")?,
    })
}

fn row_to_rule(row: &Row) -> anyhow::Result<SchedulingRule> {
    let config_json: String = row.get(3)?;
    let config = serde_json::from_str(&config_json)
        .map_err(|e| anyhow::anyhow!("Rule config JSON error: {}", e))?;
    Ok(SchedulingRule {
        id: row.get(0)?,
        rule_type: row.get(1)?,
        name: row.get(2)?,
        config,
        active: row.get(4)?,
        created_at: timestamp_at(row, 5, "rule created_at")?,
        updated_at: timestamp_at(row, 6, "rule updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use crate::store::{InstructionSource, PlannerDatabase};
    use serde_json::json;

    #[test]
    fn test_save_knowledge_upserts_matching_subject() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.knowledge;

        let (first, created) = store
            .save_knowledge("people", "Sarah Jones", "Works in marketing", "conversation")
            .unwrap();
        assert!(created);

        let (second, created) = store
            .save_knowledge("people", "sarah", "Moved to sales", "conversation")
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.subject, "Sarah Jones");
        assert_eq!(second.content, "Moved to sales");

        // Different category is a separate fact.
        let (third, created) = store
            .save_knowledge("business", "Sarah", "Client since 2021", "conversation")
            .unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
        assert_eq!(store.count_knowledge().unwrap(), 2);
    }

    #[test]
    fn test_search_matches_any_field() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.knowledge;
        store.save_knowledge("preferences", "mornings", "Prefers deep work before noon", "conversation").unwrap();
        store.save_knowledge("business", "Acme", "Quarterly review in March", "conversation").unwrap();

        assert_eq!(store.search_knowledge("NOON").unwrap().len(), 1);
        assert_eq!(store.search_knowledge("business").unwrap().len(), 1);
        assert_eq!(store.search_knowledge("acme").unwrap()[0].subject, "Acme");
        assert!(store.search_knowledge("vacation").unwrap().is_empty());
    }

    #[test]
    fn test_deactivated_knowledge_is_hidden() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.knowledge;
        let (entry, _) = store.save_knowledge("general", "gym", "Tuesdays", "conversation").unwrap();

        assert!(store.deactivate_knowledge(entry.id).unwrap());
        assert!(store.list_knowledge().unwrap().is_empty());
        assert!(store.search_knowledge("gym").unwrap().is_empty());

        // A new save after deactivation creates a fresh entry.
        let (again, created) = store.save_knowledge("general", "gym", "Thursdays", "conversation").unwrap();
        assert!(created);
        assert_ne!(again.id, entry.id);
    }

    #[test]
    fn test_update_missing_knowledge_returns_none() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        assert!(db.knowledge.update_knowledge(42, "x").unwrap().is_none());
    }

    #[test]
    fn test_instructions_and_rules() {
        let db = PlannerDatabase::new_in_memory().unwrap();
        let store = &db.knowledge;

        let instruction = store
            .add_instruction("communication", "Keep answers short", InstructionSource::AiLearned)
            .unwrap();
        store.add_instruction("scheduling", "Leave Fridays free", InstructionSource::User).unwrap();
        let listed = store.list_instructions().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].category, "communication");
        assert_eq!(listed[0].source, InstructionSource::AiLearned);

        assert!(store.update_instruction(instruction.id, "Be brief").unwrap());
        assert!(store.deactivate_instruction(instruction.id).unwrap());
        assert_eq!(store.list_instructions().unwrap().len(), 1);

        let rule = store
            .add_rule("constraint", "No meetings before 10am", &json!({"earliest_hour": 10}))
            .unwrap();
        assert_eq!(store.list_rules().unwrap()[0].config["earliest_hour"], 10);
        assert!(store.update_rule_config(rule.id, &json!({"earliest_hour": 11})).unwrap());
        assert_eq!(store.list_rules().unwrap()[0].config["earliest_hour"], 11);
        assert!(store.deactivate_rule(rule.id).unwrap());
        assert!(store.list_rules().unwrap().is_empty());
    }
}

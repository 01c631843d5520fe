//! Builds the system preamble for each model turn from the stores and calendar

use crate::calendar::{format_schedule_summary, CalendarGateway};
use crate::store::PlannerDatabase;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const BASE_PROMPT: &str = "You are an intelligent planning assistant. You help schedule tasks, manage calendars, \
and learn about the user to become more helpful over time.

## Core Capabilities
- Schedule tasks and events on the user's calendars
- Check calendar availability across multiple calendars
- Keep a to-do list with priorities, start dates and due dates
- Remember what the user tells you about their business, people and preferences
- Adjust your own behavior when the user gives you instructions
- Track additional calendars on request

## Personality
- Be conversational but efficient
- Ask clarifying questions when a request is ambiguous
- Ask for context that would help you assist better
- Be direct and helpful";

const TOOL_GUIDANCE: &str = "## How to Use Your Tools

### Calendar
- Use `check_availability` to find free slots, then let the user pick one
- Use `schedule_task` only after the user confirmed the time
- Use `get_day_schedule` or `get_week_overview` for schedule context
- Use `reschedule_task` and `cancel_event` to change existing events
- Events can only be written to calendars with read & write access

### Memory
- Use `save_knowledge` when you learn something important about the user
- Use `add_instruction` when the user tells you how to behave
- Use `add_scheduling_rule` for scheduling preferences; honor these rules when proposing times
- Use `add_calendar` after `list_provider_calendars` when the user wants a new calendar tracked

### Guidelines
1. Always confirm before creating or modifying calendar events
2. Save important context as you learn it
3. Ask for clarification when the request is ambiguous";

/// "task_types" -> "Task Types"
fn title_case(category: &str) -> String {
    category
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Renders `### Category` groups of bullet lines, keeping categories sorted.
fn grouped_section(heading: &str, items: Vec<(String, String)>) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (category, line) in items {
        groups.entry(category).or_default().push(line);
    }
    let mut parts = vec![heading.to_string()];
    for (category, lines) in groups {
        parts.push(format!("\n### {}", title_case(&category)));
        parts.extend(lines.into_iter().map(|line| format!("- {}", line)));
    }
    Some(parts.join("\n"))
}

/// Assembles the per-turn system prompt. Each section is read fresh so that
/// knowledge saved during a turn is visible to the next one.
pub struct ContextBuilder {
    db: Arc<PlannerDatabase>,
    calendar: Arc<CalendarGateway>,
    timezone: Tz,
}

impl ContextBuilder {
    pub fn new(db: Arc<PlannerDatabase>, calendar: Arc<CalendarGateway>) -> Self {
        let timezone = calendar.timezone();
        Self { db, calendar, timezone }
    }

    /// Sections that cannot be read are left out; the turn goes ahead without them.
    pub async fn build_preamble(&self, now: DateTime<Utc>) -> String {
        let mut parts = vec![BASE_PROMPT.to_string(), self.time_section(now)];

        parts.extend(self.instructions_section());
        parts.extend(self.knowledge_section());
        parts.extend(self.calendars_section());
        parts.extend(self.rules_section());
        parts.extend(self.today_section(now).await);
        parts.push(TOOL_GUIDANCE.to_string());

        debug!("Built preamble with {} sections", parts.len());
        parts.join("\n\n")
    }

    fn time_section(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.timezone);
        format!(
            "## Current Context\n- Current time: {}\n- Today: {}\n- Timezone: {}",
            local.format("%I:%M %p"),
            local.format("%A, %B %d, %Y"),
            self.timezone.name()
        )
    }

    fn instructions_section(&self) -> Option<String> {
        let instructions = match self.db.knowledge.list_instructions() {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipping instructions in preamble: {}", e);
                return None;
            }
        };
        grouped_section(
            "## Custom Instructions",
            instructions.into_iter().map(|i| (i.category, i.instruction)).collect(),
        )
    }

    fn knowledge_section(&self) -> Option<String> {
        let entries = match self.db.knowledge.list_knowledge() {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipping knowledge in preamble: {}", e);
                return None;
            }
        };
        grouped_section(
            "## What I Know About You",
            entries
                .into_iter()
                .map(|k| (k.category, format!("**{}**: {}", k.subject, k.content)))
                .collect(),
        )
    }

    fn calendars_section(&self) -> Option<String> {
        let calendars = match self.db.calendars.list_active() {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipping calendars in preamble: {}", e);
                return None;
            }
        };
        if calendars.is_empty() {
            return Some(
                "## Calendars\nNo calendars configured yet. Ask the user which calendars they want to track \
                 (use `list_provider_calendars`)."
                    .to_string(),
            );
        }
        let mut parts = vec!["## Calendars I Have Access To".to_string()];
        for calendar in calendars {
            let access = if calendar.permission.is_writable() { "read & write" } else { "read only" };
            parts.push(format!("- **{}** (`{}`, {})", calendar.name, calendar.external_id, access));
        }
        Some(parts.join("\n"))
    }

    fn rules_section(&self) -> Option<String> {
        let rules = match self.db.knowledge.list_rules() {
            Ok(list) => list,
            Err(e) => {
                warn!("Skipping scheduling rules in preamble: {}", e);
                return None;
            }
        };
        if rules.is_empty() {
            return None;
        }
        let mut parts = vec!["## Scheduling Rules".to_string()];
        for rule in rules {
            let config = serde_json::to_string_pretty(&rule.config).unwrap_or_else(|_| rule.config.to_string());
            parts.push(format!("- **{}** ({}): {}", rule.name, rule.rule_type, config));
        }
        Some(parts.join("\n"))
    }

    async fn today_section(&self, now: DateTime<Utc>) -> Option<String> {
        let today = now.with_timezone(&self.timezone).date_naive();
        match self.calendar.day_events(today).await {
            Ok(events) if events.is_empty() => Some("## Today's Schedule\nNo events scheduled for today.".to_string()),
            Ok(events) => Some(format!(
                "## Today's Schedule\n{}",
                format_schedule_summary(&events, self.timezone)
            )),
            Err(e) => {
                debug!("Calendar unavailable for preamble: {}", e);
                None
            }
        }
    }
}

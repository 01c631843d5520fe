//! Executes resolved tool calls against the calendar gateway and the stores.
use super::dates::{parse_iso_datetime, resolve_date, resolve_todo_date, time_window};
use super::definitions::find_tool;
use super::{
    AddCalendarArgs, AddInstructionArgs, AddSchedulingRuleArgs, AddTodoArgs, CancelEventArgs, CheckAvailabilityArgs,
    DayScheduleArgs, GetKnowledgeArgs, GetTodosArgs, RemoveCalendarArgs, RescheduleTaskArgs, SaveKnowledgeArgs,
    ScheduleTaskArgs, TodoIdArgs, ToolCall, ToolOutcome, UpdateKnowledgeArgs, UpdateTodoArgs, WeekOverviewArgs,
};
use crate::calendar::{format_schedule_summary, local_midnight, CalendarEvent, CalendarGateway, EventDraft, EventPatch, SlotSearch};
use crate::config::Config;
use crate::error::ToolError;
use crate::metrics;
use crate::store::{InstructionSource, NewCalendar, NewTodo, PlannerDatabase, TodoUpdate};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KNOWLEDGE_CATEGORIES: [&str; 5] = ["business", "people", "preferences", "task_types", "general"];
const INSTRUCTION_CATEGORIES: [&str; 4] = ["scheduling", "communication", "preferences", "behavior"];
const RULE_TYPES: [&str; 4] = ["time_block", "buffer", "preference", "constraint"];
const KNOWLEDGE_SOURCE: &str = "conversation";

const SLOT_HORIZON_DAYS: u32 = 14;
const MAX_SLOTS: usize = 5;

const WHEN_FORMAT: &str = "%A, %B %d at %I:%M %p";
const DAY_FORMAT: &str = "%A, %B %d";
const TIME_FORMAT: &str = "%I:%M %p";

#[derive(Debug, Clone, Copy)]
pub struct SchedulingSettings {
    pub timezone: Tz,
    pub work_start_hour: u32,
    pub work_end_hour: u32,
}

impl SchedulingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timezone: config.timezone,
            work_start_hour: config.work_start_hour,
            work_end_hour: config.work_end_hour,
        }
    }
}

fn ensure_one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), ToolError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments(format!(
            "{} must be one of {}, got '{}'",
            field,
            allowed.join(", "),
            value
        )))
    }
}

fn positive_minutes(field: &str, minutes: i64) -> Result<Duration, ToolError> {
    if minutes <= 0 {
        return Err(ToolError::InvalidArguments(format!("{} must be positive", field)));
    }
    Ok(Duration::minutes(minutes))
}

/// Empty or "none" clears an optional todo field.
fn is_clear_marker(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text.eq_ignore_ascii_case("none")
}

pub struct ToolExecutor {
    db: Arc<PlannerDatabase>,
    calendar: Arc<CalendarGateway>,
    settings: SchedulingSettings,
}

impl ToolExecutor {
    pub fn new(db: Arc<PlannerDatabase>, calendar: Arc<CalendarGateway>, settings: SchedulingSettings) -> Self {
        Self { db, calendar, settings }
    }

    /// Runs one model tool invocation. Failures of any kind come back as an
    /// unsuccessful outcome, never as an error.
    pub async fn execute(&self, name: &str, input: &Value) -> ToolOutcome {
        let result = match ToolCall::parse(name, input) {
            Ok(call) => {
                debug!("Executing tool {} with {}", name, input);
                self.run(call).await
            }
            Err(e) => Err(e),
        };
        let outcome = result.unwrap_or_else(|e| {
            warn!("Tool {} failed ({}): {}", name, e.error_type(), e);
            ToolOutcome::failure(&e)
        });
        let label = find_tool(name).map(|spec| spec.name).unwrap_or("unknown");
        metrics::inc_tool_call(label, outcome.success);
        outcome
    }

    pub async fn run(&self, call: ToolCall) -> Result<ToolOutcome, ToolError> {
        match call {
            ToolCall::CheckAvailability(args) => self.check_availability(args).await,
            ToolCall::ScheduleTask(args) => self.schedule_task(args).await,
            ToolCall::RescheduleTask(args) => self.reschedule_task(args).await,
            ToolCall::CancelEvent(args) => self.cancel_event(args).await,
            ToolCall::GetDaySchedule(args) => self.day_schedule(args).await,
            ToolCall::GetWeekOverview(args) => self.week_overview(args).await,
            ToolCall::SaveKnowledge(args) => self.save_knowledge(args),
            ToolCall::GetKnowledge(args) => self.get_knowledge(args),
            ToolCall::UpdateKnowledge(args) => self.update_knowledge(args),
            ToolCall::AddInstruction(args) => self.add_instruction(args),
            ToolCall::AddSchedulingRule(args) => self.add_scheduling_rule(args),
            ToolCall::AddCalendar(args) => self.add_calendar(args),
            ToolCall::ListProviderCalendars(_) => self.list_provider_calendars().await,
            ToolCall::RemoveCalendar(args) => self.remove_calendar(args),
            ToolCall::AddTodo(args) => self.add_todo(args),
            ToolCall::GetTodos(args) => self.get_todos(args),
            ToolCall::UpdateTodo(args) => self.update_todo(args),
            ToolCall::DeleteTodo(args) => self.delete_todo(args),
        }
    }

    fn tz(&self) -> Tz {
        self.settings.timezone
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz()).date_naive()
    }

    fn local(&self, at: DateTime<Utc>, format: &str) -> String {
        at.with_timezone(&self.tz()).format(format).to_string()
    }

    fn resolve_day(&self, text: Option<&str>) -> Result<NaiveDate, ToolError> {
        match text {
            None => Ok(self.today()),
            Some(text) => resolve_date(text, self.today())
                .ok_or_else(|| ToolError::InvalidArguments(format!("Could not understand date '{}'", text))),
        }
    }

    fn parse_start(&self, text: &str) -> Result<DateTime<Utc>, ToolError> {
        parse_iso_datetime(text, self.tz())
            .ok_or_else(|| ToolError::InvalidArguments(format!("start_time '{}' is not an ISO 8601 timestamp", text)))
    }

    fn parse_todo_date(&self, field: &str, text: &str) -> Result<DateTime<Utc>, ToolError> {
        resolve_todo_date(text, self.tz(), Utc::now())
            .ok_or_else(|| ToolError::InvalidArguments(format!("Could not understand {} '{}'", field, text)))
    }

    fn event_json(&self, event: &CalendarEvent) -> Value {
        json!({
            "id": event.id,
            "title": event.title,
            "start": self.local(event.start, TIME_FORMAT),
            "end": self.local(event.end, TIME_FORMAT),
            "calendar_id": event.calendar_id,
            "all_day": event.all_day,
        })
    }

    async fn check_availability(&self, args: CheckAvailabilityArgs) -> Result<ToolOutcome, ToolError> {
        let duration = positive_minutes("duration_minutes", args.duration_minutes)?;
        let tz = self.tz();
        let now = Utc::now();
        let today = self.today();

        let start_at = match args.date_preference.as_deref().and_then(|p| resolve_date(p, today)) {
            Some(date) if date > today => local_midnight(tz, date),
            _ => now,
        };
        let (earliest_hour, latest_hour, evening) =
            args.time_preference.as_deref().map(time_window).unwrap_or((None, None, false));

        let search = SlotSearch {
            duration,
            start_at,
            days_ahead: SLOT_HORIZON_DAYS,
            allow_outside: args.allow_outside_hours || evening,
            earliest_hour,
            latest_hour,
            work_start_hour: self.settings.work_start_hour,
            work_end_hour: self.settings.work_end_hour,
            max_slots: MAX_SLOTS,
        };
        let slots = self.calendar.find_available_slots(&search).await?;
        if slots.is_empty() {
            return Ok(ToolOutcome::unsuccessful(format!(
                "No available slots found in the next {} days",
                SLOT_HORIZON_DAYS
            )));
        }

        let days: BTreeSet<NaiveDate> = slots.iter().map(|s| s.start.with_timezone(&tz).date_naive()).collect();
        let mut existing = Map::new();
        for day in days {
            let events = self.calendar.day_events(day).await?;
            let listed: Vec<Value> = events
                .iter()
                .map(|e| {
                    json!({
                        "title": e.title,
                        "time": format!("{} - {}", self.local(e.start, TIME_FORMAT), self.local(e.end, TIME_FORMAT)),
                    })
                })
                .collect();
            existing.insert(day.format(DAY_FORMAT).to_string(), Value::Array(listed));
        }

        let available: Vec<Value> = slots
            .iter()
            .map(|slot| {
                json!({
                    "start": slot.start.with_timezone(&tz).to_rfc3339(),
                    "end": slot.end.with_timezone(&tz).to_rfc3339(),
                    "formatted": self.local(slot.start, WHEN_FORMAT),
                })
            })
            .collect();

        Ok(ToolOutcome::ok_with(
            format!(
                "Found {} available slots. IMPORTANT: present these options together with the existing events \
                 on those days and let the user choose before scheduling anything.",
                available.len()
            ),
            json!({ "available_slots": available, "existing_events_by_day": existing }),
        ))
    }

    async fn schedule_task(&self, args: ScheduleTaskArgs) -> Result<ToolOutcome, ToolError> {
        let start = self.parse_start(&args.start_time)?;
        let duration = positive_minutes("duration_minutes", args.duration_minutes)?;
        let draft = EventDraft {
            title: args.title,
            start,
            end: start + duration,
            description: args.description,
            location: args.location,
        };
        let event = self.calendar.create_event(args.calendar_id.as_deref(), draft).await?;
        Ok(ToolOutcome::ok_with(
            format!("Scheduled '{}' for {}", event.title, self.local(event.start, WHEN_FORMAT)),
            json!({
                "event_id": event.id,
                "calendar_id": event.calendar_id,
                "start": event.start.with_timezone(&self.tz()).to_rfc3339(),
                "end": event.end.with_timezone(&self.tz()).to_rfc3339(),
            }),
        ))
    }

    async fn reschedule_task(&self, args: RescheduleTaskArgs) -> Result<ToolOutcome, ToolError> {
        let mut patch = EventPatch { title: args.title, ..Default::default() };
        match (args.start_time.as_deref(), args.duration_minutes) {
            (Some(text), Some(minutes)) => {
                let start = self.parse_start(text)?;
                patch.start = Some(start);
                patch.end = Some(start + positive_minutes("duration_minutes", minutes)?);
            }
            (Some(_), None) => {
                return Err(ToolError::InvalidArguments(
                    "duration_minutes is required when moving an event".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(ToolError::InvalidArguments(
                    "start_time is required when changing the duration".into(),
                ))
            }
            (None, None) => {}
        }
        if patch.title.is_none() && patch.start.is_none() {
            return Err(ToolError::InvalidArguments("nothing to change".into()));
        }

        let moved = patch.start.is_some();
        let event = self
            .calendar
            .update_event(args.calendar_id.as_deref(), &args.event_id, patch)
            .await?;
        let message = if moved {
            format!("Moved '{}' to {}", event.title, self.local(event.start, WHEN_FORMAT))
        } else {
            format!("Renamed event to '{}'", event.title)
        };
        Ok(ToolOutcome::ok_with(message, json!({ "event_id": event.id })))
    }

    async fn cancel_event(&self, args: CancelEventArgs) -> Result<ToolOutcome, ToolError> {
        self.calendar.delete_event(args.calendar_id.as_deref(), &args.event_id).await?;
        Ok(ToolOutcome::ok_with("Event cancelled", json!({ "event_id": args.event_id })))
    }

    async fn day_schedule(&self, args: DayScheduleArgs) -> Result<ToolOutcome, ToolError> {
        let date = self.resolve_day(args.date.as_deref())?;
        let events = self.calendar.day_events(date).await?;
        let summary = format_schedule_summary(&events, self.tz());
        let listed: Vec<Value> = events.iter().map(|e| self.event_json(e)).collect();
        Ok(ToolOutcome::ok_with(
            format!("Schedule for {}", date.format(DAY_FORMAT)),
            json!({
                "date": date.format("%Y-%m-%d").to_string(),
                "events": listed,
                "summary": summary,
            }),
        ))
    }

    async fn week_overview(&self, args: WeekOverviewArgs) -> Result<ToolOutcome, ToolError> {
        let date = self.resolve_day(args.start_date.as_deref())?;
        let week = self.calendar.week_overview(date).await?;
        let overview: Vec<Value> = week
            .iter()
            .map(|(day, events)| {
                json!({
                    "day": day.format("%A").to_string(),
                    "date": day.format("%Y-%m-%d").to_string(),
                    "event_count": events.len(),
                    "summary": format_schedule_summary(events, self.tz()),
                })
            })
            .collect();
        let first = week.first().map(|(d, _)| d.format(DAY_FORMAT).to_string()).unwrap_or_default();
        Ok(ToolOutcome::ok_with(format!("Week of {}", first), json!({ "overview": overview })))
    }

    fn save_knowledge(&self, args: SaveKnowledgeArgs) -> Result<ToolOutcome, ToolError> {
        ensure_one_of("category", &args.category, &KNOWLEDGE_CATEGORIES)?;
        let (entry, created) = self
            .db
            .knowledge
            .save_knowledge(&args.category, &args.subject, &args.content, KNOWLEDGE_SOURCE)
            .map_err(ToolError::Storage)?;
        let verb = if created { "Saved" } else { "Updated" };
        Ok(ToolOutcome::ok_with(
            format!("{} knowledge about {}", verb, entry.subject),
            json!({ "knowledge_id": entry.id, "created": created }),
        ))
    }

    fn get_knowledge(&self, args: GetKnowledgeArgs) -> Result<ToolOutcome, ToolError> {
        let entries = self.db.knowledge.search_knowledge(&args.query).map_err(ToolError::Storage)?;
        let results: Vec<Value> = entries
            .iter()
            .map(|e| json!({"id": e.id, "category": e.category, "subject": e.subject, "content": e.content}))
            .collect();
        let message = if results.is_empty() {
            format!("No knowledge found matching '{}'", args.query)
        } else {
            format!("Found {} matching entries", results.len())
        };
        Ok(ToolOutcome::ok_with(message, json!({ "results": results })))
    }

    fn update_knowledge(&self, args: UpdateKnowledgeArgs) -> Result<ToolOutcome, ToolError> {
        let entry = self
            .db
            .knowledge
            .update_knowledge(args.knowledge_id, &args.content)
            .map_err(ToolError::Storage)?
            .ok_or_else(|| ToolError::NotFound("Knowledge entry not found".into()))?;
        Ok(ToolOutcome::ok_with(
            format!("Updated knowledge about {}", entry.subject),
            json!({ "knowledge_id": entry.id }),
        ))
    }

    fn add_instruction(&self, args: AddInstructionArgs) -> Result<ToolOutcome, ToolError> {
        ensure_one_of("category", &args.category, &INSTRUCTION_CATEGORIES)?;
        let instruction = self
            .db
            .knowledge
            .add_instruction(&args.category, &args.instruction, InstructionSource::AiLearned)
            .map_err(ToolError::Storage)?;
        Ok(ToolOutcome::ok_with(
            format!("Got it. I'll remember: {}", instruction.instruction),
            json!({ "instruction_id": instruction.id }),
        ))
    }

    fn add_scheduling_rule(&self, args: AddSchedulingRuleArgs) -> Result<ToolOutcome, ToolError> {
        ensure_one_of("rule_type", &args.rule_type, &RULE_TYPES)?;
        if !args.config.is_object() {
            return Err(ToolError::InvalidArguments("config must be an object".into()));
        }
        let rule = self
            .db
            .knowledge
            .add_rule(&args.rule_type, &args.name, &args.config)
            .map_err(ToolError::Storage)?;
        info!("Added scheduling rule #{} '{}'", rule.id, rule.name);
        Ok(ToolOutcome::ok_with(
            format!("Added {} rule '{}'", rule.rule_type, rule.name),
            json!({ "rule_id": rule.id }),
        ))
    }

    fn add_calendar(&self, args: AddCalendarArgs) -> Result<ToolOutcome, ToolError> {
        let calendars = &self.db.calendars;
        if let Some(existing) = calendars.find_by_external_id(&args.calendar_id).map_err(ToolError::Storage)? {
            return Ok(ToolOutcome::unsuccessful(format!(
                "Calendar '{}' is already tracked with {} access",
                existing.name,
                existing.permission.as_str()
            )));
        }
        let tracked = calendars
            .add(NewCalendar::new(args.name, args.calendar_id, args.permission))
            .map_err(ToolError::Storage)?;
        Ok(ToolOutcome::ok_with(
            format!("Added calendar '{}' with {} access", tracked.name, tracked.permission.as_str()),
            json!({ "calendar_id": tracked.id, "external_id": tracked.external_id }),
        ))
    }

    async fn list_provider_calendars(&self) -> Result<ToolOutcome, ToolError> {
        let available = self.calendar.list_provider_calendars().await?;
        let tracked = self.calendar.tracked_calendars()?;
        let listed: Vec<Value> = available
            .iter()
            .map(|c| {
                let tracked = tracked.iter().find(|t| t.external_id == c.id);
                json!({
                    "id": c.id,
                    "name": c.name,
                    "primary": c.primary,
                    "access_role": c.access_role,
                    "tracked": tracked.is_some(),
                    "permission": tracked.map(|t| t.permission.as_str()),
                })
            })
            .collect();
        Ok(ToolOutcome::ok_with(
            format!("Found {} calendars in the account", listed.len()),
            json!({ "calendars": listed }),
        ))
    }

    fn remove_calendar(&self, args: RemoveCalendarArgs) -> Result<ToolOutcome, ToolError> {
        let calendars = &self.db.calendars;
        let calendar = calendars
            .get(args.calendar_id)
            .map_err(ToolError::Storage)?
            .filter(|c| c.active)
            .ok_or_else(|| ToolError::NotFound(format!("Calendar {} not found", args.calendar_id)))?;
        calendars.deactivate(calendar.id).map_err(ToolError::Storage)?;
        Ok(ToolOutcome::ok(format!("Stopped tracking calendar '{}'", calendar.name)))
    }

    fn add_todo(&self, args: AddTodoArgs) -> Result<ToolOutcome, ToolError> {
        let start_date = match args.start_date.as_deref().filter(|s| !is_clear_marker(s)) {
            Some(text) => Some(self.parse_todo_date("start_date", text)?),
            None => None,
        };
        let due_date = match args.due_date.as_deref().filter(|s| !is_clear_marker(s)) {
            Some(text) => Some(self.parse_todo_date("due_date", text)?),
            None => None,
        };
        if let Some(minutes) = args.estimated_minutes {
            positive_minutes("estimated_minutes", minutes)?;
        }

        let todo = self
            .db
            .todos
            .add(NewTodo {
                title: args.title,
                description: args.description,
                priority: args.priority.unwrap_or_default(),
                start_date,
                due_date,
                estimated_minutes: args.estimated_minutes,
            })
            .map_err(ToolError::Storage)?;

        let mut message = format!("Added '{}' to your to-do list", todo.title);
        if let Some(start) = todo.start_date {
            message.push_str(&format!(", starting {}", self.local(start, DAY_FORMAT)));
        }
        if let Some(due) = todo.due_date {
            message.push_str(&format!(", due {}", self.local(due, DAY_FORMAT)));
        }
        Ok(ToolOutcome::ok_with(message, json!({ "todo_id": todo.id })))
    }

    fn get_todos(&self, args: GetTodosArgs) -> Result<ToolOutcome, ToolError> {
        let todos = self.db.todos.list(args.include_completed).map_err(ToolError::Storage)?;
        let open = todos.iter().filter(|t| !t.completed).count();
        let listed: Vec<Value> = todos
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "title": t.title,
                    "description": t.description,
                    "priority": t.priority.as_str(),
                    "start_date": t.start_date.map(|d| self.local(d, DAY_FORMAT)),
                    "due_date": t.due_date.map(|d| self.local(d, DAY_FORMAT)),
                    "estimated_minutes": t.estimated_minutes,
                    "completed": t.completed,
                })
            })
            .collect();
        let message = if listed.is_empty() {
            "Your to-do list is empty".to_string()
        } else {
            format!("You have {} open to-dos", open)
        };
        Ok(ToolOutcome::ok_with(message, json!({ "todos": listed })))
    }

    fn update_todo(&self, args: UpdateTodoArgs) -> Result<ToolOutcome, ToolError> {
        let date_field = |field: &str, text: Option<&str>| -> Result<Option<Option<DateTime<Utc>>>, ToolError> {
            match text {
                None => Ok(None),
                Some(t) if is_clear_marker(t) => Ok(Some(None)),
                Some(t) => Ok(Some(Some(self.parse_todo_date(field, t)?))),
            }
        };
        let update = TodoUpdate {
            title: args.title,
            description: args.description.map(|d| if is_clear_marker(&d) { None } else { Some(d) }),
            priority: args.priority,
            start_date: date_field("start_date", args.start_date.as_deref())?,
            due_date: date_field("due_date", args.due_date.as_deref())?,
            estimated_minutes: args.estimated_minutes.map(|m| if m > 0 { Some(m) } else { None }),
            completed: args.completed,
        };

        let todo = self
            .db
            .todos
            .update(args.todo_id, update)
            .map_err(ToolError::Storage)?
            .ok_or_else(|| ToolError::NotFound(format!("Todo with ID {} not found", args.todo_id)))?;
        let message = match args.completed {
            Some(true) => format!("Marked '{}' as completed", todo.title),
            Some(false) => format!("Reopened '{}'", todo.title),
            None => format!("Updated todo '{}'", todo.title),
        };
        Ok(ToolOutcome::ok_with(message, json!({ "todo_id": todo.id })))
    }

    fn delete_todo(&self, args: TodoIdArgs) -> Result<ToolOutcome, ToolError> {
        let todo = self
            .db
            .todos
            .delete(args.todo_id)
            .map_err(ToolError::Storage)?
            .ok_or_else(|| ToolError::NotFound(format!("Todo with ID {} not found", args.todo_id)))?;
        Ok(ToolOutcome::ok(format!("Deleted todo '{}'", todo.title)))
    }
}

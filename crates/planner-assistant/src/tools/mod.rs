//! Tools the model may call: the static registry, typed calls and outcomes.
pub mod dates;
pub mod definitions;
pub mod dispatch;

pub use definitions::{find_tool, registry, tool_definitions, ToolSpec};
pub use dispatch::{SchedulingSettings, ToolExecutor};

use crate::error::ToolError;
use crate::store::{CalendarPermission, TodoPriority};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct CheckAvailabilityArgs {
    pub duration_minutes: i64,
    pub date_preference: Option<String>,
    pub time_preference: Option<String>,
    #[serde(default)]
    pub allow_outside_hours: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleTaskArgs {
    pub title: String,
    pub start_time: String,
    pub duration_minutes: i64,
    pub description: Option<String>,
    pub location: Option<String>,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleTaskArgs {
    pub event_id: String,
    pub start_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub title: Option<String>,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelEventArgs {
    pub event_id: String,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DayScheduleArgs {
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeekOverviewArgs {
    pub start_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveKnowledgeArgs {
    pub category: String,
    pub subject: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetKnowledgeArgs {
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateKnowledgeArgs {
    pub knowledge_id: i64,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddInstructionArgs {
    pub category: String,
    pub instruction: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddSchedulingRuleArgs {
    pub rule_type: String,
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

fn default_permission() -> CalendarPermission {
    CalendarPermission::Read
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddCalendarArgs {
    pub name: String,
    #[serde(alias = "google_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "default_permission")]
    pub permission: CalendarPermission,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveCalendarArgs {
    pub calendar_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddTodoArgs {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<TodoPriority>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub estimated_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetTodosArgs {
    #[serde(default)]
    pub include_completed: bool,
}

/// An empty string for `description` or a date clears that field.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTodoArgs {
    pub todo_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TodoPriority>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
    pub estimated_minutes: Option<i64>,
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoIdArgs {
    pub todo_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoArgs {}

/// Every call the model can make, with typed arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    CheckAvailability(CheckAvailabilityArgs),
    ScheduleTask(ScheduleTaskArgs),
    RescheduleTask(RescheduleTaskArgs),
    CancelEvent(CancelEventArgs),
    GetDaySchedule(DayScheduleArgs),
    GetWeekOverview(WeekOverviewArgs),
    SaveKnowledge(SaveKnowledgeArgs),
    GetKnowledge(GetKnowledgeArgs),
    UpdateKnowledge(UpdateKnowledgeArgs),
    AddInstruction(AddInstructionArgs),
    AddSchedulingRule(AddSchedulingRuleArgs),
    AddCalendar(AddCalendarArgs),
    ListProviderCalendars(NoArgs),
    RemoveCalendar(RemoveCalendarArgs),
    AddTodo(AddTodoArgs),
    GetTodos(GetTodosArgs),
    UpdateTodo(UpdateTodoArgs),
    DeleteTodo(TodoIdArgs),
}

impl ToolCall {
    /// Resolves a model tool invocation. The name must be registered; the
    /// input must match that tool's argument shape.
    pub fn parse(name: &str, input: &Value) -> Result<Self, ToolError> {
        let spec = find_tool(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = if input.is_null() { json!({}) } else { input.clone() };
        serde_json::from_value(json!({ "tool": spec.name, "args": args }))
            .map_err(|e| ToolError::InvalidArguments(format!("{}: {}", spec.name, e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::CheckAvailability(_) => "check_availability",
            ToolCall::ScheduleTask(_) => "schedule_task",
            ToolCall::RescheduleTask(_) => "reschedule_task",
            ToolCall::CancelEvent(_) => "cancel_event",
            ToolCall::GetDaySchedule(_) => "get_day_schedule",
            ToolCall::GetWeekOverview(_) => "get_week_overview",
            ToolCall::SaveKnowledge(_) => "save_knowledge",
            ToolCall::GetKnowledge(_) => "get_knowledge",
            ToolCall::UpdateKnowledge(_) => "update_knowledge",
            ToolCall::AddInstruction(_) => "add_instruction",
            ToolCall::AddSchedulingRule(_) => "add_scheduling_rule",
            ToolCall::AddCalendar(_) => "add_calendar",
            ToolCall::ListProviderCalendars(_) => "list_provider_calendars",
            ToolCall::RemoveCalendar(_) => "remove_calendar",
            ToolCall::AddTodo(_) => "add_todo",
            ToolCall::GetTodos(_) => "get_todos",
            ToolCall::UpdateTodo(_) => "update_todo",
            ToolCall::DeleteTodo(_) => "delete_todo",
        }
    }
}

/// Structured result of one tool call, returned to the model and the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), error_type: None, data: None }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self { success: true, message: message.into(), error_type: None, data: Some(data) }
    }

    /// An unsuccessful result that is not an error, e.g. nothing found.
    pub fn unsuccessful(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), error_type: None, data: None }
    }

    pub fn failure(error: &ToolError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_type: Some(error.error_type().to_string()),
            data: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({"success": self.success, "message": self.message}))
    }
}

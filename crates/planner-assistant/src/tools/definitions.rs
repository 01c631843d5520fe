//! Static tool registry: names, descriptions and JSON input schemas offered
//! to the model, in declaration order.
use crate::llm::ToolDefinition;
use lazy_static::lazy_static;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn tool(name: &'static str, description: &'static str, input_schema: Value) -> ToolSpec {
    ToolSpec { name, description, input_schema }
}

lazy_static! {
    static ref TOOL_REGISTRY: Vec<ToolSpec> = vec![
        tool(
            "check_availability",
            "Find available time slots in the calendar. Use this BEFORE scheduling anything. \
             Respects work hours unless the user asks for evenings or allows outside hours.",
            json!({
                "type": "object",
                "properties": {
                    "duration_minutes": {"type": "integer", "description": "How long the task takes, in minutes"},
                    "date_preference": {"type": "string", "description": "today, tomorrow, a weekday name, next week, or YYYY-MM-DD"},
                    "time_preference": {"type": "string", "description": "morning, afternoon, evening or after work"},
                    "allow_outside_hours": {"type": "boolean", "description": "Allow slots outside configured work hours"}
                },
                "required": ["duration_minutes"]
            }),
        ),
        tool(
            "schedule_task",
            "Create a calendar event. Only call this after the user confirmed the time.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "start_time": {"type": "string", "description": "ISO 8601 start; without an offset it is local time"},
                    "duration_minutes": {"type": "integer"},
                    "description": {"type": "string"},
                    "location": {"type": "string"},
                    "calendar_id": {"type": "string", "description": "Target calendar; defaults to the first writable calendar"}
                },
                "required": ["title", "start_time", "duration_minutes"]
            }),
        ),
        tool(
            "reschedule_task",
            "Move or rename an existing calendar event.",
            json!({
                "type": "object",
                "properties": {
                    "event_id": {"type": "string"},
                    "start_time": {"type": "string", "description": "New ISO 8601 start"},
                    "duration_minutes": {"type": "integer", "description": "Required when start_time is given"},
                    "title": {"type": "string"},
                    "calendar_id": {"type": "string"}
                },
                "required": ["event_id"]
            }),
        ),
        tool(
            "cancel_event",
            "Delete a calendar event.",
            json!({
                "type": "object",
                "properties": {
                    "event_id": {"type": "string"},
                    "calendar_id": {"type": "string"}
                },
                "required": ["event_id"]
            }),
        ),
        tool(
            "get_day_schedule",
            "Get all events for a specific day.",
            json!({
                "type": "object",
                "properties": {
                    "date": {"type": "string", "description": "today, tomorrow, a weekday name, or YYYY-MM-DD"}
                }
            }),
        ),
        tool(
            "get_week_overview",
            "Get an overview of the week's schedule, Monday to Sunday.",
            json!({
                "type": "object",
                "properties": {
                    "start_date": {"type": "string", "description": "Any day in the week, YYYY-MM-DD; defaults to this week"}
                }
            }),
        ),
        tool(
            "save_knowledge",
            "Save something learned about the user for future reference.",
            json!({
                "type": "object",
                "properties": {
                    "category": {"type": "string", "enum": ["business", "people", "preferences", "task_types", "general"]},
                    "subject": {"type": "string", "description": "Short topic, e.g. a person's name"},
                    "content": {"type": "string"}
                },
                "required": ["category", "subject", "content"]
            }),
        ),
        tool(
            "get_knowledge",
            "Search stored knowledge about the user.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        ),
        tool(
            "update_knowledge",
            "Replace the content of a stored knowledge entry.",
            json!({
                "type": "object",
                "properties": {
                    "knowledge_id": {"type": "integer"},
                    "content": {"type": "string"}
                },
                "required": ["knowledge_id", "content"]
            }),
        ),
        tool(
            "add_instruction",
            "Record a standing instruction about how the assistant should behave.",
            json!({
                "type": "object",
                "properties": {
                    "category": {"type": "string", "enum": ["scheduling", "communication", "preferences", "behavior"]},
                    "instruction": {"type": "string"}
                },
                "required": ["category", "instruction"]
            }),
        ),
        tool(
            "add_scheduling_rule",
            "Add a scheduling rule such as a protected time block or a buffer between meetings.",
            json!({
                "type": "object",
                "properties": {
                    "rule_type": {"type": "string", "enum": ["time_block", "buffer", "preference", "constraint"]},
                    "name": {"type": "string"},
                    "config": {"type": "object", "description": "Rule parameters, e.g. {\"start\": \"12:00\", \"end\": \"13:00\"}"}
                },
                "required": ["rule_type", "name", "config"]
            }),
        ),
        tool(
            "add_calendar",
            "Start tracking a provider calendar. Use list_provider_calendars first to find its id.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "calendar_id": {"type": "string", "description": "Provider calendar id"},
                    "permission": {"type": "string", "enum": ["read", "read_write"]}
                },
                "required": ["name", "calendar_id"]
            }),
        ),
        tool(
            "list_provider_calendars",
            "List every calendar visible in the connected calendar account.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "remove_calendar",
            "Stop tracking a calendar.",
            json!({
                "type": "object",
                "properties": {"calendar_id": {"type": "integer", "description": "Tracked calendar id"}},
                "required": ["calendar_id"]
            }),
        ),
        tool(
            "add_todo",
            "Add an item to the to-do list.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "priority": {"type": "string", "enum": ["high", "medium", "low"]},
                    "start_date": {"type": "string", "description": "When work can start; today, tomorrow, a weekday, or ISO date"},
                    "due_date": {"type": "string", "description": "Deadline; today, tomorrow, a weekday, or ISO date"},
                    "estimated_minutes": {"type": "integer"}
                },
                "required": ["title"]
            }),
        ),
        tool(
            "get_todos",
            "List to-do items.",
            json!({
                "type": "object",
                "properties": {"include_completed": {"type": "boolean"}}
            }),
        ),
        tool(
            "update_todo",
            "Update a to-do item or mark it completed. An empty string clears description or dates.",
            json!({
                "type": "object",
                "properties": {
                    "todo_id": {"type": "integer"},
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "priority": {"type": "string", "enum": ["high", "medium", "low"]},
                    "start_date": {"type": "string"},
                    "due_date": {"type": "string"},
                    "estimated_minutes": {"type": "integer"},
                    "completed": {"type": "boolean"}
                },
                "required": ["todo_id"]
            }),
        ),
        tool(
            "delete_todo",
            "Delete a to-do item.",
            json!({
                "type": "object",
                "properties": {"todo_id": {"type": "integer"}},
                "required": ["todo_id"]
            }),
        ),
    ];
}

pub fn registry() -> &'static [ToolSpec] {
    &TOOL_REGISTRY
}

pub fn find_tool(name: &str) -> Option<&'static ToolSpec> {
    TOOL_REGISTRY.iter().find(|entry| entry.name == name)
}

/// Tool definitions in the shape the model API expects.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    TOOL_REGISTRY
        .iter()
        .map(|entry| ToolDefinition {
            name: entry.name.to_string(),
            description: entry.description.to_string(),
            input_schema: entry.input_schema.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_names_are_unique() {
        let names: HashSet<&str> = registry().iter().map(|s| s.name).collect();
        assert_eq!(names.len(), registry().len());
        assert_eq!(registry().len(), 18);
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let definitions = tool_definitions();
        assert_eq!(definitions.first().unwrap().name, "check_availability");
        assert_eq!(definitions.last().unwrap().name, "delete_todo");
    }

    #[test]
    fn test_required_fields_are_declared_properties() {
        for entry in registry() {
            assert_eq!(entry.input_schema["type"], "object", "{}", entry.name);
            let properties = entry.input_schema["properties"].as_object().unwrap();
            if let Some(required) = entry.input_schema.get("required").and_then(|r| r.as_array()) {
                for field in required {
                    let field = field.as_str().unwrap();
                    assert!(properties.contains_key(field), "{} requires undeclared {}", entry.name, field);
                }
            }
        }
    }

    #[test]
    fn test_find_tool() {
        assert!(find_tool("get_todos").is_some());
        assert!(find_tool("drop_database").is_none());
    }
}

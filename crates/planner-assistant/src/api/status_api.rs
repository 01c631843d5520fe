//! Health and integration status endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::calendar::{IntegrationStatus, ProviderHealth};
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct Integrations {
    pub model: ProviderHealth,
    pub calendar: ProviderHealth,
    pub database: ProviderHealth,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// `ready` when every integration is ok, otherwise `needs_setup`.
    pub overall: &'static str,
    pub integrations: Integrations,
    pub calendar_provider: &'static str,
    pub model: String,
    pub timezone: String,
    pub tracked_calendars: usize,
    pub writable_calendar: Option<String>,
    pub knowledge_entries: i64,
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let model = if state.model.is_configured() {
        ProviderHealth::ok()
    } else {
        ProviderHealth::needs_setup("ANTHROPIC_API_KEY is not set")
    };
    let database = match state.db.ping() {
        Ok(()) => ProviderHealth::ok(),
        Err(e) => ProviderHealth::error(e.to_string()),
    };
    let calendar = state.calendar.health_check().await;

    let tracked = state.calendar.tracked_calendars().unwrap_or_default();
    let writable_calendar = tracked
        .iter()
        .find(|c| c.permission.is_writable())
        .map(|c| c.name.clone());
    let knowledge_entries = state.db.knowledge.count_knowledge().unwrap_or(0);

    let ready = [&model, &calendar, &database]
        .iter()
        .all(|h| h.status == IntegrationStatus::Ok);

    Json(StatusResponse {
        overall: if ready { "ready" } else { "needs_setup" },
        integrations: Integrations { model, calendar, database },
        calendar_provider: state.calendar.provider_name(),
        model: state.model.model_name(),
        timezone: state.config.timezone.name().to_string(),
        tracked_calendars: tracked.len(),
        writable_calendar,
        knowledge_entries,
    })
}

//! REST endpoints for provider calendars and the tracked-calendar list

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::Validate;

use super::ApiError;
use crate::calendar::ProviderCalendar;
use crate::shared_state::AppState;
use crate::store::{CalendarPermission, CalendarUpdate, NewCalendar, TrackedCalendar};

#[derive(Debug, Deserialize, Validate)]
pub struct AddCalendarRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 512))]
    pub external_id: String,
    #[serde(default = "default_permission")]
    pub permission: CalendarPermission,
    #[validate(length(max = 32))]
    pub color: Option<String>,
    #[validate(range(min = 0, max = 100))]
    pub priority: Option<i64>,
}

fn default_permission() -> CalendarPermission {
    CalendarPermission::Read
}

#[derive(Debug, Serialize)]
pub struct ProviderCalendarView {
    #[serde(flatten)]
    pub calendar: ProviderCalendar,
    pub tracked: bool,
}

#[derive(Debug, Serialize)]
pub struct ProviderCalendarsResponse {
    pub calendars: Vec<ProviderCalendarView>,
}

#[derive(Debug, Serialize)]
pub struct TrackedCalendarsResponse {
    pub calendars: Vec<TrackedCalendar>,
}

/// GET /calendar/provider-calendars
pub async fn list_provider_calendars(
    State(state): State<AppState>,
) -> Result<Json<ProviderCalendarsResponse>, ApiError> {
    let available = state.calendar.list_provider_calendars().await.map_err(|e| {
        warn!("Listing provider calendars failed: {}", e);
        ApiError::from(e)
    })?;
    let tracked = state.calendar.tracked_calendars()?;
    let calendars = available
        .into_iter()
        .map(|calendar| {
            let is_tracked = tracked.iter().any(|t| t.external_id == calendar.id);
            ProviderCalendarView { calendar, tracked: is_tracked }
        })
        .collect();
    Ok(Json(ProviderCalendarsResponse { calendars }))
}

/// GET /calendar/tracked
pub async fn list_tracked_calendars(
    State(state): State<AppState>,
) -> Result<Json<TrackedCalendarsResponse>, ApiError> {
    let calendars = state.db.calendars.list_active()?;
    Ok(Json(TrackedCalendarsResponse { calendars }))
}

/// POST /calendar/tracked
pub async fn add_tracked_calendar(
    State(state): State<AppState>,
    Json(payload): Json<AddCalendarRequest>,
) -> Result<(StatusCode, Json<TrackedCalendar>), ApiError> {
    payload.validate()?;
    if state.db.calendars.find_by_external_id(&payload.external_id)?.is_some() {
        return Err(ApiError::bad_request(format!("Calendar '{}' is already tracked", payload.external_id)));
    }
    let mut calendar = NewCalendar::new(payload.name, payload.external_id, payload.permission);
    calendar.color = payload.color;
    if let Some(priority) = payload.priority {
        calendar.priority = priority;
    }
    let tracked = state.db.calendars.add(calendar)?;
    Ok((StatusCode::CREATED, Json(tracked)))
}

/// PUT /calendar/tracked/:id
pub async fn update_tracked_calendar(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<CalendarUpdate>,
) -> Result<Json<TrackedCalendar>, ApiError> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("Calendar name cannot be blank"));
    }
    let calendar = state
        .db
        .calendars
        .update(id, &update)?
        .ok_or_else(|| ApiError::not_found(format!("Calendar {} not found", id)))?;
    info!("Updated tracked calendar #{}", id);
    Ok(Json(calendar))
}

/// DELETE /calendar/tracked/:id
pub async fn remove_tracked_calendar(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.calendars.deactivate(id)? {
        return Err(ApiError::not_found(format!("Calendar {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

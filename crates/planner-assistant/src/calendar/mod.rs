//! Calendar gateway: permission-checked access to an external calendar backend.
pub mod availability;
pub mod google;
pub mod memory;
pub mod oauth;

pub use availability::{find_slots, Slot, SlotSearch};
pub use google::GoogleCalendarProvider;
pub use memory::InMemoryCalendarProvider;
pub use oauth::TokenManager;

use crate::error::{ProviderError, ToolError};
use crate::store::{PlannerDatabase, TrackedCalendar};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A normalized event as returned by any provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub calendar_id: String,
    #[serde(default)]
    pub all_day: bool,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// Fields for a new event.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// Partial event update; `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// A calendar visible in the provider account, tracked or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCalendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    pub access_role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Ok,
    NeedsSetup,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: IntegrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProviderHealth {
    pub fn ok() -> Self {
        Self { status: IntegrationStatus::Ok, detail: None }
    }

    pub fn needs_setup(detail: impl Into<String>) -> Self {
        Self { status: IntegrationStatus::NeedsSetup, detail: Some(detail.into()) }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self { status: IntegrationStatus::Error, detail: Some(detail.into()) }
    }
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn health_check(&self) -> ProviderHealth;

    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>, ProviderError>;

    async fn list_events(&self, calendar_id: &str, range: TimeRange) -> Result<Vec<CalendarEvent>, ProviderError>;

    async fn insert_event(&self, calendar_id: &str, draft: &EventDraft) -> Result<CalendarEvent, ProviderError>;

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEvent, ProviderError>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError>;
}

/// Local midnight of `date` in `tz`, as UTC. Falls back to the UTC midnight
/// if the local midnight does not exist.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    local_hour(tz, date, 0)
}

/// `date` at `hour:00` local time; hour 24 is the next day's midnight.
pub fn local_hour(tz: Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let (date, hour) = if hour >= 24 {
        (date.succ_opt().unwrap_or(date), 0)
    } else {
        (date, hour)
    };
    let naive = date.and_hms_opt(hour, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        // Inside a DST gap: step forward an hour.
        None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// The whole local day of `date`.
pub fn day_range(tz: Tz, date: NaiveDate) -> TimeRange {
    let next = date.succ_opt().unwrap_or(date);
    TimeRange::new(local_midnight(tz, date), local_midnight(tz, next))
}

/// Renders events as `- 02:00 PM: Title (1h30m)` lines.
pub fn format_schedule_summary(events: &[CalendarEvent], tz: Tz) -> String {
    if events.is_empty() {
        return "No events scheduled.".to_string();
    }
    events
        .iter()
        .map(|event| {
            if event.all_day {
                return format!("- All day: {}", event.title);
            }
            let time = event.start.with_timezone(&tz).format("%I:%M %p");
            let minutes = (event.end - event.start).num_minutes();
            let duration = if minutes >= 60 {
                let (hours, rest) = (minutes / 60, minutes % 60);
                if rest > 0 {
                    format!(" ({}h{}m)", hours, rest)
                } else {
                    format!(" ({}h)", hours)
                }
            } else {
                format!(" ({}m)", minutes)
            };
            format!("- {}: {}{}", time, event.title, duration)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads and writes calendar events through a provider, enforcing the
/// tracked-calendar permissions stored in the database.
pub struct CalendarGateway {
    provider: Arc<dyn CalendarProvider>,
    db: Arc<PlannerDatabase>,
    timezone: Tz,
}

impl CalendarGateway {
    pub fn new(provider: Arc<dyn CalendarProvider>, db: Arc<PlannerDatabase>, timezone: Tz) -> Self {
        Self { provider, db, timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn health_check(&self) -> ProviderHealth {
        self.provider.health_check().await
    }

    pub fn tracked_calendars(&self) -> Result<Vec<TrackedCalendar>, ToolError> {
        self.db.calendars.list_active().map_err(ToolError::Storage)
    }

    /// The default write target: the first active read_write calendar.
    pub fn writable_calendar(&self) -> Result<Option<TrackedCalendar>, ToolError> {
        Ok(self.tracked_calendars()?.into_iter().find(|c| c.permission.is_writable()))
    }

    pub async fn list_provider_calendars(&self) -> Result<Vec<ProviderCalendar>, ToolError> {
        Ok(self.provider.list_calendars().await?)
    }

    /// Events across the given calendars (all tracked calendars when `None`),
    /// sorted by start time.
    pub async fn list_events(
        &self,
        calendar_ids: Option<&[String]>,
        range: TimeRange,
    ) -> Result<Vec<CalendarEvent>, ToolError> {
        let targets: Vec<String> = match calendar_ids {
            Some(ids) => {
                for id in ids {
                    self.require_tracked(id)?;
                }
                ids.to_vec()
            }
            None => self.tracked_calendars()?.into_iter().map(|c| c.external_id).collect(),
        };

        let mut events = Vec::new();
        for calendar_id in &targets {
            let mut batch = self.provider.list_events(calendar_id, range).await?;
            events.append(&mut batch);
        }
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
        debug!("Fetched {} events from {} calendars", events.len(), targets.len());
        Ok(events)
    }

    pub async fn day_events(&self, date: NaiveDate) -> Result<Vec<CalendarEvent>, ToolError> {
        self.list_events(None, day_range(self.timezone, date)).await
    }

    /// Monday-to-Sunday schedule of the week containing `date`.
    pub async fn week_overview(&self, date: NaiveDate) -> Result<Vec<(NaiveDate, Vec<CalendarEvent>)>, ToolError> {
        use chrono::Datelike;
        let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        let sunday = monday + Duration::days(6);
        let range = TimeRange::new(
            local_midnight(self.timezone, monday),
            local_midnight(self.timezone, sunday + Duration::days(1)),
        );
        let events = self.list_events(None, range).await?;

        let mut days = Vec::with_capacity(7);
        for offset in 0..7 {
            let day = monday + Duration::days(offset);
            let bounds = day_range(self.timezone, day);
            let day_events = events
                .iter()
                .filter(|e| bounds.overlaps(e.start, e.end))
                .cloned()
                .collect();
            days.push((day, day_events));
        }
        Ok(days)
    }

    pub async fn create_event(&self, calendar_id: Option<&str>, draft: EventDraft) -> Result<CalendarEvent, ToolError> {
        if draft.end <= draft.start {
            return Err(ToolError::InvalidArguments("event must end after it starts".into()));
        }
        let target = self.resolve_writable(calendar_id)?;
        let event = self.provider.insert_event(&target.external_id, &draft).await?;
        info!("Created event '{}' ({}) on calendar '{}'", event.title, event.id, target.name);
        Ok(event)
    }

    pub async fn update_event(
        &self,
        calendar_id: Option<&str>,
        event_id: &str,
        patch: EventPatch,
    ) -> Result<CalendarEvent, ToolError> {
        if let (Some(start), Some(end)) = (patch.start, patch.end) {
            if end <= start {
                return Err(ToolError::InvalidArguments("event must end after it starts".into()));
            }
        }
        let target = self.resolve_writable(calendar_id)?;
        let event = self.provider.patch_event(&target.external_id, event_id, &patch).await?;
        info!("Updated event {} on calendar '{}'", event_id, target.name);
        Ok(event)
    }

    pub async fn delete_event(&self, calendar_id: Option<&str>, event_id: &str) -> Result<(), ToolError> {
        let target = self.resolve_writable(calendar_id)?;
        self.provider.delete_event(&target.external_id, event_id).await?;
        info!("Deleted event {} from calendar '{}'", event_id, target.name);
        Ok(())
    }

    /// Free slots across all tracked calendars. All-day events do not block time.
    pub async fn find_available_slots(&self, search: &SlotSearch) -> Result<Vec<Slot>, ToolError> {
        let range = search.horizon(self.timezone);
        let busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = self
            .list_events(None, range)
            .await?
            .into_iter()
            .filter(|e| !e.all_day)
            .map(|e| (e.start, e.end))
            .collect();
        Ok(find_slots(&busy, search, self.timezone))
    }

    fn require_tracked(&self, calendar_id: &str) -> Result<TrackedCalendar, ToolError> {
        self.db
            .calendars
            .find_by_external_id(calendar_id)
            .map_err(ToolError::Storage)?
            .ok_or_else(|| ToolError::NotTracked(calendar_id.to_string()))
    }

    fn resolve_writable(&self, calendar_id: Option<&str>) -> Result<TrackedCalendar, ToolError> {
        match calendar_id {
            Some(id) => {
                let calendar = self.require_tracked(id)?;
                if !calendar.permission.is_writable() {
                    warn!("Rejected write to read-only calendar '{}'", calendar.name);
                    return Err(ToolError::PermissionDenied { calendar: calendar.name });
                }
                Ok(calendar)
            }
            None => self.writable_calendar()?.ok_or(ToolError::NoWritableCalendar),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CalendarPermission, NewCalendar};
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn setup() -> (CalendarGateway, Arc<InMemoryCalendarProvider>, Arc<PlannerDatabase>) {
        let db = Arc::new(PlannerDatabase::new_in_memory().unwrap());
        let provider = Arc::new(InMemoryCalendarProvider::new());
        provider.add_calendar("work@example.com", "Work");
        provider.add_calendar("family@example.com", "Family");
        db.calendars
            .add(NewCalendar::new("Work", "work@example.com", CalendarPermission::ReadWrite))
            .unwrap();
        db.calendars
            .add(NewCalendar::new("Family", "family@example.com", CalendarPermission::Read))
            .unwrap();
        let gateway = CalendarGateway::new(provider.clone(), db.clone(), New_York);
        (gateway, provider, db)
    }

    fn draft(title: &str, hour: u32) -> EventDraft {
        let start = New_York.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).unwrap().with_timezone(&Utc);
        EventDraft {
            title: title.into(),
            start,
            end: start + Duration::minutes(30),
            description: None,
            location: None,
        }
    }

    #[tokio::test]
    async fn test_write_to_read_only_calendar_is_denied() {
        let (gateway, provider, _db) = setup();

        let result = gateway.create_event(Some("family@example.com"), draft("Dinner", 18)).await;
        let err = result.unwrap_err();
        assert_eq!(err.error_type(), "permission_denied");
        assert!(provider.events("family@example.com").is_empty());

        let delete = gateway.delete_event(Some("family@example.com"), "anything").await;
        assert_eq!(delete.unwrap_err().error_type(), "permission_denied");
    }

    #[tokio::test]
    async fn test_write_to_untracked_calendar_is_rejected() {
        let (gateway, provider, _db) = setup();
        provider.add_calendar("other@example.com", "Other");

        let err = gateway
            .create_event(Some("other@example.com"), draft("Sync", 10))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "not_tracked");
        assert!(provider.events("other@example.com").is_empty());
    }

    #[tokio::test]
    async fn test_default_write_target_is_first_writable() {
        let (gateway, provider, _db) = setup();

        let event = gateway.create_event(None, draft("Standup", 9)).await.unwrap();
        assert_eq!(event.calendar_id, "work@example.com");
        assert_eq!(provider.events("work@example.com").len(), 1);
    }

    #[tokio::test]
    async fn test_no_writable_calendar() {
        let db = Arc::new(PlannerDatabase::new_in_memory().unwrap());
        let provider = Arc::new(InMemoryCalendarProvider::new());
        db.calendars
            .add(NewCalendar::new("Family", "family@example.com", CalendarPermission::Read))
            .unwrap();
        let gateway = CalendarGateway::new(provider, db, New_York);

        let err = gateway.create_event(None, draft("Standup", 9)).await.unwrap_err();
        assert_eq!(err.error_type(), "no_writable_calendar");
    }

    #[tokio::test]
    async fn test_list_events_merges_tracked_calendars_in_order() {
        let (gateway, provider, _db) = setup();
        provider.seed_event("family@example.com", draft("School pickup", 15));
        provider.seed_event("work@example.com", draft("Standup", 9));
        provider.seed_event("work@example.com", draft("Review", 11));

        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let events = gateway.day_events(date).await.unwrap();
        let titles: Vec<&str> = events.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Standup", "Review", "School pickup"]);

        let unknown = gateway
            .list_events(Some(&["nope@example.com".to_string()]), day_range(New_York, date))
            .await
            .unwrap_err();
        assert_eq!(unknown.error_type(), "not_tracked");
    }

    #[tokio::test]
    async fn test_week_overview_starts_on_monday() {
        let (gateway, provider, _db) = setup();
        provider.seed_event("work@example.com", draft("Standup", 9));

        // 2026-03-12 is a Thursday.
        let week = gateway
            .week_overview(NaiveDate::from_ymd_opt(2026, 3, 12).unwrap())
            .await
            .unwrap();
        assert_eq!(week.len(), 7);
        assert_eq!(week[0].0, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(week[1].1.len(), 1);
        assert!(week[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_event_is_not_found() {
        let (gateway, _provider, _db) = setup();
        let err = gateway
            .update_event(None, "missing", EventPatch { title: Some("x".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "not_found");
    }

    #[test]
    fn test_format_schedule_summary() {
        let tz = New_York;
        let start = tz.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap().with_timezone(&Utc);
        let events = vec![
            CalendarEvent {
                id: "1".into(),
                title: "Planning".into(),
                start,
                end: start + Duration::minutes(90),
                calendar_id: "c".into(),
                all_day: false,
                description: None,
                location: None,
            },
            CalendarEvent {
                id: "2".into(),
                title: "Coffee".into(),
                start: start + Duration::hours(2),
                end: start + Duration::hours(2) + Duration::minutes(45),
                calendar_id: "c".into(),
                all_day: false,
                description: None,
                location: None,
            },
            CalendarEvent {
                id: "3".into(),
                title: "Workshop".into(),
                start: start + Duration::hours(3),
                end: start + Duration::hours(5),
                calendar_id: "c".into(),
                all_day: false,
                description: None,
                location: None,
            },
        ];

        let summary = format_schedule_summary(&events, tz);
        assert_eq!(
            summary,
            "- 02:00 PM: Planning (1h30m)\n- 04:00 PM: Coffee (45m)\n- 05:00 PM: Workshop (2h)"
        );
        assert_eq!(format_schedule_summary(&[], tz), "No events scheduled.");
    }

    #[test]
    fn test_day_range_handles_dst_transition() {
        // US clocks spring forward on 2026-03-08.
        let range = day_range(New_York, NaiveDate::from_ymd_opt(2026, 3, 8).unwrap());
        assert_eq!((range.end - range.start).num_hours(), 23);
    }
}

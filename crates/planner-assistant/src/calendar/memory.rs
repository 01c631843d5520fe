use super::{CalendarEvent, CalendarProvider, EventDraft, EventPatch, ProviderCalendar, ProviderHealth, TimeRange};
use crate::error::ProviderError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Process-local calendar backend. Events live only as long as the process.
#[derive(Clone, Default)]
pub struct InMemoryCalendarProvider {
    calendars: Arc<DashMap<String, ProviderCalendar>>,
    events: Arc<DashMap<String, Vec<CalendarEvent>>>,
}

impl InMemoryCalendarProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_calendar(&self, id: &str, name: &str) {
        let primary = self.calendars.is_empty();
        self.calendars.insert(
            id.to_string(),
            ProviderCalendar {
                id: id.to_string(),
                name: name.to_string(),
                primary,
                access_role: Some("owner".to_string()),
            },
        );
        self.events.entry(id.to_string()).or_default();
    }

    /// Inserts an event directly, bypassing the gateway.
    pub fn seed_event(&self, calendar_id: &str, draft: EventDraft) -> CalendarEvent {
        let event = build_event(calendar_id, &draft);
        self.events.entry(calendar_id.to_string()).or_default().push(event.clone());
        event
    }

    /// Snapshot of a calendar's events in start order.
    pub fn events(&self, calendar_id: &str) -> Vec<CalendarEvent> {
        let mut events = match self.events.get(calendar_id) {
            Some(events) => events.clone(),
            None => Vec::new(),
        };
        events.sort_by_key(|e| e.start);
        events
    }
}

fn build_event(calendar_id: &str, draft: &EventDraft) -> CalendarEvent {
    CalendarEvent {
        id: Uuid::new_v4().simple().to_string(),
        title: draft.title.clone(),
        start: draft.start,
        end: draft.end,
        calendar_id: calendar_id.to_string(),
        all_day: false,
        description: draft.description.clone(),
        location: draft.location.clone(),
    }
}

#[async_trait]
impl CalendarProvider for InMemoryCalendarProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> ProviderHealth {
        ProviderHealth::ok()
    }

    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>, ProviderError> {
        let mut calendars: Vec<ProviderCalendar> = self.calendars.iter().map(|c| c.value().clone()).collect();
        calendars.sort_by(|a, b| b.primary.cmp(&a.primary).then_with(|| a.name.cmp(&b.name)));
        Ok(calendars)
    }

    async fn list_events(&self, calendar_id: &str, range: TimeRange) -> Result<Vec<CalendarEvent>, ProviderError> {
        Ok(self
            .events(calendar_id)
            .into_iter()
            .filter(|e| range.overlaps(e.start, e.end))
            .collect())
    }

    async fn insert_event(&self, calendar_id: &str, draft: &EventDraft) -> Result<CalendarEvent, ProviderError> {
        Ok(self.seed_event(calendar_id, draft.clone()))
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEvent, ProviderError> {
        let mut events = self
            .events
            .get_mut(calendar_id)
            .ok_or_else(|| ProviderError::NotFound(format!("Calendar {}", calendar_id)))?;
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| ProviderError::NotFound(format!("Event {}", event_id)))?;

        if let Some(title) = &patch.title {
            event.title = title.clone();
        }
        if let Some(start) = patch.start {
            event.start = start;
        }
        if let Some(end) = patch.end {
            event.end = end;
        }
        if let Some(description) = &patch.description {
            event.description = Some(description.clone());
        }
        if let Some(location) = &patch.location {
            event.location = Some(location.clone());
        }
        Ok(event.clone())
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        let mut events = self
            .events
            .get_mut(calendar_id)
            .ok_or_else(|| ProviderError::NotFound(format!("Calendar {}", calendar_id)))?;
        let before = events.len();
        events.retain(|e| e.id != event_id);
        if events.len() == before {
            return Err(ProviderError::NotFound(format!("Event {}", event_id)));
        }
        Ok(())
    }
}

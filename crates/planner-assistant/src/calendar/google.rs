//! Google Calendar v3 backend.
use super::oauth::TokenManager;
use super::{
    local_midnight, CalendarEvent, CalendarProvider, EventDraft, EventPatch, ProviderCalendar, ProviderHealth,
    TimeRange,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub struct GoogleCalendarProvider {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    timezone: Tz,
}

impl GoogleCalendarProvider {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: TokenManager, timezone: Tz) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            timezone,
        }
    }

    /// Builds `{base}/{segments...}`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid calendar base URL {}: {}", self.base_url, e))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Calendar base URL {} cannot take a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ProviderError> {
        let token = self.tokens.access_token().await?;
        let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(token).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        debug!("Calendar API {} {}", method, url.path());
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ProviderError::NotFound(url.path().to_string()));
        }
        warn!("Calendar API {} {} failed with {}", method, url.path(), status);
        Err(ProviderError::Status { status: status.as_u16(), body })
    }

    fn event_body(&self, title: Option<&str>, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>,
                  description: Option<&str>, location: Option<&str>) -> Value {
        let mut body = Map::new();
        if let Some(title) = title {
            body.insert("summary".into(), json!(title));
        }
        if let Some(start) = start {
            body.insert("start".into(), self.event_time(start));
        }
        if let Some(end) = end {
            body.insert("end".into(), self.event_time(end));
        }
        if let Some(description) = description {
            body.insert("description".into(), json!(description));
        }
        if let Some(location) = location {
            body.insert("location".into(), json!(location));
        }
        Value::Object(body)
    }

    fn event_time(&self, at: DateTime<Utc>) -> Value {
        json!({
            "dateTime": at.with_timezone(&self.timezone).to_rfc3339_opts(SecondsFormat::Secs, false),
            "timeZone": self.timezone.name(),
        })
    }

    fn parse_time(&self, value: &Value) -> Option<(DateTime<Utc>, bool)> {
        if let Some(date_time) = value.get("dateTime").and_then(Value::as_str) {
            let parsed = DateTime::parse_from_rfc3339(date_time).ok()?;
            return Some((parsed.with_timezone(&Utc), false));
        }
        let date = value.get("date").and_then(Value::as_str)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some((local_midnight(self.timezone, date), true))
    }

    /// Normalizes one API event; cancelled or unparsable entries are skipped.
    fn parse_event(&self, calendar_id: &str, item: &Value) -> Option<CalendarEvent> {
        if item.get("status").and_then(Value::as_str) == Some("cancelled") {
            return None;
        }
        let (start, all_day) = self.parse_time(item.get("start")?)?;
        let (end, _) = self.parse_time(item.get("end")?)?;
        Some(CalendarEvent {
            id: item.get("id")?.as_str()?.to_string(),
            title: item
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("(No title)")
                .to_string(),
            start,
            end,
            calendar_id: calendar_id.to_string(),
            all_day,
            description: item.get("description").and_then(Value::as_str).map(str::to_string),
            location: item.get("location").and_then(Value::as_str).map(str::to_string),
        })
    }

    fn parse_written_event(&self, calendar_id: &str, body: &Value) -> Result<CalendarEvent, ProviderError> {
        self.parse_event(calendar_id, body)
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("Calendar API returned an unreadable event")))
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn health_check(&self) -> ProviderHealth {
        if !self.tokens.token_file_present() {
            return ProviderHealth::needs_setup(format!(
                "No token file at {}; complete the Google OAuth consent first",
                self.tokens.path().display()
            ));
        }
        match self.tokens.access_token().await {
            Ok(_) => ProviderHealth::ok(),
            Err(ProviderError::NotConfigured(detail)) => ProviderHealth::needs_setup(detail),
            Err(e) => ProviderHealth::error(e.to_string()),
        }
    }

    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>, ProviderError> {
        let url = self.url(&["users", "me", "calendarList"])?;
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = Vec::new();
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: Value = self.send(Method::GET, url.clone(), &query, None).await?.json().await?;
            if let Some(items) = page.get("items").and_then(Value::as_array) {
                for item in items {
                    let Some(id) = item.get("id").and_then(Value::as_str) else { continue };
                    calendars.push(ProviderCalendar {
                        id: id.to_string(),
                        name: item
                            .get("summaryOverride")
                            .or_else(|| item.get("summary"))
                            .and_then(Value::as_str)
                            .unwrap_or(id)
                            .to_string(),
                        primary: item.get("primary").and_then(Value::as_bool).unwrap_or(false),
                        access_role: item.get("accessRole").and_then(Value::as_str).map(str::to_string),
                    });
                }
            }
            page_token = page.get("nextPageToken").and_then(Value::as_str).map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(calendars)
    }

    async fn list_events(&self, calendar_id: &str, range: TimeRange) -> Result<Vec<CalendarEvent>, ProviderError> {
        let url = self.url(&["calendars", calendar_id, "events"])?;
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("timeMin", range.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("timeMax", range.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: Value = self.send(Method::GET, url.clone(), &query, None).await?.json().await?;
            if let Some(items) = page.get("items").and_then(Value::as_array) {
                events.extend(items.iter().filter_map(|item| self.parse_event(calendar_id, item)));
            }
            page_token = page.get("nextPageToken").and_then(Value::as_str).map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(events)
    }

    async fn insert_event(&self, calendar_id: &str, draft: &EventDraft) -> Result<CalendarEvent, ProviderError> {
        let url = self.url(&["calendars", calendar_id, "events"])?;
        let body = self.event_body(
            Some(&draft.title),
            Some(draft.start),
            Some(draft.end),
            draft.description.as_deref(),
            draft.location.as_deref(),
        );
        let created: Value = self.send(Method::POST, url, &[], Some(&body)).await?.json().await?;
        self.parse_written_event(calendar_id, &created)
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &EventPatch,
    ) -> Result<CalendarEvent, ProviderError> {
        let url = self.url(&["calendars", calendar_id, "events", event_id])?;
        let body = self.event_body(
            patch.title.as_deref(),
            patch.start,
            patch.end,
            patch.description.as_deref(),
            patch.location.as_deref(),
        );
        let updated: Value = self.send(Method::PATCH, url, &[], Some(&body)).await?.json().await?;
        self.parse_written_event(calendar_id, &updated)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&["calendars", calendar_id, "events", event_id])?;
        self.send(Method::DELETE, url, &[], None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use chrono_tz::America::New_York;
    use mockito::Matcher;

    async fn provider_for(server: &mockito::ServerGuard, dir: &std::path::Path) -> GoogleCalendarProvider {
        let token_path = dir.join("token.json");
        let token = json!({
            "token": "access-123",
            "refresh_token": "r",
            "client_id": "c",
            "client_secret": "s",
            "expiry": (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        std::fs::write(&token_path, token.to_string()).unwrap();
        let http = reqwest::Client::new();
        GoogleCalendarProvider::new(
            http.clone(),
            format!("{}/calendar/v3", server.url()),
            TokenManager::new(token_path, http),
            New_York,
        )
    }

    #[tokio::test]
    async fn test_list_calendars_follows_pages() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server, dir.path()).await;

        let first = server
            .mock("GET", "/calendar/v3/users/me/calendarList")
            .match_query(Matcher::Missing)
            .match_header("authorization", "Bearer access-123")
            .with_body(r#"{"items":[{"id":"me@example.com","summary":"Me","primary":true,"accessRole":"owner"}],"nextPageToken":"p2"}"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/calendar/v3/users/me/calendarList")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_body(r#"{"items":[{"id":"team@group.calendar.google.com","summary":"Team","accessRole":"reader"}]}"#)
            .create_async()
            .await;

        let calendars = provider.list_calendars().await.unwrap();
        assert_eq!(calendars.len(), 2);
        assert!(calendars[0].primary);
        assert_eq!(calendars[1].name, "Team");
        assert_eq!(calendars[1].access_role.as_deref(), Some("reader"));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_events_normalizes_timed_and_all_day() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server, dir.path()).await;

        server
            .mock("GET", "/calendar/v3/calendars/me@example.com/events")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("singleEvents".into(), "true".into()),
                Matcher::UrlEncoded("orderBy".into(), "startTime".into()),
            ]))
            .with_body(
                r#"{"items":[
                    {"id":"a","summary":"Standup","start":{"dateTime":"2026-03-10T09:00:00-04:00"},"end":{"dateTime":"2026-03-10T09:15:00-04:00"}},
                    {"id":"b","start":{"date":"2026-03-11"},"end":{"date":"2026-03-12"}},
                    {"id":"c","status":"cancelled","start":{"dateTime":"2026-03-10T10:00:00Z"},"end":{"dateTime":"2026-03-10T11:00:00Z"}}
                ]}"#,
            )
            .create_async()
            .await;

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 13, 0, 0, 0).unwrap(),
        );
        let events = provider.list_events("me@example.com", range).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].title, "Standup");
        assert_eq!(events[0].start, Utc.with_ymd_and_hms(2026, 3, 10, 13, 0, 0).unwrap());
        assert!(!events[0].all_day);
        assert_eq!(events[1].title, "(No title)");
        assert!(events[1].all_day);
        assert_eq!(events[1].start, New_York.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap().with_timezone(&Utc));
    }

    #[tokio::test]
    async fn test_calendar_ids_are_path_encoded() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server, dir.path()).await;

        let mock = server
            .mock("DELETE", "/calendar/v3/calendars/a%2Fb%23c/events/ev1")
            .with_status(204)
            .create_async()
            .await;

        provider.delete_event("a/b#c", "ev1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_insert_event_sends_local_times() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server, dir.path()).await;

        let mock = server
            .mock("POST", "/calendar/v3/calendars/me@example.com/events")
            .match_body(Matcher::PartialJson(json!({
                "summary": "Meeting",
                "start": {"dateTime": "2026-03-11T14:00:00-04:00", "timeZone": "America/New_York"},
            })))
            .with_body(r#"{"id":"new1","summary":"Meeting","start":{"dateTime":"2026-03-11T14:00:00-04:00"},"end":{"dateTime":"2026-03-11T15:00:00-04:00"}}"#)
            .create_async()
            .await;

        let start = New_York.with_ymd_and_hms(2026, 3, 11, 14, 0, 0).unwrap().with_timezone(&Utc);
        let event = provider
            .insert_event(
                "me@example.com",
                &EventDraft { title: "Meeting".into(), start, end: start + Duration::hours(1), description: None, location: None },
            )
            .await
            .unwrap();
        assert_eq!(event.id, "new1");
        assert_eq!(event.calendar_id, "me@example.com");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_statuses_map_to_provider_errors() {
        let mut server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let provider = provider_for(&server, dir.path()).await;

        server
            .mock("PATCH", "/calendar/v3/calendars/me@example.com/events/gone")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/calendar/v3/users/me/calendarList")
            .with_status(503)
            .with_body("backend unavailable")
            .create_async()
            .await;

        let patch = EventPatch { title: Some("x".into()), ..Default::default() };
        assert!(matches!(
            provider.patch_event("me@example.com", "gone", &patch).await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.list_calendars().await,
            Err(ProviderError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_health_without_token_file_needs_setup() {
        let http = reqwest::Client::new();
        let dir = tempfile::tempdir().unwrap();
        let provider = GoogleCalendarProvider::new(
            http.clone(),
            "http://127.0.0.1:9/calendar/v3",
            TokenManager::new(dir.path().join("token.json"), http),
            New_York,
        );
        let health = provider.health_check().await;
        assert_eq!(health.status, super::super::IntegrationStatus::NeedsSetup);
    }
}

//! Router construction and server startup

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{api, config::Config, metrics, shared_state::AppState};

/// Run the HTTP/WebSocket server until it fails.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    info!("Starting planner assistant");
    cfg.print_config();
    metrics::init_metrics();

    let addr = cfg.api_addr()?;
    let state = AppState::from_config(cfg)?;

    let health = state.calendar.health_check().await;
    match &health.detail {
        Some(detail) => warn!("Calendar provider {} is {:?}: {}", state.calendar.provider_name(), health.status, detail),
        None => info!("Calendar provider {} is ready", state.calendar.provider_name()),
    }
    if !state.model.is_configured() {
        warn!("ANTHROPIC_API_KEY is not set; chat turns will fail until it is configured");
    }

    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/chat/conversations", get(api::get_conversations).post(api::create_conversation))
        .route("/chat/conversations/:id", get(api::get_conversation).delete(api::delete_conversation))
        .route("/chat/conversations/:id/messages", get(api::get_messages))
        .route("/chat/conversations/:id/title", axum::routing::put(api::update_conversation_title))
        .route("/chat/message", post(api::send_message))
        .route("/chat/ws/:id", get(api::chat_ws))
        .route("/calendar/provider-calendars", get(api::list_provider_calendars))
        .route("/calendar/tracked", get(api::list_tracked_calendars).post(api::add_tracked_calendar))
        .route(
            "/calendar/tracked/:id",
            axum::routing::put(api::update_tracked_calendar).delete(api::remove_tracked_calendar),
        )
        .route("/status", get(api::status))
        .route("/health", get(api::health))
        .route("/metrics", get(metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::InMemoryCalendarProvider;
    use crate::llm::{LanguageModel, ModelRequest, ModelStream};
    use crate::store::PlannerDatabase;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct OfflineModel;

    #[async_trait]
    impl LanguageModel for OfflineModel {
        fn is_configured(&self) -> bool {
            false
        }

        fn model_name(&self) -> String {
            "offline".into()
        }

        async fn stream_turn(&self, _request: ModelRequest) -> anyhow::Result<ModelStream> {
            Err(anyhow::anyhow!("no model in tests"))
        }

        async fn generate_title(&self, _user: &str, _assistant: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("no model in tests"))
        }
    }

    fn test_router() -> Router {
        let config = Config::from_lookup(|key| match key {
            "CALENDAR_PROVIDER" => Some("memory".to_string()),
            _ => None,
        })
        .unwrap();
        let db = Arc::new(PlannerDatabase::new_in_memory().unwrap());
        let provider = InMemoryCalendarProvider::new();
        provider.add_calendar("primary", "Primary");
        provider.add_calendar("team@example.com", "Team");
        build_router(AppState::new(config, db, Arc::new(provider), Arc::new(OfflineModel)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_conversation_lifecycle() {
        let app = test_router();

        let (status, created) = send(&app, "POST", "/chat/conversations", Some(json!({"title": "Weekly plan"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["title"], "Weekly plan");

        let (status, listed) = send(&app, "GET", "/chat/conversations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["conversations"].as_array().unwrap().len(), 1);

        let (status, renamed) = send(
            &app,
            "PUT",
            &format!("/chat/conversations/{}/title", id),
            Some(json!({"title": "Q3 planning"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(renamed["title"], "Q3 planning");

        let (status, detail) = send(&app, "GET", &format!("/chat/conversations/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["id"], id.as_str());
        assert!(detail["messages"].as_array().unwrap().is_empty());

        let (status, _) = send(&app, "DELETE", &format!("/chat/conversations/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", &format!("/chat/conversations/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_blank_title_is_rejected() {
        let app = test_router();
        let (status, body) = send(&app, "POST", "/chat/conversations", Some(json!({"title": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_tracking_calendars() {
        let app = test_router();

        let (status, provider) = send(&app, "GET", "/calendar/provider-calendars", None).await;
        assert_eq!(status, StatusCode::OK);
        let calendars = provider["calendars"].as_array().unwrap();
        assert_eq!(calendars.len(), 2);
        assert!(calendars.iter().all(|c| c["tracked"] == false));

        let request = json!({"name": "Team", "external_id": "team@example.com", "permission": "read_write"});
        let (status, tracked) = send(&app, "POST", "/calendar/tracked", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = tracked["id"].as_i64().unwrap();

        let (status, _) = send(&app, "POST", "/calendar/tracked", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, provider) = send(&app, "GET", "/calendar/provider-calendars", None).await;
        let team = provider["calendars"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == "team@example.com")
            .cloned()
            .unwrap();
        assert_eq!(team["tracked"], true);

        let (status, _) = send(&app, "DELETE", &format!("/calendar/tracked/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, listed) = send(&app, "GET", "/calendar/tracked", None).await;
        assert!(listed["calendars"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_missing_model_key() {
        let app = test_router();
        let (status, body) = send(&app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overall"], "needs_setup");
        assert_eq!(body["integrations"]["model"]["status"], "needs_setup");
        assert_eq!(body["integrations"]["calendar"]["status"], "ok");
        assert_eq!(body["integrations"]["database"]["status"], "ok");
        assert_eq!(body["calendar_provider"], "memory");
    }
}

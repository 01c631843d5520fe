//! Shared application state handed to every handler.
//!
//! Everything here is built once at startup and shared through `Arc`s; the
//! only mutable runtime state is the session table.

use std::sync::Arc;
use tracing::info;

use crate::{
    calendar::{CalendarGateway, CalendarProvider, GoogleCalendarProvider, InMemoryCalendarProvider, TokenManager},
    config::{CalendarProviderKind, Config},
    context::ContextBuilder,
    llm::{AnthropicClient, LanguageModel},
    orchestrator::{OrchestratorSettings, TurnOrchestrator},
    session::SessionRegistry,
    store::PlannerDatabase,
    tools::{SchedulingSettings, ToolExecutor},
};

/// Unified application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<PlannerDatabase>,
    pub calendar: Arc<CalendarGateway>,
    pub model: Arc<dyn LanguageModel>,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// Wires the gateway, tool executor and orchestrator around the given backends.
    pub fn new(
        config: Config,
        db: Arc<PlannerDatabase>,
        provider: Arc<dyn CalendarProvider>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        info!("Initializing application state (calendar provider: {})", provider.name());
        let config = Arc::new(config);
        let calendar = Arc::new(CalendarGateway::new(provider, db.clone(), config.timezone));
        let tools = Arc::new(ToolExecutor::new(
            db.clone(),
            calendar.clone(),
            SchedulingSettings::from_config(&config),
        ));
        let context = ContextBuilder::new(db.clone(), calendar.clone());
        let settings = OrchestratorSettings {
            max_tool_rounds: config.max_tool_rounds,
            history_limit: config.history_limit,
        };
        let orchestrator = Arc::new(TurnOrchestrator::new(db.clone(), model.clone(), tools, context, settings));

        Self {
            config,
            db,
            calendar,
            model,
            orchestrator,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// Production wiring: database at `DB_PATH`, the configured calendar
    /// backend and the Anthropic client.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let db = Arc::new(PlannerDatabase::new(&config.db_path)?);
        let http = reqwest::Client::builder()
            .user_agent(concat!("planner-assistant/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let provider = build_calendar_provider(&config, http.clone());
        let model: Arc<dyn LanguageModel> = Arc::new(AnthropicClient::from_config(&config, http));
        Ok(Self::new(config, db, provider, model))
    }
}

pub fn build_calendar_provider(config: &Config, http: reqwest::Client) -> Arc<dyn CalendarProvider> {
    match config.calendar_provider {
        CalendarProviderKind::Google => {
            let tokens = TokenManager::new(config.google_token_path.clone(), http.clone());
            Arc::new(GoogleCalendarProvider::new(
                http,
                config.google_calendar_base_url.clone(),
                tokens,
                config.timezone,
            ))
        }
        CalendarProviderKind::Memory => {
            let provider = InMemoryCalendarProvider::new();
            provider.add_calendar("primary", "Primary");
            Arc::new(provider)
        }
    }
}

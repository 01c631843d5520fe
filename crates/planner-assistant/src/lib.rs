// planner-assistant/crates/planner-assistant/src/lib.rs

pub mod api;
pub mod calendar;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod shared_state;
pub mod store;
pub mod telemetry;
pub mod tools;

// Public API exports
pub use calendar::{CalendarGateway, CalendarProvider, GoogleCalendarProvider, InMemoryCalendarProvider};
pub use config::Config;
pub use error::{ProviderError, ToolError};
pub use llm::{AnthropicClient, LanguageModel};
pub use orchestrator::{TurnEvent, TurnOrchestrator, TurnOutcome};
pub use server::{build_router, run_server};
pub use shared_state::AppState;
pub use store::PlannerDatabase;
pub use tools::{ToolCall, ToolExecutor, ToolOutcome};

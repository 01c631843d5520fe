// planner-assistant/crates/planner-assistant/src/main.rs

use clap::Parser;
use planner_assistant::{config::Config, run_server, telemetry};

#[derive(Debug, Parser)]
#[command(name = "planner-assistant", version, about = "Personal planning assistant server")]
struct Cli {
    /// Override API_HOST
    #[arg(long)]
    host: Option<String>,

    /// Override API_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Override DB_PATH
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Use the in-process calendar instead of Google Calendar
    #[arg(long)]
    memory_calendar: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(host) = cli.host {
        cfg.api_host = host;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(db_path) = cli.db_path {
        cfg.db_path = db_path;
    }
    if cli.memory_calendar {
        cfg.calendar_provider = planner_assistant::config::CalendarProviderKind::Memory;
    }

    run_server(cfg).await
}

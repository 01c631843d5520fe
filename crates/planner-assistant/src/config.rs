// planner-assistant/crates/planner-assistant/src/config.rs

use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// Which calendar backend the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarProviderKind {
    Google,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub ai_model: String,
    pub title_model: String,
    pub max_tokens: u32,
    pub max_tool_rounds: usize,
    pub history_limit: usize,
    pub calendar_provider: CalendarProviderKind,
    pub google_credentials_path: PathBuf,
    pub google_token_path: PathBuf,
    pub google_calendar_base_url: String,
    pub db_path: PathBuf,
    pub timezone: Tz,
    pub work_start_hour: u32,
    pub work_end_hour: u32,
    pub api_host: String,
    pub api_port: u16,
    pub frontend_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let timezone_name = get("TIMEZONE", "America/New_York");
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid TIMEZONE '{}': {}", timezone_name, e))?;

        let calendar_provider = match get("CALENDAR_PROVIDER", "google").to_lowercase().as_str() {
            "google" => CalendarProviderKind::Google,
            "memory" => CalendarProviderKind::Memory,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown CALENDAR_PROVIDER '{}'. Expected 'google' or 'memory'",
                    other
                ))
            }
        };

        let work_start_hour: u32 = get("WORK_START_HOUR", "9")
            .parse()
            .context("WORK_START_HOUR must be an hour between 0 and 23")?;
        let work_end_hour: u32 = get("WORK_END_HOUR", "18")
            .parse()
            .context("WORK_END_HOUR must be an hour between 1 and 24")?;
        if work_start_hour >= work_end_hour || work_end_hour > 24 {
            return Err(anyhow::anyhow!(
                "Working hours {}..{} are not a valid range",
                work_start_hour,
                work_end_hour
            ));
        }

        let max_tool_rounds: usize = get("MAX_TOOL_ROUNDS", "5")
            .parse()
            .context("MAX_TOOL_ROUNDS must be a positive integer")?;
        if max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("MAX_TOOL_ROUNDS must be at least 1"));
        }

        Ok(Self {
            anthropic_api_key: get("ANTHROPIC_API_KEY", ""),
            anthropic_base_url: get("ANTHROPIC_BASE_URL", "https://api.anthropic.com")
                .trim_end_matches('/')
                .to_string(),
            ai_model: get("AI_MODEL", "claude-sonnet-4-5"),
            title_model: get("TITLE_MODEL", "claude-haiku-4-5"),
            max_tokens: get("MAX_TOKENS", "4096")
                .parse()
                .context("MAX_TOKENS must be a positive integer")?,
            max_tool_rounds,
            history_limit: get("HISTORY_LIMIT", "20")
                .parse()
                .context("HISTORY_LIMIT must be a positive integer")?,
            calendar_provider,
            google_credentials_path: PathBuf::from(get("GOOGLE_CREDENTIALS_PATH", "credentials.json")),
            google_token_path: PathBuf::from(get("GOOGLE_TOKEN_PATH", "token.json")),
            google_calendar_base_url: get(
                "GOOGLE_CALENDAR_BASE_URL",
                "https://www.googleapis.com/calendar/v3",
            )
            .trim_end_matches('/')
            .to_string(),
            db_path: PathBuf::from(get("DB_PATH", "./data/planner.db")),
            timezone,
            work_start_hour,
            work_end_hour,
            api_host: get("API_HOST", "127.0.0.1"),
            api_port: get("API_PORT", "8000").parse().context("API_PORT must be a port number")?,
            frontend_url: get("FRONTEND_URL", "http://localhost:5173"),
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Model: {} (titles: {})", self.ai_model, self.title_model);
        info!(
            "- Anthropic API key: {}",
            if self.anthropic_api_key.is_empty() { "not set" } else { "set" }
        );
        info!("- Max tokens: {}", self.max_tokens);
        info!("- Max tool rounds: {}", self.max_tool_rounds);
        info!("- History limit: {}", self.history_limit);
        info!("- Calendar provider: {:?}", self.calendar_provider);
        info!("- Token cache: {}", self.google_token_path.display());
        info!("- Database: {}", self.db_path.display());
        info!("- Timezone: {}", self.timezone);
        info!("- Work hours: {}:00-{}:00", self.work_start_hour, self.work_end_hour);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Frontend: {}", self.frontend_url);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    /// Origins allowed by CORS: the local dev servers plus the configured frontend.
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins = vec![
            "http://localhost:5173".to_string(),
            "http://localhost:3000".to_string(),
            "http://127.0.0.1:5173".to_string(),
        ];
        if !self.frontend_url.is_empty() && !origins.contains(&self.frontend_url) {
            origins.push(self.frontend_url.clone());
        }
        origins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.ai_model, "claude-sonnet-4-5");
        assert_eq!(config.title_model, "claude-haiku-4-5");
        assert_eq!(config.max_tool_rounds, 5);
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.calendar_provider, CalendarProviderKind::Google);
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.work_start_hour, 9);
        assert_eq!(config.work_end_hour, 18);
        assert!(config.anthropic_api_key.is_empty());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = config_from(&[
            ("TIMEZONE", "Europe/Berlin"),
            ("CALENDAR_PROVIDER", "memory"),
            ("MAX_TOOL_ROUNDS", "3"),
            ("ANTHROPIC_BASE_URL", "http://localhost:9999/"),
            ("API_PORT", "3000"),
        ])
        .unwrap();

        assert_eq!(config.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.calendar_provider, CalendarProviderKind::Memory);
        assert_eq!(config.max_tool_rounds, 3);
        assert_eq!(config.anthropic_base_url, "http://localhost:9999");
        assert_eq!(config.api_addr().unwrap().port(), 3000);
    }

    #[test]
    fn test_invalid_timezone_is_rejected() {
        assert!(config_from(&[("TIMEZONE", "Mars/Olympus")]).is_err());
    }

    #[test]
    fn test_inverted_work_hours_are_rejected() {
        assert!(config_from(&[("WORK_START_HOUR", "18"), ("WORK_END_HOUR", "9")]).is_err());
    }

    #[test]
    fn test_zero_tool_rounds_is_rejected() {
        assert!(config_from(&[("MAX_TOOL_ROUNDS", "0")]).is_err());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        assert!(config_from(&[("CALENDAR_PROVIDER", "outlook")]).is_err());
    }

    #[test]
    fn test_frontend_url_added_to_origins_once() {
        let config = config_from(&[("FRONTEND_URL", "https://planner.example.com")]).unwrap();
        let origins = config.allowed_origins();
        assert_eq!(origins.len(), 4);
        assert!(origins.contains(&"https://planner.example.com".to_string()));

        let config = config_from(&[("FRONTEND_URL", "http://localhost:5173")]).unwrap();
        assert_eq!(config.allowed_origins().len(), 3);
    }
}

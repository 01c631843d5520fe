//! Cached OAuth access token for the calendar API, refreshed from the
//! authorized-user token file.
use crate::error::ProviderError;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// On-disk token cache in the authorized-user format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUserToken {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    /// Fields we do not interpret (scopes, account, ...) are written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuthorizedUserToken {
    fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.expiry
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Usable without refresh for at least the safety margin.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expiry_time()) {
            (Some(token), Some(expiry)) if !token.is_empty() => expiry - now > Duration::seconds(REFRESH_MARGIN_SECS),
            (Some(token), None) => !token.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct TokenManager {
    path: PathBuf,
    http: reqwest::Client,
    cached: Mutex<Option<AuthorizedUserToken>>,
}

impl TokenManager {
    pub fn new(path: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self { path: path.into(), http, cached: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token_file_present(&self) -> bool {
        self.path.exists()
    }

    /// A valid access token, refreshing and persisting it first when needed.
    pub async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = Some(self.load()?);
        }
        let token = cached
            .as_mut()
            .ok_or_else(|| ProviderError::NotConfigured("token cache unavailable".into()))?;

        if !token.is_fresh(Utc::now()) {
            self.refresh(token).await?;
            self.persist(token);
        }
        token
            .token
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured("token file has no access token".into()))
    }

    /// Forces the next call to refresh, e.g. after the API answered 401.
    pub async fn invalidate(&self) {
        if let Some(token) = self.cached.lock().await.as_mut() {
            token.expiry = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    fn load(&self) -> Result<AuthorizedUserToken, ProviderError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            ProviderError::NotConfigured(format!("cannot read token file {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ProviderError::NotConfigured(format!("token file {} is invalid: {}", self.path.display(), e))
        })
    }

    async fn refresh(&self, token: &mut AuthorizedUserToken) -> Result<(), ProviderError> {
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or_else(|| ProviderError::NotConfigured("token expired and no refresh token is stored".into()))?;

        debug!("Refreshing calendar access token via {}", token.token_uri);
        let response = self
            .http
            .post(&token.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Token refresh failed with {}: {}", status, body);
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }

        let refreshed: RefreshResponse = response.json().await?;
        let expires_in = refreshed.expires_in.unwrap_or(3600);
        token.token = Some(refreshed.access_token);
        token.expiry = Some(
            (Utc::now() + Duration::seconds(expires_in)).to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        if let Some(rotated) = refreshed.refresh_token {
            token.refresh_token = Some(rotated);
        }
        info!("Calendar access token refreshed (expires in {}s)", expires_in);
        Ok(())
    }

    fn persist(&self, token: &AuthorizedUserToken) {
        let result = serde_json::to_string_pretty(token)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(&self.path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!("Failed to write token cache {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_token(dir: &Path, token_uri: &str, expiry: DateTime<Utc>) -> PathBuf {
        let path = dir.join("token.json");
        let body = json!({
            "token": "old-token",
            "refresh_token": "refresh-me",
            "token_uri": token_uri,
            "client_id": "client",
            "client_secret": "secret",
            "scopes": ["https://www.googleapis.com/auth/calendar"],
            "expiry": expiry.to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_fresh_token_is_used_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(dir.path(), "http://127.0.0.1:9/token", Utc::now() + Duration::hours(1));
        let manager = TokenManager::new(path, reqwest::Client::new());

        assert_eq!(manager.access_token().await.unwrap(), "old-token");
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "refresh-me".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-token","expires_in":3599,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let token_uri = format!("{}/token", server.url());
        let path = write_token(dir.path(), &token_uri, Utc::now() + Duration::seconds(30));
        let manager = TokenManager::new(path.clone(), reqwest::Client::new());

        assert_eq!(manager.access_token().await.unwrap(), "new-token");
        // Cached afterwards: no second request.
        assert_eq!(manager.access_token().await.unwrap(), "new-token");
        mock.assert_async().await;

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["token"], "new-token");
        assert_eq!(saved["refresh_token"], "refresh-me");
        assert_eq!(saved["scopes"][0], "https://www.googleapis.com/auth/calendar");
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_token(dir.path(), &format!("{}/token", server.url()), Utc::now() - Duration::hours(1));
        let manager = TokenManager::new(path, reqwest::Client::new());

        match manager.access_token().await {
            Err(ProviderError::Status { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_missing_token_file_needs_setup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TokenManager::new(dir.path().join("absent.json"), reqwest::Client::new());
        assert!(!manager.token_file_present());
        assert!(matches!(manager.access_token().await, Err(ProviderError::NotConfigured(_))));
    }
}

//! OAuth token source.
//!
//! Holds the in-memory access token and the long-lived refresh credential.
//! The broker rotates the refresh credential on every refresh, so the rotated
//! value is written back to the state store (authoritative) and, best effort,
//! to the local `.env` backup. The interactive authorization-code flow lives
//! outside this process; only the refresh grant is performed here.

use crate::config::AuthConfig;
use crate::domain::errors::GatewayError;
use crate::domain::ports::StateStore;
use crate::infrastructure::persistence::REFRESH_TOKEN_KEY;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Refresh when the access token is within this margin of expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
    refresh_token: Option<String>,
}

pub struct TokenSource {
    http: reqwest::Client,
    config: AuthConfig,
    store: Arc<dyn StateStore>,
    state: Mutex<TokenState>,
}

impl TokenSource {
    pub fn new(config: AuthConfig, store: Arc<dyn StateStore>) -> Self {
        let bootstrap = config.refresh_token.clone();
        Self {
            http: reqwest::Client::new(),
            config,
            store,
            state: Mutex::new(TokenState {
                access_token: None,
                expires_at: None,
                refresh_token: bootstrap,
            }),
        }
    }

    /// A currently-valid bearer token, refreshing if missing or near expiry.
    ///
    /// `AuthUnavailable` is non-retryable for the caller: orders are skipped
    /// and the next periodic cycle tries again.
    pub async fn bearer(&self) -> Result<String, GatewayError> {
        let mut state = self.state.lock().await;

        let stale = match (&state.access_token, state.expires_at) {
            (None, _) => true,
            (_, None) => true,
            (_, Some(expires_at)) => Instant::now() + EXPIRY_SKEW >= expires_at,
        };

        if stale {
            info!("Access token missing or near expiry, refreshing...");
            self.refresh(&mut state).await?;
        }

        state
            .access_token
            .clone()
            .ok_or_else(|| GatewayError::AuthUnavailable {
                reason: "no access token after refresh".to_string(),
            })
    }

    async fn refresh(&self, state: &mut TokenState) -> Result<(), GatewayError> {
        // A peer process may have rotated the credential; the stored value wins.
        match self.store.get(REFRESH_TOKEN_KEY).await {
            Ok(Some(stored)) if state.refresh_token.as_deref() != Some(stored.as_str()) => {
                info!("Newer refresh credential found in state store, adopting it");
                state.refresh_token = Some(stored);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read refresh credential from state store: {e:#}"),
        }

        let refresh_token =
            state
                .refresh_token
                .clone()
                .ok_or_else(|| GatewayError::AuthUnavailable {
                    reason: "no refresh credential available".to_string(),
                })?;

        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.config.app_key.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::AuthUnavailable {
                reason: format!("token endpoint unreachable: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Token refresh failed ({status}): {}", redact(&body));
            return Err(GatewayError::AuthUnavailable {
                reason: format!("token endpoint returned {status}"),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::AuthUnavailable {
                reason: format!("token response was not JSON: {e}"),
            })?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::AuthUnavailable {
                reason: "token response missing access_token".to_string(),
            })?;
        state.access_token = Some(access_token.to_string());

        if let Some(expires_in) = body.get("expires_in").and_then(Value::as_u64) {
            state.expires_at = Some(Instant::now() + Duration::from_secs(expires_in));
        }

        // The broker rotates the refresh credential on every grant.
        if let Some(rotated) = body.get("refresh_token").and_then(Value::as_str) {
            state.refresh_token = Some(rotated.to_string());
            if let Err(e) = self.store.set(REFRESH_TOKEN_KEY, rotated).await {
                error!("Failed to persist rotated refresh credential: {e:#}");
            }
            self.write_env_backup(rotated);
        }

        info!("Access token refreshed");
        Ok(())
    }

    /// Best-effort local backup of the rotated credential. The state store is
    /// authoritative; a failure here is only worth a warning.
    fn write_env_backup(&self, token: &str) {
        let Some(path) = self.config.env_backup_path.as_deref() else {
            return;
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return;
        };

        let mut found = false;
        let mut lines: Vec<String> = contents
            .lines()
            .map(|line| {
                if line.starts_with("REFRESH_TOKEN=") {
                    found = true;
                    format!("REFRESH_TOKEN={token}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        if !found {
            lines.push(format!("REFRESH_TOKEN={token}"));
        }

        if let Err(e) = std::fs::write(path, lines.join("\n") + "\n") {
            warn!("Could not update {path} with rotated refresh credential: {e}");
        }
    }
}

/// Strip credential fields from an error body before logging it.
pub(crate) fn redact(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            if let Some(map) = value.as_object_mut() {
                for key in ["access_token", "refresh_token", "client_secret"] {
                    if map.contains_key(key) {
                        map.insert(key.to_string(), Value::String("***".to_string()));
                    }
                }
            }
            value.to_string()
        }
        // Not JSON; keep only a short prefix in case secrets are echoed back.
        Err(_) => body.chars().take(200).collect(),
    }
}

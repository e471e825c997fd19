//! Credential supply and refresh against the authorization service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Refresh the credential when its reported validity gets this close to
/// expiring.
const REFRESH_MARGIN: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential source unavailable: {0}")]
    Unavailable(String),

    /// The authorization service reported the credential as killed.
    #[error("Credential revoked")]
    Revoked,

    #[error("Authorization service error: {0}")]
    Service(String),
}

/// Supplies the secret attached to every tunnel dial.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn secret(&self) -> Result<String, CredentialError>;
}

/// Fixed secret, e.g. from configuration or an environment variable.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    secret: String,
}

impl StaticCredentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn secret(&self) -> Result<String, CredentialError> {
        Ok(self.secret.clone())
    }
}

/// Secret read from a file on every use, so a mounted secret that gets
/// rotated is picked up without a restart.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentials {
    async fn secret(&self) -> Result<String, CredentialError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map(|secret| secret.trim().to_string())
            .map_err(|err| {
                CredentialError::Unavailable(format!("{}: {err}", self.path.display()))
            })
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "peerKey")]
    peer_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    payload: Option<LoginPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    peer_id: String,
    #[serde(default)]
    killed: bool,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    payload: Option<ValidatePayload>,
}

#[derive(Debug, Deserialize)]
struct ValidatePayload {
    /// Remaining validity, in minutes.
    ttl: u64,
}

/// Client for the external authorization service.
pub struct AuthClient {
    http: reqwest::Client,
    login_url: String,
    validate_url: String,
}

impl AuthClient {
    pub fn new(
        http: reqwest::Client,
        login_url: impl Into<String>,
        validate_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            login_url: login_url.into(),
            validate_url: validate_url.into(),
        }
    }

    /// Exchange the secret for its identity, learning whether the
    /// credential has been killed.
    async fn login(&self, secret: &str) -> Result<LoginPayload, CredentialError> {
        let response: LoginResponse = self
            .post_json(&self.login_url, &LoginRequest { peer_key: secret })
            .await?;

        response
            .payload
            .ok_or_else(|| CredentialError::Service("login response had no payload".to_string()))
    }

    /// Check the secret's remaining validity.
    async fn validate(&self, secret: &str) -> Result<Duration, CredentialError> {
        let response: ValidateResponse = self
            .post_json(&self.validate_url, &LoginRequest { peer_key: secret })
            .await?;

        let payload = response.payload.ok_or_else(|| {
            CredentialError::Service("validate response had no payload".to_string())
        })?;
        Ok(Duration::from_secs(payload.ttl * 60))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
    ) -> Result<T, CredentialError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| CredentialError::Service(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CredentialError::Service(format!(
                "authorization endpoint returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| CredentialError::Service(err.to_string()))
    }
}

/// Keeps the credential fresh and tracks revocation.
///
/// A periodic task re-validates the secret; when the reported TTL gets
/// within an hour of expiry, a login refreshes it. A killed verdict flips
/// the shared killed flag, which stops dialing for good.
pub struct TokenHandler {
    credentials: Arc<dyn CredentialProvider>,
    client: AuthClient,
    killed: Arc<AtomicBool>,
    state: Mutex<TokenState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct TokenState {
    peer_id: Option<String>,
    expiry: Instant,
}

impl TokenHandler {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        client: AuthClient,
        killed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            credentials,
            client,
            killed,
            state: Mutex::new(TokenState {
                peer_id: None,
                // Expired on purpose so the first cycle refreshes.
                expiry: Instant::now(),
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn peer_id(&self) -> Option<String> {
        self.state.lock().unwrap().peer_id.clone()
    }

    /// Re-login and record the credential's identity. Serialized so two
    /// callers never refresh concurrently.
    pub async fn refresh(&self) -> Result<(), CredentialError> {
        let _guard = self.refresh_lock.lock().await;

        if self.is_killed() {
            return Err(CredentialError::Revoked);
        }

        let secret = self.credentials.secret().await?;
        let payload = self.client.login(&secret).await?;

        if payload.killed {
            warn!("Authorization service reports credential as killed");
            self.killed.store(true, Ordering::SeqCst);
            return Err(CredentialError::Revoked);
        }

        info!(peer_id = %payload.peer_id, "Credential refreshed");
        self.state.lock().unwrap().peer_id = Some(payload.peer_id);
        Ok(())
    }

    /// Validate the secret's remaining TTL and refresh when it is close to
    /// expiring.
    pub async fn check_expiry(&self) -> Result<(), CredentialError> {
        let secret = self.credentials.secret().await?;
        let ttl = self.client.validate(&secret).await?;

        {
            let mut state = self.state.lock().unwrap();
            state.expiry = Instant::now() + ttl;
        }
        debug!(?ttl, "Credential validity updated");

        let expiry = self.state.lock().unwrap().expiry;
        if expiry.saturating_duration_since(Instant::now()) < REFRESH_MARGIN {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Run expiry checks on an interval until the credential is killed.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                match handler.check_expiry().await {
                    Err(CredentialError::Revoked) => {
                        warn!("Credential revoked, stopping refresh task");
                        return;
                    }
                    Err(err) => warn!(error = %err, "Credential check failed"),
                    Ok(()) => {}
                }
                tokio::time::sleep(interval).await;
            }
        });
    }
}

//! Peer identity: validating inbound credentials

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential is unknown, expired or revoked. Registration is
    /// rejected and the peer must stop reconnecting.
    #[error("Peer credential rejected")]
    Unauthorized,

    #[error("Authorization service unavailable: {0}")]
    Unavailable(String),
}

/// Validates an inbound credential and resolves the peer identifier the
/// registry files the connection under. The identifier always comes from
/// the validation result, never from client-supplied data.
#[async_trait]
pub trait PeerAuthenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Serialize)]
struct ValidateTokenRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateTokenResponse {
    payload: Option<ValidateTokenPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateTokenPayload {
    is_valid: bool,
    peer_id: String,
}

/// Authenticator backed by an external authorization service.
pub struct ControlPlaneAuthenticator {
    http: reqwest::Client,
    endpoint: String,
}

impl ControlPlaneAuthenticator {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl PeerAuthenticator for ControlPlaneAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&ValidateTokenRequest { token: credential })
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "validation endpoint returned {}",
                response.status()
            )));
        }

        let body: ValidateTokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        match body.payload {
            Some(payload) if payload.is_valid => {
                debug!(peer_id = %payload.peer_id, "Credential validated");
                Ok(payload.peer_id)
            }
            _ => Err(AuthError::Unauthorized),
        }
    }
}

/// Fixed credential → peer-id table, for development and tests.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    peers: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(peers: HashMap<String, String>) -> Self {
        Self { peers }
    }

    pub fn with_peer(mut self, credential: impl Into<String>, peer_id: impl Into<String>) -> Self {
        self.peers.insert(credential.into(), peer_id.into());
        self
    }
}

#[async_trait]
impl PeerAuthenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<String, AuthError> {
        self.peers
            .get(credential)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let authenticator = StaticAuthenticator::default().with_peer("key-1", "peer-a");

        assert_eq!(authenticator.authenticate("key-1").await.unwrap(), "peer-a");
        assert!(matches!(
            authenticator.authenticate("key-2").await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[test]
    fn test_validate_payload_decoding() {
        let raw = r#"{"payload":{"isValid":true,"peerId":"peer-a","ttl":30}}"#;
        let decoded: ValidateTokenResponse = serde_json::from_str(raw).unwrap();
        let payload = decoded.payload.unwrap();
        assert!(payload.is_valid);
        assert_eq!(payload.peer_id, "peer-a");
    }

    #[test]
    fn test_validate_error_envelope() {
        let raw = r#"{"error":{"message":"nope"}}"#;
        let decoded: ValidateTokenResponse = serde_json::from_str(raw).unwrap();
        assert!(decoded.payload.is_none());
    }
}

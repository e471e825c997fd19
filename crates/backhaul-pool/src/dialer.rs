//! Dialing new tunnel connections

use backhaul_connection::{Transport, TransportError};
use backhaul_proto::Role;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// The peer credential was rejected or revoked. Fatal: the owning
    /// process must stop reconnecting until the credential is refreshed.
    #[error("Peer credential rejected")]
    Unauthorized,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Dial failed: {0}")]
    Connect(String),
}

impl DialError {
    /// Fatal errors stop replenishment entirely instead of backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DialError::Unauthorized)
    }
}

/// Establishes, authenticates and handshakes one new tunnel connection
/// that the dialing side will bind under `role`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, role: Role) -> Result<Arc<dyn Transport>, DialError>;
}

//! Wire protocol for backhaul tunnel connections
//!
//! A tunnel connection carries a strict sequence of frames: a one-line text
//! handshake when the connection is established, then per exchange a
//! text/JSON head frame followed by a single binary body frame, in each
//! direction. Ping/pong frames may be interleaved at any point.

mod frame;
mod messages;

pub use frame::{Frame, Handshake, Role};
pub use messages::{RequestHead, ResponseHead};

use thiserror::Error;

/// Status code reported back through the tunnel when the executor fails to
/// reach its local upstream. The connection stays usable.
pub const UPSTREAM_ERROR_STATUS: u16 = 527;

/// Status code returned to a peer whose credential is invalid or revoked.
/// Agents must treat it as fatal and stop reconnecting.
pub const UNAUTHORIZED_PEER_STATUS: u16 = 526;

/// Header naming the URL an exchange should be executed against.
pub const DESTINATION_HEADER: &str = "x-proxy-destination";

/// Header naming the destination peer on the broker's request endpoint.
pub const PEER_ID_HEADER: &str = "x-peer-id";

/// Header carrying the peer credential on connection establishment.
pub const PEER_KEY_HEADER: &str = "x-peer-key";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Invalid connection role: {0}")]
    InvalidRole(u8),

    #[error("Invalid head frame: {0}")]
    InvalidHead(#[from] serde_json::Error),

    #[error("Unexpected frame: expected {expected}")]
    UnexpectedFrame { expected: &'static str },
}

//! Backhaul broker: the public-facing side of the tunnel
//!
//! Agents register outbound WebSocket connections on `/register`; external
//! callers send ordinary HTTP requests to `/request` and the broker drives
//! them through an idle tunnel connection of the destination peer's pool.

mod auth;
mod config;
mod registry;
mod reporter;
mod server;
mod ws;

pub use auth::{AuthError, ControlPlaneAuthenticator, PeerAuthenticator, StaticAuthenticator};
pub use config::BrokerConfig;
pub use registry::Registry;
pub use reporter::{PeerStatus, StatusReporter};
pub use server::{router, BrokerState};
pub use ws::WsServerTransport;

//! Backhaul agent: the private side of the tunnel
//!
//! Maintains a pool of outbound tunnel connections to the broker and serves
//! a small local HTTP surface: `/request` for in-cluster callers that want
//! to send requests out through the broker, and `/healthz` for readiness.

mod auth;
mod client;
mod config;
mod dialer;
mod server;

pub use auth::{
    AuthClient, CredentialError, CredentialProvider, FileCredentials, StaticCredentials,
    TokenHandler,
};
pub use client::Client;
pub use config::AgentConfig;
pub use dialer::BrokerDialer;
pub use server::{router, AgentState};

//! Tunnel connections and the exchange protocol that runs over them
//!
//! A tunnel connection wraps one duplex message transport with a lifecycle
//! state machine and a role. A [`DispatcherConnection`] drives one HTTP
//! exchange at a time over the transport and demultiplexes inbound frames
//! back to the exchange waiting for them; an [`ExecutorConnection`] receives
//! forwarded requests, runs them against a local upstream and streams the
//! response back.

mod connection;
mod dispatcher;
mod executor;
mod transport;
mod ws;

pub use connection::{ConnectionError, ConnectionStatus, PoolMembership};
pub use dispatcher::{DispatcherConnection, ProxyRequest, ProxyResponse};
pub use executor::ExecutorConnection;
pub use transport::{memory_pair, MemoryTransport, Transport, TransportError};
pub use ws::WsClientTransport;

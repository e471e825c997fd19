//! Per-peer pools of tunnel connections
//!
//! A pool owns every tunnel connection established with one peer: the
//! executor connections serving inbound exchanges and the dispatcher
//! connections available for outbound ones. It hands out idle dispatchers
//! with a timeout, evicts connections that sat idle too long, and (on the
//! dialing side) replenishes itself on a timer with exponential backoff.

mod backoff;
mod dialer;
mod pool;

pub use backoff::Backoff;
pub use dialer::{DialError, Dialer};
pub use pool::{Pool, PoolConfig, PoolCounts, PoolError};

//! Shared connection lifecycle state machine

use crate::dispatcher::DispatcherConnection;
use crate::transport::TransportError;
use backhaul_proto::ProtocolError;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Pong wait timeout")]
    PongTimeout,
}

/// Lifecycle status of a tunnel connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Idle,
    Busy,
    Closed,
}

/// The slice of a pool a connection needs: re-offering itself when released
/// and removing itself when closed. Connections hold this weakly so a pool
/// that was dropped simply stops receiving callbacks.
pub trait PoolMembership: Send + Sync {
    fn offer(&self, connection: Arc<DispatcherConnection>);
    fn remove(&self, id: Uuid);
}

/// Status plus idle-since stamp behind one per-connection lock, independent
/// of the pool lock.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    inner: Mutex<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    status: ConnectionStatus,
    idle_since: Instant,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                status: ConnectionStatus::Connecting,
                idle_since: Instant::now(),
            }),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.inner.lock().unwrap().status
    }

    /// Atomically claim an idle connection for an exchange. Fails on any
    /// other status; callers must treat failure as "try another connection".
    pub(crate) fn take(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != ConnectionStatus::Idle {
            return false;
        }
        inner.status = ConnectionStatus::Busy;
        true
    }

    /// Mark the connection ready again and stamp the idle clock. Returns
    /// false (and does nothing) once the connection is closed.
    pub(crate) fn mark_idle(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == ConnectionStatus::Closed {
            return false;
        }
        inner.status = ConnectionStatus::Idle;
        inner.idle_since = Instant::now();
        true
    }

    /// Mark the connection as carrying an exchange. No-op once closed.
    pub(crate) fn mark_busy(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == ConnectionStatus::Closed {
            return false;
        }
        inner.status = ConnectionStatus::Busy;
        true
    }

    /// Transition to Closed. Returns true exactly once; the winner performs
    /// transport close and pool removal.
    pub(crate) fn transition_closed(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == ConnectionStatus::Closed {
            return false;
        }
        inner.status = ConnectionStatus::Closed;
        true
    }

    /// True when the connection is Idle and has been idle strictly longer
    /// than `timeout`.
    pub(crate) fn idle_longer_than(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.status == ConnectionStatus::Idle && inner.idle_since.elapsed() > timeout
    }
}

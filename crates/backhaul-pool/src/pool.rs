//! The per-peer connection pool

use crate::backoff::Backoff;
use crate::dialer::{DialError, Dialer};
use backhaul_connection::{
    DispatcherConnection, ExecutorConnection, PoolMembership, Transport,
};
use backhaul_proto::Role;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pool sizing and timing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of idle connections the pool tries to keep per role.
    pub idle_target: usize,
    /// Hard cap on connections per role.
    pub max_size: usize,
    /// How long `acquire` waits for an idle dispatcher.
    pub acquire_timeout: Duration,
    /// Idle age beyond which extra connections are evicted.
    pub idle_timeout: Duration,
    /// Baseline interval between replenishment cycles.
    pub replenish_interval: Duration,
    /// Ceiling for the replenishment backoff.
    pub max_replenish_interval: Duration,
    /// Ping interval on executor connections.
    pub keepalive_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_target: 10,
            max_size: 100,
            acquire_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            replenish_interval: Duration::from_secs(30),
            max_replenish_interval: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// No idle connection became available inside the acquire timeout.
    /// Retryable; callers surface it as a no-capacity condition.
    #[error("No idle connection available")]
    NoIdleConnection,

    #[error("Pool is shut down")]
    Shutdown,
}

/// Snapshot of pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub executors: usize,
    pub idle_executors: usize,
    pub dispatchers: usize,
    pub idle_dispatchers: usize,
    pub busy_dispatchers: usize,
}

/// All tunnel connections established with one peer.
///
/// Membership lists live under one reader/writer lock; the idle-offer queue
/// is a bounded channel (capacity = max size) shared without that lock.
/// Per-connection status has its own lock, so exchange completion never
/// contends with pool mutation.
pub struct Pool {
    peer: String,
    config: PoolConfig,
    idle_target: AtomicUsize,
    http: reqwest::Client,
    executors: RwLock<Vec<Arc<ExecutorConnection>>>,
    dispatchers: RwLock<Vec<Arc<DispatcherConnection>>>,
    idle_tx: mpsc::Sender<Arc<DispatcherConnection>>,
    idle_rx: Mutex<mpsc::Receiver<Arc<DispatcherConnection>>>,
    done_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("peer", &self.peer)
            .field("counts", &self.counts())
            .finish()
    }
}

impl Pool {
    pub fn new(peer: impl Into<String>, config: PoolConfig, http: reqwest::Client) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::channel(config.max_size.max(1));
        let (done_tx, _) = watch::channel(false);

        Arc::new(Self {
            peer: peer.into(),
            idle_target: AtomicUsize::new(config.idle_target),
            config,
            http,
            executors: RwLock::new(Vec::new()),
            dispatchers: RwLock::new(Vec::new()),
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            done_tx,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn idle_target(&self) -> usize {
        self.idle_target.load(Ordering::Relaxed)
    }

    /// Adjust the idle target, e.g. from the peer's handshake.
    pub fn set_idle_target(&self, idle_target: usize) {
        self.idle_target.store(idle_target, Ordering::Relaxed);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Bind an established transport as a dispatcher connection and make it
    /// available for acquisition. Rejected once the pool is shut down.
    pub fn add_dispatcher(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<DispatcherConnection>> {
        if self.is_shut_down() {
            tokio::spawn(async move { transport.close().await });
            return None;
        }

        let home = Arc::downgrade(self) as Weak<dyn PoolMembership>;
        let connection = DispatcherConnection::spawn(transport, home);
        self.dispatchers.write().unwrap().push(connection.clone());
        connection.release();

        debug!(peer = %self.peer, connection_id = %connection.id(), "Added dispatcher connection");
        Some(connection)
    }

    /// Bind an established transport as an executor connection. Rejected
    /// once the pool is shut down.
    pub fn add_executor(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<ExecutorConnection>> {
        if self.is_shut_down() {
            tokio::spawn(async move { transport.close().await });
            return None;
        }

        let home = Arc::downgrade(self) as Weak<dyn PoolMembership>;
        let connection = ExecutorConnection::spawn(
            transport,
            self.http.clone(),
            home,
            self.config.keepalive_interval,
        );
        self.executors.write().unwrap().push(connection.clone());

        debug!(peer = %self.peer, connection_id = %connection.id(), "Added executor connection");
        Some(connection)
    }

    /// Borrow an idle dispatcher connection. The returned connection is
    /// already taken (Busy); hand it back with `release` after a successful
    /// exchange or `close` it on error.
    ///
    /// Entries may have closed while queued; they are skipped and the wait
    /// continues until the timeout budget runs out.
    pub async fn acquire(&self) -> Result<Arc<DispatcherConnection>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Shutdown);
        }

        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut idle = self.idle_rx.lock().await;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PoolError::NoIdleConnection);
            }

            match tokio::time::timeout(remaining, idle.recv()).await {
                Err(_) => return Err(PoolError::NoIdleConnection),
                Ok(None) => return Err(PoolError::Shutdown),
                Ok(Some(connection)) => {
                    if connection.take() {
                        return Ok(connection);
                    }
                    // Closed (or otherwise claimed) while queued; keep looking.
                }
            }
        }
    }

    /// Dial however many connections are needed to reach the idle target
    /// per role, never exceeding the max size. Stops at the first dial
    /// failure; the caller decides how to back off.
    pub async fn replenish(self: &Arc<Self>, dialer: &dyn Dialer) -> Result<(), DialError> {
        if self.is_shut_down() {
            return Ok(());
        }

        let counts = self.counts();
        let executors_needed = self.connections_to_create(counts.idle_executors, counts.executors);
        let dispatchers_needed =
            self.connections_to_create(counts.idle_dispatchers, counts.dispatchers);

        if executors_needed > 0 || dispatchers_needed > 0 {
            info!(
                peer = %self.peer,
                executors = executors_needed,
                dispatchers = dispatchers_needed,
                "Replenishing pool"
            );
        }

        for _ in 0..executors_needed {
            let transport = dialer.dial(Role::Executor).await?;
            self.add_executor(transport);
        }

        for _ in 0..dispatchers_needed {
            let transport = dialer.dial(Role::Dispatcher).await?;
            self.add_dispatcher(transport);
        }

        Ok(())
    }

    fn connections_to_create(&self, idle: usize, total: usize) -> usize {
        let mut to_create = self.idle_target().saturating_sub(idle);
        if total + to_create > self.config.max_size {
            to_create = self.config.max_size.saturating_sub(total);
        }
        to_create
    }

    /// Close connections that sat idle longer than the idle timeout, but
    /// only beyond the idle-target threshold: a burst-absorbing surplus is
    /// allowed to linger until it ages out.
    pub async fn evict(&self) {
        let threshold = self.idle_target();
        let timeout = self.config.idle_timeout;

        let mut stale_dispatchers = Vec::new();
        {
            let dispatchers = self.dispatchers.read().unwrap();
            let mut idle_seen = 0;
            for connection in dispatchers.iter() {
                if connection.status() == backhaul_connection::ConnectionStatus::Idle {
                    idle_seen += 1;
                    if idle_seen > threshold && connection.idle_longer_than(timeout) {
                        stale_dispatchers.push(connection.clone());
                    }
                }
            }
        }

        let mut stale_executors = Vec::new();
        {
            let executors = self.executors.read().unwrap();
            let mut idle_seen = 0;
            for connection in executors.iter() {
                if connection.status() == backhaul_connection::ConnectionStatus::Idle {
                    idle_seen += 1;
                    if idle_seen > threshold && connection.idle_longer_than(timeout) {
                        stale_executors.push(connection.clone());
                    }
                }
            }
        }

        for connection in stale_dispatchers {
            debug!(peer = %self.peer, connection_id = %connection.id(), "Evicting idle dispatcher");
            connection.close().await;
        }
        for connection in stale_executors {
            debug!(peer = %self.peer, connection_id = %connection.id(), "Evicting idle executor");
            connection.close().await;
        }
    }

    /// Stop accepting connections, close every member and clear the lists.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(peer = %self.peer, "Shutting down pool");
        let _ = self.done_tx.send(true);

        let dispatchers = std::mem::take(&mut *self.dispatchers.write().unwrap());
        let executors = std::mem::take(&mut *self.executors.write().unwrap());

        for connection in dispatchers {
            connection.close().await;
        }
        for connection in executors {
            connection.close().await;
        }
    }

    /// True when no connection of either role remains.
    pub fn is_empty(&self) -> bool {
        self.dispatchers.read().unwrap().is_empty() && self.executors.read().unwrap().is_empty()
    }

    pub fn counts(&self) -> PoolCounts {
        let executors = self.executors.read().unwrap();
        let dispatchers = self.dispatchers.read().unwrap();

        let idle_executors = executors
            .iter()
            .filter(|c| c.status() == backhaul_connection::ConnectionStatus::Idle)
            .count();
        let idle_dispatchers = dispatchers
            .iter()
            .filter(|c| c.status() == backhaul_connection::ConnectionStatus::Idle)
            .count();
        let busy_dispatchers = dispatchers
            .iter()
            .filter(|c| c.status() == backhaul_connection::ConnectionStatus::Busy)
            .count();

        PoolCounts {
            executors: executors.len(),
            idle_executors,
            dispatchers: dispatchers.len(),
            idle_dispatchers,
            busy_dispatchers,
        }
    }

    /// Run replenishment and eviction on an adaptive timer until the pool
    /// shuts down. The interval doubles (bounded) after a failed cycle and
    /// resets after a fully successful one; an unauthorized credential
    /// stops the task and shuts the pool down.
    pub fn spawn_maintenance(self: &Arc<Self>, dialer: Arc<dyn Dialer>) {
        let pool = self.clone();
        let mut done = self.done_tx.subscribe();

        tokio::spawn(async move {
            let mut backoff = Backoff::new(
                pool.config.replenish_interval,
                pool.config.max_replenish_interval,
            );

            loop {
                let delay = match pool.replenish(dialer.as_ref()).await {
                    Ok(()) => {
                        backoff.reset();
                        backoff.current()
                    }
                    Err(err) if err.is_fatal() => {
                        error!(peer = %pool.peer, error = %err, "Credential rejected, stopping replenishment");
                        pool.shutdown().await;
                        return;
                    }
                    Err(err) => {
                        let delay = backoff.advance();
                        warn!(
                            peer = %pool.peer,
                            error = %err,
                            retry_in = ?delay,
                            "Replenishment failed, backing off"
                        );
                        delay
                    }
                };

                pool.evict().await;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = done.changed() => return,
                }
            }
        });
    }
}

impl PoolMembership for Pool {
    fn offer(&self, connection: Arc<DispatcherConnection>) {
        if self.is_shut_down() {
            return;
        }
        if self.idle_tx.try_send(connection).is_err() {
            debug!(peer = %self.peer, "Idle-offer queue full, dropping offer");
        }
    }

    fn remove(&self, id: Uuid) {
        self.dispatchers
            .write()
            .unwrap()
            .retain(|connection| connection.id() != id);
        self.executors
            .write()
            .unwrap()
            .retain(|connection| connection.id() != id);
    }
}

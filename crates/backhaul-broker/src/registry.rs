//! Registry of per-peer connection pools
//!
//! One pool per registered peer. Resolution and pool creation happen under
//! a single lock so two racing registrations can never create duplicate
//! pools. A periodic sweep shuts down pools that have been empty for at
//! least one sweep interval — a transient reconnect gap must not destroy
//! peer state prematurely.

use backhaul_connection::Transport;
use backhaul_pool::{Pool, PoolConfig};
use backhaul_proto::{Handshake, Role};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Registry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    pool_config: PoolConfig,
    /// Upstream client handed to executor connections bound here.
    http: reqwest::Client,
    done_tx: watch::Sender<bool>,
}

impl Registry {
    pub fn new(pool_config: PoolConfig, http: reqwest::Client) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            pool_config,
            http,
            done_tx,
        })
    }

    /// Bind a freshly handshaken tunnel connection into the pool of
    /// `peer_id`, creating the pool if this is the peer's first connection.
    pub fn register(&self, peer_id: &str, handshake: Handshake, transport: Arc<dyn Transport>) {
        let pool = {
            let mut pools = self.pools.write().unwrap();
            pools
                .entry(peer_id.to_string())
                .or_insert_with(|| {
                    info!(peer_id, "Creating pool for new peer");
                    Pool::new(peer_id, self.pool_config.clone(), self.http.clone())
                })
                .clone()
        };

        // The peer declares its desired idle size on every connection.
        pool.set_idle_target(handshake.idle_size);

        debug!(
            peer_id,
            role = ?handshake.role,
            idle_size = handshake.idle_size,
            "Registering tunnel connection"
        );

        match handshake.role {
            Role::Executor => {
                pool.add_executor(transport);
            }
            Role::Dispatcher => {
                pool.add_dispatcher(transport);
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Pool>> {
        self.pools.read().unwrap().get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        self.pools.read().unwrap().keys().cloned().collect()
    }

    /// True when the peer has any connection able to carry an exchange:
    /// a busy dispatcher counts, otherwise an idle one must answer a ping.
    /// The probed connection is released afterwards, not consumed.
    pub async fn peer_is_active(&self, peer_id: &str) -> bool {
        let Some(pool) = self.get(peer_id) else {
            return false;
        };

        if pool.counts().busy_dispatchers > 0 {
            return true;
        }

        let Ok(connection) = pool.acquire().await else {
            return false;
        };

        let alive = connection
            .send_ping(Duration::from_secs(15))
            .await
            .is_ok();
        if alive {
            connection.release();
        } else {
            warn!(peer_id, "Liveness probe failed");
            connection.close().await;
        }
        alive
    }

    /// Evict stale connections everywhere, then shut down and drop pools
    /// that ended up empty.
    pub async fn sweep(&self) {
        let pools: Vec<(String, Arc<Pool>)> = {
            let pools = self.pools.read().unwrap();
            pools
                .iter()
                .map(|(id, pool)| (id.clone(), pool.clone()))
                .collect()
        };

        for (_, pool) in &pools {
            pool.evict().await;
        }

        let mut emptied = Vec::new();
        {
            let mut map = self.pools.write().unwrap();
            for (peer_id, pool) in &pools {
                if pool.is_empty() {
                    map.remove(peer_id);
                    emptied.push((peer_id.clone(), pool.clone()));
                }
            }
        }

        for (peer_id, pool) in emptied {
            info!(%peer_id, "Removing empty pool");
            pool.shutdown().await;
        }
    }

    /// Run [`sweep`](Self::sweep) on an interval until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let registry = self.clone();
        let mut done = self.done_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => registry.sweep().await,
                    _ = done.changed() => return,
                }
            }
        });
    }

    /// Shut down every pool and forget them all.
    pub async fn shutdown(&self) {
        let _ = self.done_tx.send(true);
        let pools = std::mem::take(&mut *self.pools.write().unwrap());
        for pool in pools.into_values() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_connection::memory_pair;

    fn test_registry() -> Arc<Registry> {
        let config = PoolConfig {
            idle_target: 2,
            max_size: 4,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        Registry::new(config, reqwest::Client::new())
    }

    fn handshake(role: Role) -> Handshake {
        Handshake { idle_size: 2, role }
    }

    #[tokio::test]
    async fn test_register_creates_pool_once() {
        let registry = test_registry();

        let (near_a, _far_a) = memory_pair(8);
        let (near_b, _far_b) = memory_pair(8);
        registry.register("peer-a", handshake(Role::Dispatcher), Arc::new(near_a));
        registry.register("peer-a", handshake(Role::Executor), Arc::new(near_b));

        assert_eq!(registry.peers(), vec!["peer-a".to_string()]);

        let pool = registry.get("peer-a").unwrap();
        let counts = pool.counts();
        assert_eq!(counts.dispatchers, 1);
        assert_eq!(counts.executors, 1);
    }

    #[tokio::test]
    async fn test_handshake_updates_idle_target() {
        let registry = test_registry();

        let (near, _far) = memory_pair(8);
        registry.register(
            "peer-a",
            Handshake {
                idle_size: 7,
                role: Role::Dispatcher,
            },
            Arc::new(near),
        );

        assert_eq!(registry.get("peer-a").unwrap().idle_target(), 7);
    }

    #[tokio::test]
    async fn test_sweep_removes_empty_pools() {
        let registry = test_registry();

        let (near, _far) = memory_pair(8);
        registry.register("peer-a", handshake(Role::Dispatcher), Arc::new(near));

        let pool = registry.get("peer-a").unwrap();
        let connection = pool.acquire().await.unwrap();
        connection.close().await;
        assert!(pool.is_empty());

        registry.sweep().await;
        assert!(registry.get("peer-a").is_none());
        assert!(pool.is_shut_down());
    }

    #[tokio::test]
    async fn test_sweep_keeps_populated_pools() {
        let registry = test_registry();

        let (near, _far) = memory_pair(8);
        registry.register("peer-a", handshake(Role::Dispatcher), Arc::new(near));

        registry.sweep().await;
        assert!(registry.get("peer-a").is_some());
    }

    #[tokio::test]
    async fn test_peer_is_active_without_pool() {
        let registry = test_registry();
        assert!(!registry.peer_is_active("ghost").await);
    }

    #[tokio::test]
    async fn test_peer_is_active_probes_idle_connection() {
        let registry = test_registry();

        let (near, far) = memory_pair(8);
        registry.register("peer-a", handshake(Role::Dispatcher), Arc::new(near));

        // Answer the probe ping from the far end.
        let responder = tokio::spawn(async move {
            loop {
                match far.recv().await {
                    Ok(Some(backhaul_proto::Frame::Ping)) => {
                        far.send(backhaul_proto::Frame::Pong).await.unwrap();
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        });

        assert!(registry.peer_is_active("peer-a").await);

        // The probe released the connection; it is still acquirable.
        let pool = registry.get("peer-a").unwrap();
        assert!(pool.acquire().await.is_ok());

        responder.abort();
    }
}

//! Agent client: owns the pool of tunnel connections to the broker

use crate::auth::{AuthClient, CredentialProvider, TokenHandler};
use crate::config::AgentConfig;
use crate::dialer::BrokerDialer;
use backhaul_pool::Pool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Connects the agent to one broker and keeps the connection pool healthy.
pub struct Client {
    pool: Arc<Pool>,
    dialer: Arc<BrokerDialer>,
    token_handler: Option<Arc<TokenHandler>>,
    killed: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    idle_target: usize,
}

impl Client {
    pub fn new(config: &AgentConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        let http = reqwest::Client::new();
        let killed = Arc::new(AtomicBool::new(false));

        let pool_config = config.pool_config();
        let idle_target = pool_config.idle_target;
        let pool = Pool::new(config.broker_url.clone(), pool_config, http.clone());

        let dialer = Arc::new(BrokerDialer::new(
            config.broker_url.clone(),
            credentials.clone(),
            idle_target,
            killed.clone(),
        ));

        let token_handler = match (&config.login_url, &config.validate_url) {
            (Some(login_url), Some(validate_url)) => Some(Arc::new(TokenHandler::new(
                credentials,
                AuthClient::new(http, login_url.clone(), validate_url.clone()),
                killed.clone(),
            ))),
            _ => None,
        };

        Self {
            pool,
            dialer,
            token_handler,
            killed,
            ready: Arc::new(AtomicBool::new(false)),
            idle_target,
        }
    }

    /// Start pool maintenance, the readiness watcher and (when configured)
    /// the credential refresh task.
    pub fn start(&self) {
        info!(broker = %self.pool.peer(), "Connecting to broker");
        self.pool.spawn_maintenance(self.dialer.clone());

        if let Some(token_handler) = &self.token_handler {
            token_handler.spawn_refresh(TOKEN_REFRESH_INTERVAL);
        }

        // Latch readiness once the pool first reaches its idle target.
        let pool = self.pool.clone();
        let ready = self.ready.clone();
        let target = self.idle_target;
        tokio::spawn(async move {
            loop {
                if pool.is_shut_down() {
                    return;
                }
                if pool.counts().idle_dispatchers >= target {
                    info!("Agent pool reached idle target, ready");
                    ready.store(true, Ordering::SeqCst);
                    return;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        });
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

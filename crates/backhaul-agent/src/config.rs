//! Agent configuration

use crate::auth::{CredentialProvider, FileCredentials, StaticCredentials};
use anyhow::Context;
use backhaul_pool::PoolConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the broker's register endpoint.
    pub broker_url: String,
    /// Bind host for the local HTTP server.
    pub host: String,
    /// Bind port for the local HTTP server.
    pub port: u16,
    /// Number of idle tunnel connections to keep per role.
    pub pool_idle_size: usize,
    /// Hard cap on tunnel connections per role.
    pub pool_max_size: usize,
    /// How long `/request` waits for an idle tunnel connection, in
    /// milliseconds.
    pub timeout_ms: u64,
    /// Idle age beyond which surplus connections are evicted, in seconds.
    pub idle_timeout_secs: u64,
    /// Baseline interval between replenishment cycles, in seconds.
    pub replenish_interval_secs: u64,
    /// Peer credential, inline. Prefer `secret_env` or `secret_file`.
    pub secret: Option<String>,
    /// Name of an environment variable holding the peer credential.
    pub secret_env: Option<String>,
    /// Path of a file holding the peer credential (e.g. a mounted secret).
    pub secret_file: Option<PathBuf>,
    /// Login endpoint of the authorization service.
    pub login_url: Option<String>,
    /// Credential validation endpoint of the authorization service.
    pub validate_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080/register".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8081,
            pool_idle_size: 10,
            pool_max_size: 100,
            timeout_ms: 1000,
            idle_timeout_secs: 300,
            replenish_interval_secs: 30,
            secret: None,
            secret_env: None,
            secret_file: None,
            login_url: None,
            validate_url: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            idle_target: self.pool_idle_size,
            max_size: self.pool_max_size,
            acquire_timeout: Duration::from_millis(self.timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            replenish_interval: Duration::from_secs(self.replenish_interval_secs),
            ..PoolConfig::default()
        }
    }

    /// Resolve the credential source: inline value, then environment
    /// variable, then file.
    pub fn credentials(&self) -> anyhow::Result<Arc<dyn CredentialProvider>> {
        if let Some(secret) = &self.secret {
            return Ok(Arc::new(StaticCredentials::new(secret.clone())));
        }
        if let Some(env_var) = &self.secret_env {
            let secret = std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?;
            return Ok(Arc::new(StaticCredentials::new(secret)));
        }
        if let Some(path) = &self.secret_file {
            return Ok(Arc::new(FileCredentials::new(path.clone())));
        }
        anyhow::bail!("No credential configured (set secret, secret_env or secret_file)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.addr(), "127.0.0.1:8081");
        assert_eq!(config.pool_config().idle_target, 10);
        assert!(config.credentials().is_err());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config: AgentConfig = serde_yaml::from_str(
            r#"
broker_url: wss://broker.example.com/register
pool_idle_size: 4
pool_max_size: 8
secret: cluster-key
"#,
        )
        .unwrap();

        assert_eq!(config.broker_url, "wss://broker.example.com/register");
        assert_eq!(config.pool_config().idle_target, 4);
        assert_eq!(config.pool_config().max_size, 8);
        assert!(config.credentials().is_ok());
    }

    #[test]
    fn test_inline_secret_takes_precedence() {
        let config = AgentConfig {
            secret: Some("inline".to_string()),
            secret_env: Some("UNSET_VARIABLE_FOR_TEST".to_string()),
            ..AgentConfig::default()
        };
        assert!(config.credentials().is_ok());
    }
}

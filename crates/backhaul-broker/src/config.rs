//! Broker configuration

use backhaul_pool::PoolConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bind host for the HTTP server.
    pub host: String,
    /// Bind port for the HTTP server.
    pub port: u16,
    /// How long `/request` waits for an idle tunnel connection, in
    /// milliseconds.
    pub timeout_ms: u64,
    /// Idle age beyond which surplus connections are evicted, in seconds.
    pub idle_timeout_secs: u64,
    /// Interval of the empty-pool sweep, in seconds.
    pub sweep_interval_secs: u64,
    /// Hard cap on connections per role per peer.
    pub pool_max_size: usize,
    /// URL of the credential validation endpoint. When unset, the broker
    /// falls back to the static key table.
    pub validate_url: Option<String>,
    /// Static credential → peer-id table for development setups.
    pub static_peers: std::collections::HashMap<String, String>,
    /// Optional status reporting to an external control plane.
    pub report_url: Option<String>,
    /// Status reporting interval, in seconds.
    pub report_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout_ms: 1000,
            idle_timeout_secs: 300,
            sweep_interval_secs: 15,
            pool_max_size: 100,
            validate_url: None,
            static_peers: Default::default(),
            report_url: None,
            report_interval_secs: 60,
        }
    }
}

impl BrokerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    /// Pool knobs for peers registering here. The idle target is
    /// overwritten per peer by its handshake; the rest apply to everyone.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max_size,
            acquire_timeout: Duration::from_millis(self.timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ..PoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.pool_config().max_size, 100);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config: BrokerConfig = serde_yaml::from_str(
            r#"
port: 9090
timeout_ms: 250
static_peers:
  key-1: peer-a
"#,
        )
        .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(
            config.pool_config().acquire_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.static_peers.get("key-1").unwrap(), "peer-a");
    }
}

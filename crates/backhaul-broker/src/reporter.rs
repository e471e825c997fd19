//! Periodic connection-status reporting to an external control plane

use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One peer's connectivity as reported to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: String,
    pub is_active: bool,
}

/// Pushes the activity of every registered peer to a configured URL on an
/// interval. Activity checks ride the liveness probe in
/// [`Registry::peer_is_active`], so an idle connection is pinged but never
/// consumed for an exchange.
pub struct StatusReporter {
    registry: Arc<Registry>,
    http: reqwest::Client,
    url: String,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<Registry>,
        http: reqwest::Client,
        url: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            http,
            url: url.into(),
            interval,
        }
    }

    /// Gather one snapshot of peer statuses.
    pub async fn snapshot(&self) -> Vec<PeerStatus> {
        let mut statuses = Vec::new();
        for peer_id in self.registry.peers() {
            let is_active = self.registry.peer_is_active(&peer_id).await;
            statuses.push(PeerStatus { peer_id, is_active });
        }
        statuses
    }

    async fn push(&self, statuses: &[PeerStatus]) {
        match self.http.post(&self.url).json(statuses).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(count = statuses.len(), "Reported peer statuses");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Status report rejected");
            }
            Err(err) => {
                warn!(error = %err, "Unable to push status report");
            }
        }
    }

    /// Report forever on the configured interval.
    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let statuses = self.snapshot().await;
                if !statuses.is_empty() {
                    self.push(&statuses).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_status_wire_names() {
        let status = PeerStatus {
            peer_id: "peer-a".to_string(),
            is_active: true,
        };
        let encoded = serde_json::to_string(&status).unwrap();
        assert_eq!(encoded, r#"{"peerId":"peer-a","isActive":true}"#);
    }
}

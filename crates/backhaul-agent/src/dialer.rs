//! Dialing tunnel connections to the broker

use crate::auth::CredentialProvider;
use async_trait::async_trait;
use backhaul_connection::{Transport, WsClientTransport};
use backhaul_pool::{DialError, Dialer};
use backhaul_proto::{Frame, Handshake, Role, PEER_KEY_HEADER, UNAUTHORIZED_PEER_STATUS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};

/// Opens outbound WebSocket connections to the broker's `/register`
/// endpoint, attaching the peer credential and sending the handshake.
pub struct BrokerDialer {
    url: String,
    credentials: Arc<dyn CredentialProvider>,
    idle_size: usize,
    killed: Arc<AtomicBool>,
}

impl BrokerDialer {
    pub fn new(
        url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        idle_size: usize,
        killed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url: url.into(),
            credentials,
            idle_size,
            killed,
        }
    }
}

#[async_trait]
impl Dialer for BrokerDialer {
    async fn dial(&self, role: Role) -> Result<Arc<dyn Transport>, DialError> {
        // A killed credential never redials; the flag only resets with the
        // process.
        if self.killed.load(Ordering::SeqCst) {
            return Err(DialError::Unauthorized);
        }

        let secret = self
            .credentials
            .secret()
            .await
            .map_err(|err| DialError::Connect(err.to_string()))?;

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| DialError::Connect(format!("invalid broker url: {err}")))?;
        request.headers_mut().insert(
            PEER_KEY_HEADER,
            HeaderValue::from_str(&secret)
                .map_err(|err| DialError::Connect(format!("invalid credential: {err}")))?,
        );

        debug!(url = %self.url, ?role, "Dialing broker");

        let (ws, _response) = match connect_async(request).await {
            Ok(established) => established,
            Err(WsError::Http(response))
                if response.status().as_u16() == UNAUTHORIZED_PEER_STATUS =>
            {
                warn!("Broker rejected credential, ceasing reconnection attempts");
                self.killed.store(true, Ordering::SeqCst);
                return Err(DialError::Unauthorized);
            }
            Err(err) => return Err(DialError::Connect(err.to_string())),
        };

        let transport = WsClientTransport::new(ws);

        // The handshake names the role the broker binds, which is the
        // complement of the role this side keeps.
        let handshake = Handshake {
            idle_size: self.idle_size,
            role: role.complement(),
        };
        transport.send(Frame::Text(handshake.to_string())).await?;

        Ok(Arc::new(transport))
    }
}

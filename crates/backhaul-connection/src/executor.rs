//! Executor connections: receive forwarded requests and run them locally
//!
//! The serve loop alternates Idle/Busy on its own: read a head frame, read
//! the body frame, execute against the upstream HTTP client, write the
//! response head and body back. Upstream failures become structured error
//! responses and the connection stays usable; decode or transport failures
//! terminate the loop.

use crate::connection::{ConnectionState, ConnectionStatus, PoolMembership};
use crate::transport::Transport;
use backhaul_proto::{Frame, RequestHead, ResponseHead};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
enum UpstreamError {
    #[error("invalid request method: {0}")]
    InvalidMethod(String),

    #[error("unable to execute request: {0}")]
    Execute(#[from] reqwest::Error),
}

/// A tunnel connection that executes forwarded requests against a local
/// upstream.
pub struct ExecutorConnection {
    id: Uuid,
    state: ConnectionState,
    transport: Arc<dyn Transport>,
    http: reqwest::Client,
    closed_tx: watch::Sender<bool>,
    home: Weak<dyn PoolMembership>,
}

impl std::fmt::Debug for ExecutorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConnection")
            .field("id", &self.id)
            .field("status", &self.state.status())
            .finish()
    }
}

impl ExecutorConnection {
    /// Wrap an established transport and start the serve loop plus the
    /// keepalive task.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        http: reqwest::Client,
        home: Weak<dyn PoolMembership>,
        keepalive: Duration,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            state: ConnectionState::new(),
            transport,
            http,
            closed_tx,
            home,
        });

        tokio::spawn(connection.clone().serve(closed_rx.clone()));
        tokio::spawn(connection.clone().keepalive(keepalive, closed_rx));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// True when the connection is Idle and has been idle strictly longer
    /// than `timeout`.
    pub fn idle_longer_than(&self, timeout: Duration) -> bool {
        self.state.idle_longer_than(timeout)
    }

    /// Close the connection: terminal status, transport closed, removed
    /// from the owning pool. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        if !self.state.transition_closed() {
            return;
        }

        debug!(connection_id = %self.id, "Closing executor connection");
        let _ = self.closed_tx.send(true);
        self.transport.close().await;

        if let Some(home) = self.home.upgrade() {
            home.remove(self.id);
        }
    }

    async fn serve(self: Arc<Self>, mut closed: watch::Receiver<bool>) {
        debug!(connection_id = %self.id, "Executor connection starting");

        loop {
            self.state.mark_idle();

            let frame = tokio::select! {
                frame = self.transport.recv() => frame,
                _ = closed.changed() => break,
            };

            let head_text = match frame {
                Ok(Some(Frame::Ping)) => {
                    if self.transport.send(Frame::Pong).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(Some(Frame::Pong)) => continue,
                Ok(Some(Frame::Close)) | Ok(None) => break,
                Err(err) => {
                    debug!(connection_id = %self.id, error = %err, "Executor read failed");
                    break;
                }
                Ok(Some(Frame::Text(text))) => text,
                Ok(Some(Frame::Binary(_))) => {
                    warn!(connection_id = %self.id, "Body frame with no request head, closing");
                    break;
                }
            };

            self.state.mark_busy();

            let head = match RequestHead::decode(&head_text) {
                Ok(head) => head,
                Err(err) => {
                    let _ = self
                        .send_error(&format!("unable to decode request head: {err}"))
                        .await;
                    break;
                }
            };

            let body = match self.transport.recv().await {
                Ok(Some(Frame::Binary(body))) => body,
                _ => {
                    warn!(connection_id = %self.id, "Missing request body frame, closing");
                    break;
                }
            };

            debug!(method = %head.method, url = %head.url, "Executing forwarded request");

            match self.execute(&head, body).await {
                Ok((response_head, response_body)) => {
                    let encoded = match response_head.encode() {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            let _ = self
                                .send_error(&format!("unable to serialize response: {err}"))
                                .await;
                            break;
                        }
                    };
                    if self.transport.send(Frame::Text(encoded)).await.is_err() {
                        break;
                    }
                    if self
                        .transport
                        .send(Frame::Binary(response_body))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    // The tunnel is fine; only the upstream hop failed.
                    if self.send_error(&err.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(connection_id = %self.id, "Executor connection ending");
        self.close().await;
    }

    /// Run one forwarded request against the local upstream.
    async fn execute(
        &self,
        head: &RequestHead,
        body: Bytes,
    ) -> Result<(ResponseHead, Bytes), UpstreamError> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|_| UpstreamError::InvalidMethod(head.method.clone()))?;

        let mut builder = self.http.request(method, head.url.as_str());
        for (name, value) in &head.headers {
            // The url decides the host; a stale host header would fight it.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(body).send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = response.bytes().await?;

        Ok((
            ResponseHead {
                status,
                headers,
                content_length: body.len() as i64,
            },
            body,
        ))
    }

    /// Report an execution failure back through the tunnel as a structured
    /// response so the dispatcher gets a diagnosable error instead of a
    /// silent disconnect.
    async fn send_error(&self, message: &str) -> Result<(), crate::TransportError> {
        warn!(connection_id = %self.id, message, "Reporting executor error to peer");

        let (head, body) = ResponseHead::upstream_error(message);
        let encoded = head
            .encode()
            .map_err(|err| crate::TransportError::Protocol(err.to_string()))?;

        self.transport.send(Frame::Text(encoded)).await?;
        self.transport.send(Frame::Binary(body)).await?;
        Ok(())
    }

    async fn keepalive(self: Arc<Self>, interval: Duration, mut closed: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.transport.send(Frame::Ping).await.is_err() {
                        debug!(connection_id = %self.id, "Keepalive ping failed, closing");
                        self.close().await;
                        return;
                    }
                }
                _ = closed.changed() => return,
            }
        }
    }
}

//! Dispatcher connections and the exchange multiplexer
//!
//! A single duplex transport permits only one concurrent frame reader, so
//! every dispatcher connection runs one background listener task that owns
//! the receive side. An exchange claims the next inbound frame by posting a
//! fresh single-use slot into the connection's handoff channel; the
//! listener forwards the frame into the oldest pending slot. One exchange
//! performs exactly two handoffs, head then body, in that order.

use crate::connection::{ConnectionError, ConnectionState, ConnectionStatus, PoolMembership};
use crate::transport::Transport;
use backhaul_proto::{Frame, ProtocolError, RequestHead, ResponseHead};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// A serialized HTTP request ready to travel through the tunnel.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub head: RequestHead,
    pub body: Bytes,
}

/// The decoded result of one exchange.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub head: ResponseHead,
    pub body: Bytes,
}

type ResponseSlot = oneshot::Sender<Frame>;

/// A tunnel connection that originates exchanges.
///
/// At most one exchange is in flight at a time, enforced by [`take`]:
/// callers must win the Idle→Busy transition before calling
/// [`proxy_request`], and either release (success) or close (failure) the
/// connection afterwards.
///
/// [`take`]: DispatcherConnection::take
/// [`proxy_request`]: DispatcherConnection::proxy_request
pub struct DispatcherConnection {
    id: Uuid,
    state: ConnectionState,
    transport: Arc<dyn Transport>,
    slot_tx: mpsc::Sender<ResponseSlot>,
    closed_tx: watch::Sender<bool>,
    pong: Notify,
    home: Weak<dyn PoolMembership>,
}

impl std::fmt::Debug for DispatcherConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConnection")
            .field("id", &self.id)
            .field("status", &self.state.status())
            .finish()
    }
}

impl DispatcherConnection {
    /// Wrap an established transport and start the listener task. The
    /// connection starts in Connecting; the owning pool makes it available
    /// with [`release`](Self::release).
    pub fn spawn(
        transport: Arc<dyn Transport>,
        home: Weak<dyn PoolMembership>,
    ) -> Arc<Self> {
        let (slot_tx, slot_rx) = mpsc::channel(2);
        let (closed_tx, closed_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            state: ConnectionState::new(),
            transport,
            slot_tx,
            closed_tx,
            pong: Notify::new(),
            home,
        });

        tokio::spawn(connection.clone().listen(slot_rx, closed_rx));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    /// Claim this connection for one exchange. Succeeds only from Idle.
    pub fn take(&self) -> bool {
        self.state.take()
    }

    /// Hand the connection back after a completed exchange and re-offer it
    /// to the owning pool. No-op once closed.
    pub fn release(self: &Arc<Self>) {
        if self.state.mark_idle() {
            if let Some(home) = self.home.upgrade() {
                home.offer(self.clone());
            }
        }
    }

    /// True when the connection is Idle and has been idle strictly longer
    /// than `timeout`.
    pub fn idle_longer_than(&self, timeout: Duration) -> bool {
        self.state.idle_longer_than(timeout)
    }

    /// Drive one HTTP round trip over this connection. The caller must have
    /// won [`take`](Self::take) first. On success the connection releases
    /// itself back to the pool; on error the caller must [`close`](Self::close)
    /// it — partial protocol state cannot be trusted for reuse.
    pub async fn proxy_request(
        self: &Arc<Self>,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ConnectionError> {
        let head = request.head.encode().map_err(ProtocolError::from)?;
        self.transport.send(Frame::Text(head)).await?;
        self.transport.send(Frame::Binary(request.body)).await?;

        let head_frame = self.await_response_frame().await?;
        let head = ResponseHead::decode(&head_frame.into_text()?).map_err(ProtocolError::from)?;

        let body_frame = self.await_response_frame().await?;
        let body = body_frame.into_binary()?;

        self.release();

        Ok(ProxyResponse { head, body })
    }

    /// Liveness probe: send a ping and wait for the pong. The caller must
    /// hold the connection via [`take`](Self::take) and release it after;
    /// the probe does not consume the connection for an HTTP exchange.
    pub async fn send_ping(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.transport.send(Frame::Ping).await?;

        tokio::time::timeout(timeout, notified)
            .await
            .map_err(|_| ConnectionError::PongTimeout)
    }

    /// Close the connection: terminal status, transport closed, removed
    /// from the owning pool. Idempotent; also unblocks any exchange waiting
    /// on a response slot.
    pub async fn close(self: &Arc<Self>) {
        if !self.state.transition_closed() {
            return;
        }

        debug!(connection_id = %self.id, "Closing dispatcher connection");
        let _ = self.closed_tx.send(true);
        self.transport.close().await;

        if let Some(home) = self.home.upgrade() {
            home.remove(self.id);
        }
    }

    /// Post a single-use slot and wait for the listener to fulfill it with
    /// the next inbound frame.
    async fn await_response_frame(&self) -> Result<Frame, ConnectionError> {
        let (slot, pending) = oneshot::channel();
        self.slot_tx
            .send(slot)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        pending.await.map_err(|_| ConnectionError::Closed)
    }

    /// Background listener: the only reader of the transport. Forwards
    /// exchange frames into pending slots, answers pings, wakes pong
    /// waiters, and closes the connection on any protocol violation.
    async fn listen(
        self: Arc<Self>,
        mut slots: mpsc::Receiver<ResponseSlot>,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = self.transport.recv() => frame,
                _ = closed.changed() => break,
            };

            let frame = match frame {
                Ok(Some(Frame::Ping)) => {
                    if self.transport.send(Frame::Pong).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(Some(Frame::Pong)) => {
                    self.pong.notify_waiters();
                    continue;
                }
                Ok(Some(Frame::Close)) | Ok(None) => break,
                Err(err) => {
                    debug!(connection_id = %self.id, error = %err, "Listener read failed");
                    break;
                }
                Ok(Some(frame)) => frame,
            };

            // A data frame with no exchange in flight is a protocol
            // violation; the connection cannot be trusted any further.
            if self.state.status() != ConnectionStatus::Busy {
                warn!(connection_id = %self.id, "Frame received while not busy, closing");
                break;
            }

            let slot = tokio::select! {
                slot = slots.recv() => slot,
                _ = closed.changed() => break,
            };

            match slot {
                Some(slot) => {
                    // A dropped receiver means the exchange aborted; the
                    // frame sequence is now out of step.
                    if slot.send(frame).is_err() {
                        warn!(connection_id = %self.id, "Exchange abandoned its slot, closing");
                        break;
                    }
                }
                None => break,
            }
        }

        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, MemoryTransport};
    use std::sync::Mutex;

    /// Pool stand-in recording offers and removals.
    #[derive(Default)]
    struct RecordingPool {
        offered: Mutex<Vec<Uuid>>,
        removed: Mutex<Vec<Uuid>>,
    }

    impl PoolMembership for RecordingPool {
        fn offer(&self, connection: Arc<DispatcherConnection>) {
            self.offered.lock().unwrap().push(connection.id());
        }

        fn remove(&self, id: Uuid) {
            self.removed.lock().unwrap().push(id);
        }
    }

    fn spawn_with_pool(
        transport: MemoryTransport,
    ) -> (Arc<DispatcherConnection>, Arc<RecordingPool>) {
        let pool = Arc::new(RecordingPool::default());
        let home: Weak<dyn PoolMembership> =
            Arc::downgrade(&pool) as Weak<dyn PoolMembership>;
        let connection = DispatcherConnection::spawn(Arc::new(transport), home);
        (connection, pool)
    }

    fn request() -> ProxyRequest {
        ProxyRequest {
            head: RequestHead {
                method: "GET".to_string(),
                url: "http://localhost:9000/hello".to_string(),
                headers: vec![("accept".to_string(), "*/*".to_string())],
                content_length: 0,
            },
            body: Bytes::new(),
        }
    }

    /// Serve exactly one scripted exchange on the far end of the transport,
    /// handing back what actually arrived over the wire.
    async fn answer_one_exchange(
        peer: MemoryTransport,
        status: u16,
        body: &'static [u8],
    ) -> (RequestHead, Bytes) {
        let head = peer.recv().await.unwrap().unwrap();
        let head = RequestHead::decode(&head.into_text().unwrap()).unwrap();
        let request_body = peer.recv().await.unwrap().unwrap().into_binary().unwrap();

        let response = ResponseHead {
            status,
            headers: vec![("x-served-by".to_string(), "test".to_string())],
            content_length: body.len() as i64,
        };
        peer.send(Frame::Text(response.encode().unwrap()))
            .await
            .unwrap();
        peer.send(Frame::Binary(Bytes::from_static(body)))
            .await
            .unwrap();

        (head, request_body)
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (near, far) = memory_pair(8);
        let (connection, pool) = spawn_with_pool(near);
        connection.release();

        let server = tokio::spawn(answer_one_exchange(far, 200, b"hello back"));

        assert!(connection.take());
        let response = connection.proxy_request(request()).await.unwrap();

        assert_eq!(response.head.status, 200);
        assert_eq!(response.head.headers[0].1, "test");
        assert_eq!(&response.body[..], b"hello back");
        assert_eq!(connection.status(), ConnectionStatus::Idle);

        // release + post-exchange release
        assert_eq!(pool.offered.lock().unwrap().len(), 2);

        // The request arrived on the far end exactly as sent.
        let (arrived_head, arrived_body) = server.await.unwrap();
        assert_eq!(arrived_head, request().head);
        assert!(arrived_body.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_preserved() {
        let (near, far) = memory_pair(8);
        let (connection, _pool) = spawn_with_pool(near);
        connection.release();

        let server = tokio::spawn(answer_one_exchange(far, 500, b"boom"));

        assert!(connection.take());
        let response = connection.proxy_request(request()).await.unwrap();
        assert_eq!(response.head.status, 500);
        assert_eq!(&response.body[..], b"boom");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_take_is_exclusive() {
        let (near, _far) = memory_pair(8);
        let (connection, _pool) = spawn_with_pool(near);
        connection.release();

        assert!(connection.take());
        assert!(!connection.take());
        connection.release();
        assert!(connection.take());
    }

    #[tokio::test]
    async fn test_mid_exchange_close_surfaces_error_and_removes() {
        let (near, far) = memory_pair(8);
        let (connection, pool) = spawn_with_pool(near);
        connection.release();

        let id = connection.id();
        let server = tokio::spawn(async move {
            // Read the request, then die before answering.
            far.recv().await.unwrap();
            far.recv().await.unwrap();
            far.close().await;
        });

        assert!(connection.take());
        let err = connection.proxy_request(request()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
        server.await.unwrap();

        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert!(pool.removed.lock().unwrap().contains(&id));
        // A closed connection is never offered again.
        assert!(!connection.take());
    }

    #[tokio::test]
    async fn test_unexpected_frame_closes_connection() {
        let (near, far) = memory_pair(8);
        let (connection, pool) = spawn_with_pool(near);
        connection.release();

        // Connection is Idle; an unsolicited data frame is a violation.
        far.send(Frame::Text("surprise".to_string())).await.unwrap();

        // Wait for the listener to react.
        for _ in 0..50 {
            if connection.status() == ConnectionStatus::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert_eq!(pool.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (near, _far) = memory_pair(8);
        let (connection, pool) = spawn_with_pool(near);
        connection.release();

        connection.close().await;
        connection.close().await;
        connection.close().await;

        assert_eq!(pool.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (near, far) = memory_pair(8);
        let (connection, _pool) = spawn_with_pool(near);
        connection.release();

        let server = tokio::spawn(async move {
            assert_eq!(far.recv().await.unwrap(), Some(Frame::Ping));
            far.send(Frame::Pong).await.unwrap();
        });

        assert!(connection.take());
        connection
            .send_ping(Duration::from_secs(1))
            .await
            .unwrap();
        connection.release();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_byte_body_round_trip() {
        let (near, far) = memory_pair(8);
        let (connection, _pool) = spawn_with_pool(near);
        connection.release();

        let server = tokio::spawn(answer_one_exchange(far, 200, b"z"));

        let mut tiny = request();
        tiny.head.method = "POST".to_string();
        tiny.head.content_length = 1;
        tiny.body = Bytes::from_static(b"q");

        assert!(connection.take());
        let response = connection.proxy_request(tiny).await.unwrap();
        assert_eq!(&response.body[..], b"z");

        let (_, arrived_body) = server.await.unwrap();
        assert_eq!(&arrived_body[..], b"q");
    }

    #[tokio::test]
    async fn test_large_body_round_trip() {
        let (near, far) = memory_pair(8);
        let (connection, _pool) = spawn_with_pool(near);
        connection.release();

        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            far.recv().await.unwrap();
            let body = far.recv().await.unwrap().unwrap().into_binary().unwrap();

            let response = ResponseHead {
                status: 200,
                headers: Vec::new(),
                content_length: body.len() as i64,
            };
            far.send(Frame::Text(response.encode().unwrap()))
                .await
                .unwrap();
            far.send(Frame::Binary(body)).await.unwrap();
        });

        let mut echo = request();
        echo.head.method = "POST".to_string();
        echo.head.content_length = payload.len() as i64;
        echo.body = Bytes::from(payload);

        assert!(connection.take());
        let response = connection.proxy_request(echo).await.unwrap();
        assert_eq!(response.body.len(), expected.len());
        assert_eq!(&response.body[..], &expected[..]);
        server.await.unwrap();
    }
}

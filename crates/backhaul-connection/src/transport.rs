//! Transport trait for tunnel connections

use async_trait::async_trait;
use backhaul_proto::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One duplex, message-oriented transport carrying tunnel frames.
///
/// `recv` has a single logical consumer (the connection's listener task);
/// `send` may be called from any task. `Ok(None)` from `recv` means the
/// peer closed cleanly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame through the transport
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame from the transport
    async fn recv(&self) -> Result<Option<Frame>, TransportError>;

    /// Close the transport; idempotent
    async fn close(&self);
}

/// In-process transport over a pair of bounded channels.
///
/// Used by tests and by anything that wants to exercise the exchange
/// protocol without a socket.
pub struct MemoryTransport {
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
}

/// Create two connected in-process transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = MemoryTransport {
        tx: a_tx,
        rx: Mutex::new(a_rx),
        closed: AtomicBool::new(false),
    };
    let b = MemoryTransport {
        tx: b_tx,
        rx: Mutex::new(b_rx),
        closed: AtomicBool::new(false),
    };
    (a, b)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Frame::Close) | None => Ok(None),
            Some(frame) => Ok(Some(frame)),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Wake the peer's listener; ignore a full or dropped channel.
            let _ = self.tx.try_send(Frame::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (a, b) = memory_pair(4);

        a.send(Frame::Text("head".to_string())).await.unwrap();
        a.send(Frame::Binary(Bytes::from_static(b"body")))
            .await
            .unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(Frame::Text("head".into())));
        assert_eq!(
            b.recv().await.unwrap(),
            Some(Frame::Binary(Bytes::from_static(b"body")))
        );
    }

    #[tokio::test]
    async fn test_close_unblocks_peer_recv() {
        let (a, b) = memory_pair(4);

        let reader = tokio::spawn(async move { b.recv().await });
        a.close().await;

        let received = reader.await.unwrap().unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = memory_pair(4);
        a.close().await;

        let err = a.send(Frame::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_recv_after_close_returns_none() {
        let (a, b) = memory_pair(4);
        b.send(Frame::Ping).await.unwrap();
        a.close().await;

        assert_eq!(a.recv().await.unwrap(), None);
    }
}

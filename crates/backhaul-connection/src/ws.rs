//! WebSocket transport for outbound tunnel connections

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use backhaul_proto::Frame;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound (dialing side) WebSocket transport.
///
/// The sink and stream halves carry independent locks so the listener task
/// can block in `recv` while another task sends.
pub struct WsClientTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
}

impl WsClientTransport {
    /// Wrap an established client WebSocket stream.
    pub fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(body) => Message::Binary(body.to_vec()),
            Frame::Ping => Message::Ping(Vec::new()),
            Frame::Pong => Message::Pong(Vec::new()),
            Frame::Close => Message::Close(None),
        };

        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let message = self.stream.lock().await.next().await;
            match message {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(Message::Binary(body))) => {
                    return Ok(Some(Frame::Binary(Bytes::from(body))))
                }
                // tungstenite answers pings on its own
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Pong(_))) => return Ok(Some(Frame::Pong)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(err)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    return Err(TransportError::WebSocket(err.to_string()));
                }
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.sink.lock().await.send(Message::Close(None)).await;
        }
    }
}

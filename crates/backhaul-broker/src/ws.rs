//! WebSocket transport for inbound (upgraded) tunnel connections

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use backhaul_connection::{Transport, TransportError};
use backhaul_proto::Frame;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Inbound (accepting side) WebSocket transport over an upgraded socket.
pub struct WsServerTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WsServerTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for WsServerTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(body) => Message::Binary(body),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Pong => Message::Pong(Bytes::new()),
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
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Frame::Text(text.as_str().to_string())))
                }
                Some(Ok(Message::Binary(body))) => return Ok(Some(Frame::Binary(body))),
                // axum answers pings on its own
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Pong(_))) => return Ok(Some(Frame::Pong)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
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

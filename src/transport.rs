//! Transport abstraction between the connection task and the wire.
//!
//! [`WsConnector`] is the production implementation on top of
//! tokio-tungstenite; tests plug in scripted transports through the same
//! [`Connector`] seam.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::{Result, SessionError};

/// Close code for an orderly, requested shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

/// What the connection task sees from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Close frame with its code, if the peer sent one.
    Close(Option<u16>),
}

/// One open, bidirectional connection.
///
/// `recv` must be cancel-safe: the connection task polls it inside `select!`.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, text: String) -> Result<()>;

    /// `None` means the stream ended without a close frame.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self, code: u16) -> Result<()>;
}

/// Opens transports for a given address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        Ok(Box::new(WsTransport { ws }))
    }
}

pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    return Some(Ok(Frame::Close(frame.map(|f| u16::from(f.code)))));
                }
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => debug!("[WS] Ignoring non-UTF-8 binary frame"),
                },
                // Control frames are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(SessionError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        self.ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: String::new().into(),
            }))
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))
    }
}

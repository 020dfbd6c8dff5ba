//! In-memory stand-in for the server side of a WebSocket.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_session::config::SessionConfig;
use arena_session::connection::Connection;
use arena_session::error::{Result, SessionError};
use arena_session::transport::{Connector, Frame, Transport};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub const SERVER: &str = "ws://arena.test";

/// What the client wrote to the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(Value),
    Close(u16),
}

impl Sent {
    pub fn kind(&self) -> Option<&str> {
        match self {
            Sent::Text(value) => value.get("type").and_then(Value::as_str),
            Sent::Close(_) => None,
        }
    }
}

pub struct FakeConnector {
    refuse: AtomicBool,
    broken_writes: AtomicBool,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, Peers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            refuse: AtomicBool::new(false),
            broken_writes: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            peers: tx,
        });
        (connector, Peers { rx })
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Accept connections whose writes fail straight away.
    pub fn break_writes(&self, broken: bool) {
        self.broken_writes.store(broken, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Connection("connection refused".to_string()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        if self.broken_writes.load(Ordering::SeqCst) {
            drop(from_client);
            return Ok(Box::new(FakeTransport { incoming, outgoing }));
        }
        let _ = self.peers.send(Peer {
            url: url.to_string(),
            to_client,
            from_client,
        });
        Ok(Box::new(FakeTransport { incoming, outgoing }))
    }
}

struct FakeTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        let value = serde_json::from_str(&text)?;
        self.outgoing
            .send(Sent::Text(value))
            .map_err(|_| SessionError::Connection("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let _ = self.outgoing.send(Sent::Close(code));
        Ok(())
    }
}

/// Accepted connections, in order.
pub struct Peers {
    rx: mpsc::UnboundedReceiver<Peer>,
}

impl Peers {
    pub async fn next(&mut self) -> Peer {
        self.rx.recv().await.expect("connector dropped")
    }
}

/// Server end of one accepted connection.
pub struct Peer {
    pub url: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl Peer {
    pub fn send(&self, frame: Value) {
        self.to_client.send(Frame::Text(frame.to_string())).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.to_client.send(Frame::Text(text.to_string())).unwrap();
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(Frame::Close(code));
    }

    /// Next thing the client wrote. `None` once the client dropped the transport.
    pub async fn recv(&mut self) -> Option<Sent> {
        self.from_client.recv().await
    }

    /// Next text frame of the given type, skipping heartbeat pings.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            match self.recv().await {
                Some(Sent::Text(value)) if value["type"] == "ping" && kind != "ping" => continue,
                Some(Sent::Text(value)) => {
                    assert_eq!(value["type"], kind, "unexpected frame {value}");
                    return value;
                }
                other => panic!("expected {kind}, got {other:?}"),
            }
        }
    }

    /// Everything written so far without waiting.
    pub fn drain(&mut self) -> Vec<Sent> {
        let mut sent = Vec::new();
        while let Ok(item) = self.from_client.try_recv() {
            sent.push(item);
        }
        sent
    }
}

pub fn config() -> SessionConfig {
    SessionConfig::new(SERVER)
}

pub fn connection(connector: &Arc<FakeConnector>) -> Connection {
    Connection::with_connector(config(), connector.clone())
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

//! Abstract transport channels.
//!
//! The client core never touches sockets. It runs over a [`FrameChannel`]
//! (full-duplex binary messages, one frame per message) obtained from a
//! [`FrameChannelFactory`], and falls back to an [`HttpChannel`] for plain
//! request/response exchanges. Hosts plug in real WebSocket and HTTP
//! implementations; tests use the in-memory [`duplex_pair`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::TransportError;

/// A full-duplex binary frame channel.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Send one binary message.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the next binary message; `None` once the peer closed.
    async fn recv(&self) -> Option<Bytes>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Mints frame channels, once per (re)connection attempt.
#[async_trait]
pub trait FrameChannelFactory: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameChannel>, TransportError>;
}

/// One HTTP exchange as the fallback path sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A one-shot HTTP GET channel.
#[async_trait]
pub trait HttpChannel: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// In-memory frame channel backed by a pair of mpsc queues.
pub struct DuplexChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Two connected [`DuplexChannel`] ends.
pub fn duplex_pair() -> (DuplexChannel, DuplexChannel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        DuplexChannel {
            tx: a_tx,
            rx: Mutex::new(b_rx),
        },
        DuplexChannel {
            tx: b_tx,
            rx: Mutex::new(a_rx),
        },
    )
}

#[async_trait]
impl FrameChannel for DuplexChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.rx.lock().await.close();
    }
}

//! Transport abstraction consumed by the peer.
//!
//! Implementations:
//! - WebSocket: one protocol frame per WebSocket message
//! - TCP: length-prefixed frames over a byte stream (see [`crate::framing`])
//! - [`MemoryTransport`]: records frames in memory, for tests
//!
//! Sending never blocks: frames are queued and written later. Completion and
//! failure come back as [`TransportEvent`]s on the sink handed to the
//! transport when it was created.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One logical protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether the transport preserves message boundaries itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Whole messages per delivery (WebSocket).
    Message,
    /// Raw bytes; frames are delimited by a length prefix.
    Stream,
}

/// Lifecycle state of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Bound,
    Listening,
    Closing,
}

/// Notification from a transport to whoever drives the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A complete frame arrived.
    Frame(Frame),
    StateChanged(SocketState),
    Error(String),
    /// The connection is gone. Sent exactly once.
    Disconnected,
}

/// Where a transport reports its events.
pub type TransportSink = UnboundedSender<TransportEvent>;

/// A connected channel to the remote peer.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// False once the underlying socket has been torn down.
    fn exists(&self) -> bool;

    fn peer_address(&self) -> Option<SocketAddr>;

    fn is_open(&self) -> bool;

    fn is_valid(&self) -> bool;

    fn state(&self) -> SocketState;

    /// Description of the last error, if any.
    fn error_string(&self) -> Option<String>;

    /// Queue a frame for sending. Returns without waiting for the write.
    fn send(&mut self, frame: Frame) -> Result<()>;

    /// Push queued frames out to the peer.
    fn flush(&mut self) -> Result<()>;

    /// Drop the connection immediately.
    fn close(&mut self);

    /// Close politely, letting queued frames go out first.
    fn disconnect_from_host(&mut self);

    /// Bytes received but not yet delivered, where the transport knows.
    fn bytes_available(&self) -> Option<usize> {
        None
    }
}

/// Opens transports given connection parameters.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    async fn connect(&self, address: &str, events: TransportSink) -> Result<Self::Transport>;
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug)]
struct MemoryState {
    sent: Vec<Frame>,
    flushes: usize,
    state: SocketState,
    peer_address: Option<SocketAddr>,
}

/// Transport that keeps sent frames in memory.
///
/// Clones share state, so a test can keep one handle and move another into
/// a peer.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
    kind: TransportKind,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(TransportKind::Message)
    }
}

impl MemoryTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                sent: Vec::new(),
                flushes: 0,
                state: SocketState::Connected,
                peer_address: None,
            })),
            kind,
        }
    }

    pub fn with_peer_address(self, address: SocketAddr) -> Self {
        self.lock().peer_address = Some(address);
        self
    }

    /// Remove and return every frame sent so far.
    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut self.lock().sent)
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn exists(&self) -> bool {
        true
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.lock().peer_address
    }

    fn is_open(&self) -> bool {
        self.lock().state == SocketState::Connected
    }

    fn is_valid(&self) -> bool {
        self.is_open()
    }

    fn state(&self) -> SocketState {
        self.lock().state
    }

    fn error_string(&self) -> Option<String> {
        None
    }

    fn send(&mut self, frame: Frame) -> Result<()> {
        let mut state = self.lock();
        if state.state != SocketState::Connected {
            return Err(TransportError::NotConnected);
        }
        state.sent.push(frame);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().state = SocketState::Unconnected;
    }

    fn disconnect_from_host(&mut self) {
        self.lock().state = SocketState::Unconnected;
    }
}

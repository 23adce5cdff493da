//! Length-prefixed TCP transport.
//!
//! Frames travel as a 32-bit big-endian length followed by the payload.
//! Incoming frames are always delivered as `Frame::Binary`; the codec knows
//! whether the bytes are JSON text or the binary form.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use link_core::framing::{FrameDecoder, MAX_FRAME_SIZE, encode_frame};
use link_core::transport::{Result, TransportError};
use link_core::{
    Frame, SocketState, Transport, TransportEvent, TransportFactory, TransportKind, TransportSink,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::socket::{Outgoing, SocketShared};

const READ_CHUNK: usize = 64 * 1024;

pub struct TcpTransport {
    shared: Arc<SocketShared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    peer_address: Option<SocketAddr>,
    read_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Wrap a connected stream. Must be called inside a tokio runtime.
    pub fn new(label: impl Into<String>, stream: TcpStream, events: TransportSink) -> Self {
        let peer_address = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let shared = Arc::new(SocketShared::new(label.into(), events));
        let (read, write) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(shared.clone(), read));
        tokio::spawn(write_loop(shared.clone(), write, outgoing_rx));

        Self {
            shared,
            outgoing,
            peer_address,
            read_task: Some(read_task),
        }
    }
}

async fn read_loop(shared: Arc<SocketShared>, mut read: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    'read: loop {
        match read.read(&mut chunk).await {
            Ok(0) => {
                debug!("Connection {} stream ended", shared.label());
                break;
            }
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => shared.deliver(Frame::Binary(frame)),
                        Ok(None) => break,
                        Err(e) => {
                            error!("Unreadable stream from {}: {}", shared.label(), e);
                            shared.fail(e.to_string());
                            break 'read;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Read error on {}: {}", shared.label(), e);
                shared.fail(e.to_string());
                break;
            }
        }
    }
    shared.finish();
}

async fn write_loop(
    shared: Arc<SocketShared>,
    write: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut write = BufWriter::new(write);
    while let Some(command) = outgoing.recv().await {
        let result = match command {
            Outgoing::Frame(frame) => match encode_frame(frame.as_bytes()) {
                Ok(bytes) => write.write_all(&bytes).await,
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)),
            },
            Outgoing::Flush => write.flush().await,
            Outgoing::Close => break,
        };
        if let Err(e) = result {
            error!("Failed to write to {}: {}", shared.label(), e);
            shared.fail(e.to_string());
            break;
        }
    }
    let _ = write.flush().await;
    let _ = write.shutdown().await;
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn exists(&self) -> bool {
        !self.shared.is_finished()
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    fn is_open(&self) -> bool {
        self.shared.state() == SocketState::Connected
    }

    fn is_valid(&self) -> bool {
        self.is_open() && self.shared.error().is_none()
    }

    fn state(&self) -> SocketState {
        self.shared.state()
    }

    fn error_string(&self) -> Option<String> {
        self.shared.error()
    }

    fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::SendFailed(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::NotConnected)
    }

    fn flush(&mut self) -> Result<()> {
        self.outgoing
            .send(Outgoing::Flush)
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(Outgoing::Close);
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        self.shared.finish();
    }

    fn disconnect_from_host(&mut self) {
        if self.is_open() {
            self.shared.set_state(SocketState::Closing);
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Opens client-side TCP transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl TransportFactory for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self, address: &str, events: TransportSink) -> Result<TcpTransport> {
        let _ = events.unbounded_send(TransportEvent::StateChanged(SocketState::Connecting));
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", address, e)))?;
        info!("Connected to {}", address);
        Ok(TcpTransport::new(address, stream, events))
    }
}

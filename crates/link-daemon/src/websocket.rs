//! WebSocket transport.
//!
//! One protocol frame per WebSocket message: text frames in text mode,
//! binary frames in Raw mode. The stream is split; a read task forwards
//! incoming frames as `TransportEvent`s and a write task drains a queue,
//! so `send` never waits on the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use link_core::framing::MAX_FRAME_SIZE;
use link_core::transport::{Result, TransportError};
use link_core::{
    Frame, SocketState, Transport, TransportEvent, TransportFactory, TransportKind, TransportSink,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::socket::{Outgoing, SocketShared};

pub struct WebSocketTransport {
    shared: Arc<SocketShared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    peer_address: Option<SocketAddr>,
    read_task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Wrap an upgraded WebSocket stream.
    ///
    /// Spawns the read and write tasks; must be called inside a tokio runtime.
    pub fn new<S>(
        label: impl Into<String>,
        ws_stream: WebSocketStream<S>,
        peer_address: Option<SocketAddr>,
        events: TransportSink,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(SocketShared::new(label.into(), events));
        let (write, read) = ws_stream.split();
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

async fn read_loop<S>(shared: Arc<SocketShared>, mut read: SplitStream<WebSocketStream<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let frame = match msg {
                    Message::Text(text) => Frame::Text(text),
                    Message::Binary(data) => Frame::Binary(data),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", shared.label());
                        break;
                    }
                };

                if frame.len() > MAX_FRAME_SIZE {
                    warn!(
                        "Message from {} exceeds max size ({} > {}), dropping",
                        shared.label(),
                        frame.len(),
                        MAX_FRAME_SIZE
                    );
                    continue;
                }
                shared.deliver(frame);
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", shared.label());
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", shared.label(), e);
                        shared.fail(e.to_string());
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", shared.label());
                break;
            }
        }
    }
    shared.finish();
}

async fn write_loop<S>(
    shared: Arc<SocketShared>,
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(command) = outgoing.recv().await {
        let result = match command {
            Outgoing::Frame(Frame::Text(text)) => write.feed(Message::Text(text)).await,
            Outgoing::Frame(Frame::Binary(data)) => write.feed(Message::Binary(data)).await,
            Outgoing::Flush => write.flush().await,
            Outgoing::Close => {
                let goodbye = CloseFrame {
                    code: CloseCode::Away,
                    reason: "Disconnecting".into(),
                };
                let _ = write.send(Message::Close(Some(goodbye))).await;
                break;
            }
        };
        if let Err(e) = result {
            error!("Failed to write to {}: {}", shared.label(), e);
            shared.fail(e.to_string());
            break;
        }
    }
    let _ = write.close().await;
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Message
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

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Opens client-side WebSocket transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl TransportFactory for WebSocketConnector {
    type Transport = WebSocketTransport;

    /// `address` is either a full `ws://` URL or a bare `host:port`.
    async fn connect(&self, address: &str, events: TransportSink) -> Result<WebSocketTransport> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("ws://{}", address)
        };

        let _ = events.unbounded_send(TransportEvent::StateChanged(SocketState::Connecting));
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;

        let peer_address = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
            _ => None,
        };
        info!("Connected to {}", url);
        Ok(WebSocketTransport::new(url, ws_stream, peer_address, events))
    }
}

//! Core server accepting client connections.
//!
//! Each accepted socket is set up on its own task (a slow WebSocket upgrade
//! never holds up the accept loop) and becomes a `Connection` with its own
//! `Peer`. The handshake is answered by a per-connection clone of
//! the server's `CoreAuthority`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::channel::mpsc;
use link_core::{Features, HeartbeatConfig, ObjectSyncHandler, Transport, TransportEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::authority::CoreAuthority;
use crate::config::{Config, TransportSetting};
use crate::connection::{Connection, ConnectionHandle};
use crate::tcp::TcpTransport;
use crate::websocket::WebSocketTransport;

/// How long a socket may take to complete the WebSocket upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CoreServer {
    transport: TransportSetting,
    features: Features,
    heartbeat: HeartbeatConfig,
    authority: CoreAuthority,
    sync: Arc<dyn ObjectSyncHandler>,
    next_conn_id: Arc<AtomicU64>,
}

impl CoreServer {
    pub fn new(config: &Config, sync: Arc<dyn ObjectSyncHandler>) -> Self {
        Self {
            transport: config.transport,
            features: config.features(),
            heartbeat: config.heartbeat_config(),
            authority: CoreAuthority::from_config(config),
            sync,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Override the heartbeat policy from the config.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn authority(&self) -> &CoreAuthority {
        &self.authority
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Core listening on {}", listen_addr);
        Ok(listener)
    }

    /// Set up a new incoming connection and start driving it.
    ///
    /// Returns `None` if the connection could not be set up; the reason is
    /// logged.
    pub async fn accept_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Option<ConnectionHandle> {
        let conn_id = format!("conn-{}", self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (sink, events) = mpsc::unbounded();

        match self.transport {
            TransportSetting::Websocket => {
                let ws_stream = match timeout(UPGRADE_TIMEOUT, accept_async(stream)).await {
                    Ok(Ok(ws)) => ws,
                    Err(_) => {
                        warn!("WebSocket upgrade from {} timed out", addr);
                        return None;
                    }
                    Ok(Err(e)) => {
                        // Health checks (like `nc -z`) connect and close without
                        // completing the WebSocket handshake.
                        let err_str = e.to_string();
                        if err_str.contains("Handshake not finished")
                            || err_str.contains("Connection reset")
                            || err_str.contains("unexpected EOF")
                        {
                            debug!("Connection closed before handshake from {}", addr);
                        } else {
                            error!("WebSocket upgrade failed for {}: {}", addr, e);
                        }
                        return None;
                    }
                };
                let transport = WebSocketTransport::new(conn_id.clone(), ws_stream, Some(addr), sink);
                self.spawn_connection(conn_id, addr, transport, events)
            }
            TransportSetting::Tcp => {
                let transport = TcpTransport::new(conn_id.clone(), stream, sink);
                self.spawn_connection(conn_id, addr, transport, events)
            }
        }
    }

    fn spawn_connection<T: Transport + 'static>(
        &self,
        conn_id: String,
        addr: SocketAddr,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Option<ConnectionHandle> {
        let auth = self.authority.for_connection(format!("{} ({})", conn_id, addr));
        let connection = Connection::new(
            conn_id.clone(),
            transport,
            events,
            self.features,
            Box::new(auth),
            self.sync.clone(),
            self.heartbeat.clone(),
        );
        let (connection, handle) = match connection {
            Ok(pair) => pair,
            Err(e) => {
                error!("Cannot serve {}: {}", conn_id, e);
                return None;
            }
        };

        info!("New connection from {} (conn_id: {})", addr, conn_id);
        tokio::spawn(connection.run());
        Some(handle)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.accept_connection(stream, addr).await;
            });
        }
    }
}

//! link-daemon library: sockets and roles around `link-core`.
//!
//! This is the tokio layer of the protocol: WebSocket and TCP transports,
//! the connection driver, and the core and client sides of the handshake.
//! The `link-daemon` binary and the integration tests are built on it.

pub mod authority;
pub mod client;
pub mod config;
pub mod connection;
pub mod server;
mod socket;
pub mod sync_log;
pub mod tcp;
pub mod websocket;

// Re-export key types for convenience
pub use authority::CoreAuthority;
pub use client::{ClientHandshake, ClientSession, Credentials, HandshakeStatus, connect};
pub use config::{Config, TransportSetting};
pub use connection::{Connection, ConnectionHandle, ConnectionOutcome};
pub use server::CoreServer;
pub use sync_log::LoggingSyncHandler;
pub use tcp::{TcpConnector, TcpTransport};
pub use websocket::{WebSocketConnector, WebSocketTransport};

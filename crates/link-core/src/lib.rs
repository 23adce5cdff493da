//! link-core: the client-core synchronization protocol.
//!
//! This crate provides:
//! - Typed handshake and session messages, with their JSON document shape
//! - A codec for the text and compact binary wire forms
//! - The `Peer` state machine that gates messages by connection phase
//! - Transport and handler traits the peer is wired to
//! - Value projection helpers and heartbeat bookkeeping
//!
//! It does no I/O of its own; see `link-daemon` for sockets.

pub mod codec;
pub mod features;
pub mod framing;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod peer;
pub mod timestamp;
pub mod transport;
pub mod types;
pub mod value;

pub use codec::{Codec, CodecError, WireFormat};
pub use features::Features;
pub use handler::{AuthHandler, NullSyncHandler, ObjectSyncHandler};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use message::{HandshakeMessage, ProtocolMessage, SessionMessage};
pub use peer::{Peer, PeerError, PeerEvent, Phase};
pub use transport::{
    Frame, MemoryTransport, SocketState, Transport, TransportError, TransportEvent,
    TransportFactory, TransportKind, TransportSink,
};
pub use types::{BufferId, BufferInfo, BufferKind, IdentityId, NetworkId};
pub use value::{Document, ToDocument, Variant};

//! Protocol engine for one connection.
//!
//! A `Peer` owns its transport and codec. It starts `Unestablished`, where
//! only handshake messages are understood, and moves to `Established`
//! exactly once, when a `SessionState` is received or sent. After that only
//! session messages are understood; handshake messages are ignored, so a
//! remote cannot restart login mid-session.
//!
//! Everything the owner needs to react to (protocol errors, transport
//! trouble, lag measurements) arrives on one [`PeerEvent`] channel.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecError, WireFormat};
use crate::features::Features;
use crate::handler::{AuthHandler, ObjectSyncHandler};
use crate::heartbeat::lag_since;
use crate::message::{
    HANDSHAKE_TABLE, HandshakeMessage, HeartBeatReply, ProtocolMessage, SESSION_TABLE,
    SessionMessage, discriminator_of, lookup,
};
use crate::timestamp;
use crate::transport::{SocketState, Transport, TransportError, TransportEvent, TransportKind};

const INVALID_HANDSHAKE: &str = "Invalid handshake message!";
const INVALID_REQUEST: &str = "Invalid request message!";

/// Which message family a peer currently understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unestablished,
    Established,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Unestablished => write!(f, "unestablished"),
            Phase::Established => write!(f, "established"),
        }
    }
}

/// Notifications from a peer to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The remote spoke nonsense. The owner should disconnect.
    ProtocolError(String),
    /// A reply produced while handling a message could not be sent.
    SendFailed(String),
    TransportError(String),
    StateChanged(SocketState),
    Disconnected,
    /// The handshake completed.
    Established,
    /// A heartbeat reply came back.
    LagUpdated {
        timestamp: DateTime<Utc>,
        lag: Duration,
    },
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer requires unsupported features {unsupported:#06x} (requested {requested:#06x})")]
    IncompatibleFeatures { requested: u16, unsupported: u16 },

    #[error("Cannot send {discriminator} while the connection is {phase}")]
    WrongPhase {
        discriminator: &'static str,
        phase: Phase,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Peer<T: Transport> {
    transport: T,
    codec: Codec,
    features: Features,
    phase: Phase,
    auth: Box<dyn AuthHandler>,
    sync: Arc<dyn ObjectSyncHandler>,
    events: UnboundedSender<PeerEvent>,
}

impl<T: Transport> Peer<T> {
    /// Bind a peer to a connected transport.
    ///
    /// `features` is the set requested for this connection; it is checked
    /// against what this implementation supports before anything is sent.
    pub fn new(
        transport: T,
        features: Features,
        auth: Box<dyn AuthHandler>,
        sync: Arc<dyn ObjectSyncHandler>,
    ) -> Result<(Self, UnboundedReceiver<PeerEvent>), PeerError> {
        if !Self::accepts_features(features.bits()) {
            return Err(PeerError::IncompatibleFeatures {
                requested: features.bits(),
                unsupported: Features::unsupported_bits(features.bits()),
            });
        }

        let (events, events_rx) = mpsc::unbounded();
        let peer = Self {
            transport,
            codec: Codec::for_features(features),
            features,
            phase: Phase::Unestablished,
            auth,
            sync,
            events,
        };
        debug!(
            "Created peer for {:?} speaking {} (features: {})",
            peer.peer_address(),
            peer.protocol_name(),
            features
        );
        Ok((peer, events_rx))
    }

    pub fn supported_features() -> Features {
        Features::supported()
    }

    pub fn accepts_features(peer_features: u16) -> bool {
        Features::accepts(peer_features)
    }

    pub fn enabled_features(&self) -> Features {
        self.features
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Established
    }

    pub fn protocol(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn protocol_name(&self) -> &'static str {
        match self.transport.kind() {
            TransportKind::Message => "the WebSocket protocol",
            TransportKind::Stream => "the length-prefixed stream protocol",
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        self.codec.format()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.transport.peer_address()
    }

    pub fn is_open(&self) -> bool {
        self.transport.exists() && self.transport.is_open()
    }

    /// Encode `message`, hand it to the transport and flush.
    ///
    /// Nothing is awaited. Messages from the family that does not match the
    /// current phase are refused before anything is written. Sending a
    /// `SessionState` establishes the session.
    pub fn dispatch(&mut self, message: impl Into<ProtocolMessage>) -> Result<(), PeerError> {
        let message = message.into();
        let allowed = matches!(
            (&message, self.phase),
            (ProtocolMessage::Handshake(_), Phase::Unestablished)
                | (ProtocolMessage::Session(_), Phase::Established)
        );
        if !allowed {
            return Err(PeerError::WrongPhase {
                discriminator: message.discriminator(),
                phase: self.phase,
            });
        }

        let frame = self.codec.encode(&message)?;
        debug!("Sending {} ({} bytes)", message.discriminator(), frame.len());
        self.transport.send(frame)?;
        self.transport.flush()?;

        if matches!(
            message,
            ProtocolMessage::Handshake(HandshakeMessage::SessionState(_))
        ) {
            self.establish();
        }
        Ok(())
    }

    /// Feed a notification from the transport.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.on_frame_received(frame.as_bytes()),
            TransportEvent::StateChanged(state) => self.emit(PeerEvent::StateChanged(state)),
            TransportEvent::Error(error) => self.emit(PeerEvent::TransportError(error)),
            TransportEvent::Disconnected => self.emit(PeerEvent::Disconnected),
        }
    }

    /// Decode one inbound frame and route it to its handler.
    pub fn on_frame_received(&mut self, raw: &[u8]) {
        let document = match self.codec.decode_document(raw) {
            Ok(document) => document,
            Err(e) => {
                debug!("Failed to decode {} byte frame: {}", raw.len(), e);
                return self.protocol_error(self.invalid_message().to_string());
            }
        };
        let Some(discriminator) = discriminator_of(&document).map(str::to_owned) else {
            return self.protocol_error(self.invalid_message().to_string());
        };

        match self.phase {
            Phase::Unestablished => {
                let Some(decoder) = lookup(HANDSHAKE_TABLE, &discriminator) else {
                    return self.protocol_error(format!(
                        "Unknown protocol message of type {discriminator}"
                    ));
                };
                match decoder(document) {
                    Ok(message) => self.handle_handshake(message),
                    Err(e) => {
                        debug!("Malformed {} message: {}", discriminator, e);
                        self.protocol_error(INVALID_HANDSHAKE.to_string());
                    }
                }
            }
            Phase::Established => {
                let Some(decoder) = lookup(SESSION_TABLE, &discriminator) else {
                    debug!("Ignoring unknown message of type {}", discriminator);
                    return;
                };
                match decoder(document) {
                    Ok(message) => self.handle_session(message),
                    Err(e) => {
                        debug!("Malformed {} message: {}", discriminator, e);
                        self.protocol_error(INVALID_REQUEST.to_string());
                    }
                }
            }
        }
    }

    /// Close gracefully, letting queued frames drain.
    pub fn close(&mut self) {
        debug!("Closing connection to {:?}", self.peer_address());
        self.transport.disconnect_from_host();
    }

    /// Drop the connection without draining.
    pub fn abort(&mut self) {
        self.transport.close();
    }

    fn handle_handshake(&mut self, message: HandshakeMessage) {
        debug!("Received {}", message.discriminator());
        let replies = match message {
            HandshakeMessage::RegisterClient(m) => self.auth.handle_register_client(m),
            HandshakeMessage::ClientDenied(m) => self.auth.handle_client_denied(m),
            HandshakeMessage::ClientRegistered(m) => self.auth.handle_client_registered(m),
            HandshakeMessage::SetupData(m) => self.auth.handle_setup_data(m),
            HandshakeMessage::SetupFailed(m) => self.auth.handle_setup_failed(m),
            HandshakeMessage::SetupDone(m) => self.auth.handle_setup_done(m),
            HandshakeMessage::Login(m) => self.auth.handle_login(m),
            HandshakeMessage::LoginFailed(m) => self.auth.handle_login_failed(m),
            HandshakeMessage::LoginSuccess(m) => self.auth.handle_login_success(m),
            HandshakeMessage::SessionState(m) => {
                self.establish();
                self.auth.handle_session_state(m)
            }
        };
        for reply in replies {
            self.send_reply(reply.into());
        }
    }

    fn handle_session(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::SyncMessage(m) => self.sync.handle_sync(m),
            SessionMessage::RpcCall(m) => self.sync.handle_rpc_call(m),
            SessionMessage::InitRequest(m) => {
                if let Some(data) = self.sync.handle_init_request(m) {
                    self.send_reply(data.into());
                }
            }
            SessionMessage::InitData(m) => self.sync.handle_init_data(m),
            SessionMessage::HeartBeat(m) => {
                self.send_reply(
                    HeartBeatReply {
                        timestamp: m.timestamp,
                    }
                    .into(),
                );
            }
            SessionMessage::HeartBeatReply(m) => {
                let lag = lag_since(m.timestamp, timestamp::now());
                self.emit(PeerEvent::LagUpdated {
                    timestamp: m.timestamp,
                    lag,
                });
            }
        }
    }

    fn send_reply(&mut self, message: ProtocolMessage) {
        let discriminator = message.discriminator();
        if let Err(e) = self.dispatch(message) {
            warn!("Failed to send {}: {}", discriminator, e);
            self.emit(PeerEvent::SendFailed(e.to_string()));
        }
    }

    fn establish(&mut self) {
        if self.phase == Phase::Established {
            return;
        }
        self.phase = Phase::Established;
        info!("Session established with {:?}", self.peer_address());
        self.emit(PeerEvent::Established);
    }

    fn invalid_message(&self) -> &'static str {
        match self.phase {
            Phase::Unestablished => INVALID_HANDSHAKE,
            Phase::Established => INVALID_REQUEST,
        }
    }

    fn protocol_error(&self, description: String) {
        warn!("Protocol error from {:?}: {}", self.peer_address(), description);
        self.emit(PeerEvent::ProtocolError(description));
    }

    fn emit(&self, event: PeerEvent) {
        // The owner may already be gone; nothing left to tell.
        let _ = self.events.unbounded_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        ClientRegistered, HeartBeat, InitData, InitRequest, Login, LoginFailed, LoginSuccess,
        RegisterClient, RpcCall, SessionState, SetupDone, SyncMessage,
    };
    use crate::transport::{Frame, MemoryTransport};
    use chrono::TimeZone;
    use serde_json::{Map, json};
    use std::sync::Mutex;

    // ==================== Test collaborators ====================

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    /// Core side: answers registration and login.
    #[derive(Default, Clone)]
    struct CoreAuth {
        seen: Arc<Mutex<Vec<HandshakeMessage>>>,
    }

    impl AuthHandler for CoreAuth {
        fn handle_register_client(&mut self, msg: RegisterClient) -> Vec<HandshakeMessage> {
            self.seen.lock().unwrap().push(msg.into());
            vec![
                ClientRegistered {
                    core_features: 1,
                    core_configured: true,
                    backend_info: vec![],
                    core_start_time: start_time(),
                }
                .into(),
            ]
        }

        fn handle_login(&mut self, msg: Login) -> Vec<HandshakeMessage> {
            let ok = msg.user == "alice" && msg.password == "secret";
            self.seen.lock().unwrap().push(msg.into());
            if ok {
                vec![LoginSuccess {}.into(), SessionState::default().into()]
            } else {
                vec![
                    LoginFailed {
                        error_string: "Invalid username or password!".into(),
                    }
                    .into(),
                ]
            }
        }
    }

    /// Client side: logs in as soon as the core registers it.
    #[derive(Default, Clone)]
    struct ClientAuth {
        seen: Arc<Mutex<Vec<HandshakeMessage>>>,
    }

    impl AuthHandler for ClientAuth {
        fn handle_client_registered(&mut self, msg: ClientRegistered) -> Vec<HandshakeMessage> {
            self.seen.lock().unwrap().push(msg.into());
            vec![
                Login {
                    user: "alice".into(),
                    password: "secret".into(),
                }
                .into(),
            ]
        }

        fn handle_login_success(&mut self, msg: LoginSuccess) -> Vec<HandshakeMessage> {
            self.seen.lock().unwrap().push(msg.into());
            Vec::new()
        }

        fn handle_session_state(&mut self, msg: SessionState) -> Vec<HandshakeMessage> {
            self.seen.lock().unwrap().push(msg.into());
            // Too late for handshake replies; the peer must refuse this.
            vec![SetupDone {}.into()]
        }
    }

    #[derive(Default)]
    struct RecordingSync {
        calls: Mutex<Vec<SessionMessage>>,
    }

    impl RecordingSync {
        fn calls(&self) -> Vec<SessionMessage> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ObjectSyncHandler for RecordingSync {
        fn handle_sync(&self, msg: SyncMessage) {
            self.calls.lock().unwrap().push(msg.into());
        }

        fn handle_rpc_call(&self, msg: RpcCall) {
            self.calls.lock().unwrap().push(msg.into());
        }

        fn handle_init_request(&self, msg: InitRequest) -> Option<InitData> {
            self.calls.lock().unwrap().push(msg.clone().into());
            Some(InitData {
                class_name: msg.class_name,
                object_name: msg.object_name,
                init_data: Map::new(),
            })
        }

        fn handle_init_data(&self, msg: InitData) {
            self.calls.lock().unwrap().push(msg.into());
        }
    }

    struct Harness {
        peer: Peer<MemoryTransport>,
        wire: MemoryTransport,
        events: UnboundedReceiver<PeerEvent>,
        sync: Arc<RecordingSync>,
    }

    impl Harness {
        fn new(features: Features, auth: Box<dyn AuthHandler>) -> Self {
            let wire = MemoryTransport::default();
            let sync = Arc::new(RecordingSync::default());
            let (peer, events) = Peer::new(wire.clone(), features, auth, sync.clone()).unwrap();
            Self {
                peer,
                wire,
                events,
                sync,
            }
        }

        fn core() -> Self {
            Self::new(Features::NONE, Box::new(CoreAuth::default()))
        }

        /// A peer that has already completed its handshake.
        fn established() -> Self {
            let mut harness = Self::core();
            harness.peer.dispatch(SessionState::default()).unwrap();
            harness.wire.take_sent();
            harness.drain_events();
            harness
        }

        fn receive(&mut self, value: serde_json::Value) {
            let text = value.to_string();
            self.peer.on_frame_received(text.as_bytes());
        }

        fn drain_events(&mut self) -> Vec<PeerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn sent_documents(&self) -> Vec<serde_json::Value> {
            self.wire
                .take_sent()
                .into_iter()
                .map(|frame| serde_json::from_slice(frame.as_bytes()).unwrap())
                .collect()
        }
    }

    /// Shuttle frames between two peers until both go quiet.
    fn pump(a: &mut Harness, b: &mut Harness) {
        loop {
            let from_a = a.wire.take_sent();
            let from_b = b.wire.take_sent();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for frame in from_a {
                b.peer.on_frame_received(frame.as_bytes());
            }
            for frame in from_b {
                a.peer.on_frame_received(frame.as_bytes());
            }
        }
    }

    // ==================== Feature negotiation ====================

    #[test]
    fn test_accepts_own_features() {
        let supported = Peer::<MemoryTransport>::supported_features();
        assert!(Peer::<MemoryTransport>::accepts_features(supported.bits()));
        assert!(!Peer::<MemoryTransport>::accepts_features(supported.bits() | 0x8000));
    }

    #[test]
    fn test_new_rejects_unsupported_features() {
        let result = Peer::new(
            MemoryTransport::default(),
            Features::from_bits(0x8001),
            Box::new(CoreAuth::default()),
            Arc::new(RecordingSync::default()),
        );
        match result {
            Err(PeerError::IncompatibleFeatures {
                requested,
                unsupported,
            }) => {
                assert_eq!(requested, 0x8001);
                assert_eq!(unsupported, 0x8000);
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("peer should not be created"),
        }
    }

    #[test]
    fn test_raw_feature_selects_binary_frames() {
        let mut harness = Harness::new(Features::RAW, Box::new(CoreAuth::default()));
        assert_eq!(harness.peer.enabled_features(), Features::RAW);
        assert_eq!(harness.peer.wire_format(), WireFormat::Binary);
        harness.peer.dispatch(SetupDone {}).unwrap();
        assert!(matches!(harness.wire.take_sent()[0], Frame::Binary(_)));
    }

    // ==================== Handshake ====================

    #[test]
    fn test_full_handshake_establishes_both_sides() {
        let core_auth = CoreAuth::default();
        let client_auth = ClientAuth::default();
        let mut core = Harness::new(Features::NONE, Box::new(core_auth.clone()));
        let mut client = Harness::new(Features::NONE, Box::new(client_auth.clone()));

        client
            .peer
            .dispatch(RegisterClient {
                client_version: "1.0".into(),
                build_date: "2024-01-01".into(),
            })
            .unwrap();
        pump(&mut client, &mut core);

        assert_eq!(core.peer.phase(), Phase::Established);
        assert_eq!(client.peer.phase(), Phase::Established);

        let core_seen = core_auth.seen.lock().unwrap().clone();
        assert_eq!(core_seen.len(), 2);
        assert_eq!(core_seen[0].discriminator(), "RegisterClient");
        assert_eq!(core_seen[1].discriminator(), "Login");

        let client_seen = client_auth.seen.lock().unwrap().clone();
        assert_eq!(
            client_seen,
            vec![
                HandshakeMessage::ClientRegistered(ClientRegistered {
                    core_features: 1,
                    core_configured: true,
                    backend_info: vec![],
                    core_start_time: start_time(),
                }),
                HandshakeMessage::LoginSuccess(LoginSuccess {}),
                HandshakeMessage::SessionState(SessionState::default()),
            ]
        );

        assert!(core.drain_events().contains(&PeerEvent::Established));
        let client_events = client.drain_events();
        assert!(client_events.contains(&PeerEvent::Established));
        // The late SetupDone reply was refused, not sent.
        assert!(client_events.iter().any(|e| matches!(e, PeerEvent::SendFailed(_))));
        assert_eq!(client.wire.sent_count(), 0);
    }

    #[test]
    fn test_full_handshake_in_raw_mode() {
        let mut core = Harness::new(Features::RAW, Box::new(CoreAuth::default()));
        let mut client = Harness::new(Features::RAW, Box::new(ClientAuth::default()));
        client
            .peer
            .dispatch(RegisterClient {
                client_version: "1.0".into(),
                build_date: "2024-01-01".into(),
            })
            .unwrap();
        pump(&mut client, &mut core);
        assert!(core.peer.is_established());
        assert!(client.peer.is_established());
    }

    #[test]
    fn test_failed_login_stays_unestablished() {
        let mut core = Harness::core();
        core.receive(json!({"type": "Login", "user": "alice", "password": "wrong"}));
        assert_eq!(core.peer.phase(), Phase::Unestablished);
        let sent = core.sent_documents();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "LoginFailed");
    }

    #[test]
    fn test_legacy_registration_name_is_understood() {
        let mut core = Harness::core();
        core.receive(json!({"type": "ClientInit", "clientVersion": "0.9", "buildDate": "x"}));
        let sent = core.sent_documents();
        assert_eq!(sent[0]["type"], "ClientRegistered");
        assert_eq!(sent[0]["coreFeatures"], 1);
        assert_eq!(sent[0]["coreStartTime"], "01:01:2024 12:00:00.000");
    }

    // ==================== Invalid input ====================

    #[test]
    fn test_malformed_bytes_while_unestablished() {
        let mut core = Harness::core();
        core.peer.on_frame_received(b"not-json");
        assert_eq!(
            core.drain_events(),
            vec![PeerEvent::ProtocolError("Invalid handshake message!".into())]
        );
        assert_eq!(core.peer.phase(), Phase::Unestablished);
        assert_eq!(core.wire.sent_count(), 0);
    }

    #[test]
    fn test_malformed_bytes_while_established() {
        let mut core = Harness::established();
        core.peer.on_frame_received(b"\x00\x01garbage");
        assert_eq!(
            core.drain_events(),
            vec![PeerEvent::ProtocolError("Invalid request message!".into())]
        );
        assert!(core.peer.is_established());
    }

    #[test]
    fn test_missing_or_empty_type_while_unestablished() {
        let mut core = Harness::core();
        core.receive(json!({"user": "alice"}));
        core.receive(json!({"type": ""}));
        core.receive(json!({"type": null}));
        let expected = PeerEvent::ProtocolError("Invalid handshake message!".into());
        assert_eq!(core.drain_events(), vec![expected.clone(), expected.clone(), expected]);
        assert_eq!(core.peer.phase(), Phase::Unestablished);
    }

    #[test]
    fn test_missing_or_empty_type_while_established() {
        let mut core = Harness::established();
        core.receive(json!({"className": "Buffer"}));
        core.receive(json!({"type": ""}));
        let expected = PeerEvent::ProtocolError("Invalid request message!".into());
        assert_eq!(core.drain_events(), vec![expected.clone(), expected]);
        assert!(core.peer.is_established());
        assert!(core.sync.calls().is_empty());
    }

    #[test]
    fn test_non_object_document_is_invalid() {
        let mut core = Harness::core();
        core.receive(json!(["RegisterClient"]));
        assert_eq!(
            core.drain_events(),
            vec![PeerEvent::ProtocolError("Invalid handshake message!".into())]
        );
    }

    #[test]
    fn test_known_type_with_bad_fields_is_invalid() {
        let mut core = Harness::core();
        core.receive(json!({"type": "Login", "user": 42}));
        assert_eq!(
            core.drain_events(),
            vec![PeerEvent::ProtocolError("Invalid handshake message!".into())]
        );

        let mut established = Harness::established();
        established.receive(json!({"type": "HeartBeat", "timestamp": "soon"}));
        assert_eq!(
            established.drain_events(),
            vec![PeerEvent::ProtocolError("Invalid request message!".into())]
        );
        assert_eq!(established.wire.sent_count(), 0);
    }

    // ==================== Phase gating ====================

    #[test]
    fn test_session_message_while_unestablished_is_an_error() {
        let mut core = Harness::core();
        core.receive(json!({
            "type": "SyncMessage",
            "className": "Buffer",
            "objectName": "main",
            "slotName": "rename",
            "params": [],
        }));
        assert_eq!(
            core.drain_events(),
            vec![PeerEvent::ProtocolError(
                "Unknown protocol message of type SyncMessage".into()
            )]
        );
        assert!(core.sync.calls().is_empty());
        assert_eq!(core.peer.phase(), Phase::Unestablished);
    }

    #[test]
    fn test_handshake_message_while_established_is_ignored() {
        let auth = CoreAuth::default();
        let mut core = Harness::new(Features::NONE, Box::new(auth.clone()));
        core.peer.dispatch(SessionState::default()).unwrap();
        core.wire.take_sent();
        core.drain_events();

        core.receive(json!({"type": "Login", "user": "alice", "password": "secret"}));
        core.receive(json!({"type": "RegisterClient", "clientVersion": "1", "buildDate": "2"}));

        assert!(core.drain_events().is_empty());
        assert!(auth.seen.lock().unwrap().is_empty());
        assert_eq!(core.wire.sent_count(), 0);
        assert!(core.peer.is_established());
    }

    #[test]
    fn test_unknown_session_message_is_ignored() {
        let mut core = Harness::established();
        core.receive(json!({"type": "BacklogRequest", "bufferId": 3}));
        assert!(core.drain_events().is_empty());
        assert_eq!(core.wire.sent_count(), 0);
    }

    #[test]
    fn test_dispatch_refuses_wrong_family() {
        let mut core = Harness::core();
        let result = core.peer.dispatch(HeartBeat::now());
        assert!(matches!(
            result,
            Err(PeerError::WrongPhase {
                discriminator: "HeartBeat",
                phase: Phase::Unestablished
            })
        ));

        let mut established = Harness::established();
        assert!(established.peer.dispatch(LoginSuccess {}).is_err());
        assert_eq!(core.wire.sent_count(), 0);
        assert_eq!(established.wire.sent_count(), 0);
    }

    // ==================== Session traffic ====================

    #[test]
    fn test_sync_message_reaches_handler_once() {
        let mut core = Harness::established();
        core.receive(json!({
            "type": "SyncMessage",
            "className": "Buffer",
            "objectName": "main",
            "slotName": "rename",
            "params": ["#new"],
        }));
        assert_eq!(
            core.sync.calls(),
            vec![SessionMessage::SyncMessage(SyncMessage {
                class_name: "Buffer".into(),
                object_name: "main".into(),
                slot_name: "rename".into(),
                params: vec![json!("#new")],
            })]
        );
    }

    #[test]
    fn test_rpc_and_init_data_reach_handler() {
        let mut core = Harness::established();
        core.receive(json!({"type": "RpcCall", "slotName": "2bufferInfoUpdated(BufferInfo)", "params": [1]}));
        core.receive(json!({"type": "InitData", "className": "Network", "objectName": "1", "params": {}}));
        let kinds: Vec<_> = core.sync.calls().iter().map(|c| c.discriminator()).collect();
        assert_eq!(kinds, vec!["RpcCall", "InitData"]);
    }

    #[test]
    fn test_init_request_is_answered() {
        let mut core = Harness::established();
        core.receive(json!({"type": "InitRequest", "className": "Network", "objectName": "1"}));
        let sent = core.sent_documents();
        assert_eq!(
            sent,
            vec![json!({"type": "InitData", "className": "Network", "objectName": "1", "params": {}})]
        );
    }

    #[test]
    fn test_heartbeat_is_echoed_exactly_once() {
        let mut core = Harness::established();
        core.receive(json!({"type": "HeartBeat", "timestamp": "01:01:2024 12:00:00.123"}));
        assert_eq!(
            core.sent_documents(),
            vec![json!({"type": "HeartBeatReply", "timestamp": "01:01:2024 12:00:00.123"})]
        );
        assert!(core.sync.calls().is_empty());
    }

    #[test]
    fn test_heartbeat_roundtrip_between_peers() {
        let mut a = Harness::established();
        let mut b = Harness::established();
        let beat = HeartBeat::now();
        a.peer.dispatch(beat.clone()).unwrap();
        pump(&mut a, &mut b);

        let events = a.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            PeerEvent::LagUpdated { timestamp, .. } => assert_eq!(*timestamp, beat.timestamp),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_flushes_and_keeps_order() {
        let mut core = Harness::established();
        for slot in ["a", "b", "c"] {
            core.peer
                .dispatch(SyncMessage {
                    class_name: "Buffer".into(),
                    object_name: "main".into(),
                    slot_name: slot.into(),
                    params: vec![],
                })
                .unwrap();
        }
        assert_eq!(core.wire.flush_count(), 4);
        let slots: Vec<_> = core
            .sent_documents()
            .into_iter()
            .map(|d| d["slotName"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(slots, vec!["a", "b", "c"]);
    }

    // ==================== Transport events ====================

    #[test]
    fn test_transport_events_share_the_event_channel() {
        let mut core = Harness::core();
        core.peer
            .on_transport_event(TransportEvent::StateChanged(SocketState::Closing));
        core.peer
            .on_transport_event(TransportEvent::Error("connection reset".into()));
        core.peer.on_transport_event(TransportEvent::Disconnected);
        assert_eq!(
            core.drain_events(),
            vec![
                PeerEvent::StateChanged(SocketState::Closing),
                PeerEvent::TransportError("connection reset".into()),
                PeerEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn test_frames_from_transport_are_decoded() {
        let mut core = Harness::core();
        core.peer.on_transport_event(TransportEvent::Frame(Frame::Text(
            r#"{"type":"RegisterClient","clientVersion":"1.0","buildDate":"2024-01-01"}"#.into(),
        )));
        assert_eq!(core.sent_documents()[0]["type"], "ClientRegistered");
    }

    #[test]
    fn test_send_after_close_fails() {
        let mut core = Harness::core();
        core.peer.close();
        assert!(!core.peer.is_open());
        assert!(matches!(
            core.peer.dispatch(SetupDone {}),
            Err(PeerError::Transport(TransportError::NotConnected))
        ));
    }
}

//! Protocol messages.
//!
//! Two families share one wire shape, `{"type": "<Discriminator>", ...}`:
//! the handshake family, valid only before a session is established, and the
//! session family, valid only afterwards. Each family has its own static
//! decode table keyed by discriminator; the peer picks the table from its
//! phase and never from message content.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timestamp::{self, canonical};
use crate::value::Document;

/// Name of the discriminator field.
pub const TYPE_FIELD: &str = "type";

// ============================================================================
// Handshake family
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClient {
    pub client_version: String,
    pub build_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDenied {
    pub error_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistered {
    pub core_features: u32,
    pub core_configured: bool,
    #[serde(default)]
    pub backend_info: Vec<Value>,
    #[serde(with = "canonical")]
    pub core_start_time: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupData {
    pub admin_user: String,
    pub admin_password: String,
    pub backend: String,
    #[serde(default)]
    pub setup_data: Map<String, Value>,
}

impl fmt::Debug for SetupData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupData")
            .field("admin_user", &self.admin_user)
            .field("admin_password", &"<redacted>")
            .field("backend", &self.backend)
            .field("setup_data", &self.setup_data)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupFailed {
    pub error_string: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupDone {}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFailed {
    pub error_string: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginSuccess {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub identities: Vec<Value>,
    #[serde(default)]
    pub buffer_infos: Vec<Value>,
    #[serde(default)]
    pub network_ids: Vec<Value>,
}

// ============================================================================
// Session family
// ============================================================================

/// Mutation of a named remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub class_name: String,
    pub object_name: String,
    pub slot_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCall {
    pub slot_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub class_name: String,
    pub object_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    pub class_name: String,
    pub object_name: String,
    /// Object state. Written as `params`; `initData` is read as well.
    #[serde(default, rename = "params", alias = "initData")]
    pub init_data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
    #[serde(with = "canonical")]
    pub timestamp: DateTime<Utc>,
}

impl HeartBeat {
    pub fn now() -> Self {
        Self {
            timestamp: timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartBeatReply {
    #[serde(with = "canonical")]
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Families
// ============================================================================

/// Messages exchanged before the session is established.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeMessage {
    RegisterClient(RegisterClient),
    ClientDenied(ClientDenied),
    ClientRegistered(ClientRegistered),
    SetupData(SetupData),
    SetupFailed(SetupFailed),
    SetupDone(SetupDone),
    Login(Login),
    LoginFailed(LoginFailed),
    LoginSuccess(LoginSuccess),
    SessionState(SessionState),
}

/// Messages exchanged once the session is established.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMessage {
    SyncMessage(SyncMessage),
    RpcCall(RpcCall),
    InitRequest(InitRequest),
    InitData(InitData),
    HeartBeat(HeartBeat),
    HeartBeatReply(HeartBeatReply),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Handshake(HandshakeMessage),
    Session(SessionMessage),
}

impl HandshakeMessage {
    /// Canonical discriminator written on the wire.
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::RegisterClient(_) => "RegisterClient",
            Self::ClientDenied(_) => "ClientDenied",
            Self::ClientRegistered(_) => "ClientRegistered",
            Self::SetupData(_) => "SetupData",
            Self::SetupFailed(_) => "SetupFailed",
            Self::SetupDone(_) => "SetupDone",
            Self::Login(_) => "Login",
            Self::LoginFailed(_) => "LoginFailed",
            Self::LoginSuccess(_) => "LoginSuccess",
            Self::SessionState(_) => "SessionState",
        }
    }

    fn to_document(&self) -> Result<Document, serde_json::Error> {
        let discriminator = self.discriminator();
        match self {
            Self::RegisterClient(m) => tagged(discriminator, m),
            Self::ClientDenied(m) => tagged(discriminator, m),
            Self::ClientRegistered(m) => tagged(discriminator, m),
            Self::SetupData(m) => tagged(discriminator, m),
            Self::SetupFailed(m) => tagged(discriminator, m),
            Self::SetupDone(m) => tagged(discriminator, m),
            Self::Login(m) => tagged(discriminator, m),
            Self::LoginFailed(m) => tagged(discriminator, m),
            Self::LoginSuccess(m) => tagged(discriminator, m),
            Self::SessionState(m) => tagged(discriminator, m),
        }
    }
}

impl SessionMessage {
    /// Canonical discriminator written on the wire.
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::SyncMessage(_) => "SyncMessage",
            Self::RpcCall(_) => "RpcCall",
            Self::InitRequest(_) => "InitRequest",
            Self::InitData(_) => "InitData",
            Self::HeartBeat(_) => "HeartBeat",
            Self::HeartBeatReply(_) => "HeartBeatReply",
        }
    }

    fn to_document(&self) -> Result<Document, serde_json::Error> {
        let discriminator = self.discriminator();
        match self {
            Self::SyncMessage(m) => tagged(discriminator, m),
            Self::RpcCall(m) => tagged(discriminator, m),
            Self::InitRequest(m) => tagged(discriminator, m),
            Self::InitData(m) => tagged(discriminator, m),
            Self::HeartBeat(m) => tagged(discriminator, m),
            Self::HeartBeatReply(m) => tagged(discriminator, m),
        }
    }
}

impl ProtocolMessage {
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::Handshake(m) => m.discriminator(),
            Self::Session(m) => m.discriminator(),
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// Build the wire document, discriminator first.
    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match self {
            Self::Handshake(m) => m.to_document(),
            Self::Session(m) => m.to_document(),
        }
    }
}

fn tagged<T: Serialize>(discriminator: &str, body: &T) -> Result<Document, serde_json::Error> {
    let mut document = Document::new();
    document.insert(TYPE_FIELD.to_string(), Value::String(discriminator.to_string()));
    match serde_json::to_value(body)? {
        Value::Object(fields) => document.extend(fields),
        other => {
            return Err(serde::ser::Error::custom(format!(
                "{discriminator} serialized to {other}, expected an object"
            )));
        }
    }
    Ok(document)
}

macro_rules! into_family {
    ($family:ident => $wrap:ident: $($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for $family {
                fn from(message: $variant) -> Self {
                    $family::$variant(message)
                }
            }

            impl From<$variant> for ProtocolMessage {
                fn from(message: $variant) -> Self {
                    ProtocolMessage::$wrap($family::$variant(message))
                }
            }
        )*
    };
}

into_family!(HandshakeMessage => Handshake:
    RegisterClient, ClientDenied, ClientRegistered, SetupData, SetupFailed,
    SetupDone, Login, LoginFailed, LoginSuccess, SessionState,
);

into_family!(SessionMessage => Session:
    SyncMessage, RpcCall, InitRequest, InitData, HeartBeat, HeartBeatReply,
);

impl From<HandshakeMessage> for ProtocolMessage {
    fn from(message: HandshakeMessage) -> Self {
        ProtocolMessage::Handshake(message)
    }
}

impl From<SessionMessage> for ProtocolMessage {
    fn from(message: SessionMessage) -> Self {
        ProtocolMessage::Session(message)
    }
}

// ============================================================================
// Decode tables
// ============================================================================

/// Builds a typed message from a document whose discriminator already matched.
pub type Decoder<M> = fn(Document) -> Result<M, serde_json::Error>;

fn parse<T: DeserializeOwned>(document: Document) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(document))
}

/// Handshake discriminators, including the names older peers send.
pub static HANDSHAKE_TABLE: &[(&str, Decoder<HandshakeMessage>)] = &[
    ("RegisterClient", |d| parse(d).map(HandshakeMessage::RegisterClient)),
    ("ClientInit", |d| parse(d).map(HandshakeMessage::RegisterClient)),
    ("ClientDenied", |d| parse(d).map(HandshakeMessage::ClientDenied)),
    ("ClientInitReject", |d| parse(d).map(HandshakeMessage::ClientDenied)),
    ("ClientRegistered", |d| parse(d).map(HandshakeMessage::ClientRegistered)),
    ("ClientInitAck", |d| parse(d).map(HandshakeMessage::ClientRegistered)),
    ("SetupData", |d| parse(d).map(HandshakeMessage::SetupData)),
    ("CoreSetupData", |d| parse(d).map(HandshakeMessage::SetupData)),
    ("SetupFailed", |d| parse(d).map(HandshakeMessage::SetupFailed)),
    ("CoreSetupReject", |d| parse(d).map(HandshakeMessage::SetupFailed)),
    ("SetupDone", |d| parse(d).map(HandshakeMessage::SetupDone)),
    ("CoreSetupAck", |d| parse(d).map(HandshakeMessage::SetupDone)),
    ("Login", |d| parse(d).map(HandshakeMessage::Login)),
    ("ClientLogin", |d| parse(d).map(HandshakeMessage::Login)),
    ("LoginFailed", |d| parse(d).map(HandshakeMessage::LoginFailed)),
    ("ClientLoginReject", |d| parse(d).map(HandshakeMessage::LoginFailed)),
    ("LoginSuccess", |d| parse(d).map(HandshakeMessage::LoginSuccess)),
    ("ClientLoginAck", |d| parse(d).map(HandshakeMessage::LoginSuccess)),
    ("SessionState", |d| parse(d).map(HandshakeMessage::SessionState)),
    ("SessionInit", |d| parse(d).map(HandshakeMessage::SessionState)),
];

/// Session discriminators. `Sync` is the short name older peers send.
pub static SESSION_TABLE: &[(&str, Decoder<SessionMessage>)] = &[
    ("SyncMessage", |d| parse(d).map(SessionMessage::SyncMessage)),
    ("Sync", |d| parse(d).map(SessionMessage::SyncMessage)),
    ("RpcCall", |d| parse(d).map(SessionMessage::RpcCall)),
    ("InitRequest", |d| parse(d).map(SessionMessage::InitRequest)),
    ("InitData", |d| parse(d).map(SessionMessage::InitData)),
    ("HeartBeat", |d| parse(d).map(SessionMessage::HeartBeat)),
    ("HeartBeatReply", |d| parse(d).map(SessionMessage::HeartBeatReply)),
];

/// Find the decoder bound to `discriminator` in `table`.
pub fn lookup<M>(table: &[(&str, Decoder<M>)], discriminator: &str) -> Option<Decoder<M>> {
    table
        .iter()
        .find(|(name, _)| *name == discriminator)
        .map(|(_, decoder)| *decoder)
}

/// Read the discriminator of a document. Missing, non-string and empty
/// values all count as absent.
pub fn discriminator_of(document: &Document) -> Option<&str> {
    document
        .get(TYPE_FIELD)
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
}

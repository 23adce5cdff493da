//! Collaborators the peer hands decoded messages to.
//!
//! The peer never interprets credentials or object mutations itself:
//! handshake messages go to an [`AuthHandler`], object-sync messages go to an
//! [`ObjectSyncHandler`]. Replies returned by a handler are dispatched on the
//! same connection, in order.

use tracing::warn;

use crate::message::{
    ClientDenied, ClientRegistered, HandshakeMessage, InitData, InitRequest, Login, LoginFailed,
    LoginSuccess, RegisterClient, RpcCall, SessionState, SetupData, SetupDone, SetupFailed,
    SyncMessage,
};

/// Authentication and setup authority for one connection.
///
/// A core implements the request side (`RegisterClient`, `SetupData`,
/// `Login`), a client the response side. Messages a role does not expect are
/// logged and ignored by the default implementations.
pub trait AuthHandler: Send {
    fn handle_register_client(&mut self, msg: RegisterClient) -> Vec<HandshakeMessage> {
        unexpected("RegisterClient", &msg.client_version)
    }

    fn handle_client_denied(&mut self, msg: ClientDenied) -> Vec<HandshakeMessage> {
        unexpected("ClientDenied", &msg.error_string)
    }

    fn handle_client_registered(&mut self, msg: ClientRegistered) -> Vec<HandshakeMessage> {
        unexpected("ClientRegistered", &msg.core_features.to_string())
    }

    fn handle_setup_data(&mut self, msg: SetupData) -> Vec<HandshakeMessage> {
        unexpected("SetupData", &msg.backend)
    }

    fn handle_setup_failed(&mut self, msg: SetupFailed) -> Vec<HandshakeMessage> {
        unexpected("SetupFailed", &msg.error_string)
    }

    fn handle_setup_done(&mut self, _msg: SetupDone) -> Vec<HandshakeMessage> {
        unexpected("SetupDone", "")
    }

    fn handle_login(&mut self, msg: Login) -> Vec<HandshakeMessage> {
        unexpected("Login", &msg.user)
    }

    fn handle_login_failed(&mut self, msg: LoginFailed) -> Vec<HandshakeMessage> {
        unexpected("LoginFailed", &msg.error_string)
    }

    fn handle_login_success(&mut self, _msg: LoginSuccess) -> Vec<HandshakeMessage> {
        unexpected("LoginSuccess", "")
    }

    /// Called after the peer has switched to the established phase.
    fn handle_session_state(&mut self, _msg: SessionState) -> Vec<HandshakeMessage> {
        unexpected("SessionState", "")
    }
}

fn unexpected(kind: &str, detail: &str) -> Vec<HandshakeMessage> {
    warn!("Ignoring unexpected {} handshake message ({})", kind, detail);
    Vec::new()
}

/// Applies remote object mutations.
///
/// Shared by every peer of a process, so it takes `&self` and must tolerate
/// concurrent calls.
pub trait ObjectSyncHandler: Send + Sync {
    fn handle_sync(&self, msg: SyncMessage);

    fn handle_rpc_call(&self, msg: RpcCall);

    /// Answer a request for an object's full state. `None` sends nothing.
    fn handle_init_request(&self, msg: InitRequest) -> Option<InitData>;

    fn handle_init_data(&self, msg: InitData);
}

/// Handler that accepts and drops every object-sync message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSyncHandler;

impl ObjectSyncHandler for NullSyncHandler {
    fn handle_sync(&self, _msg: SyncMessage) {}

    fn handle_rpc_call(&self, _msg: RpcCall) {}

    fn handle_init_request(&self, _msg: InitRequest) -> Option<InitData> {
        None
    }

    fn handle_init_data(&self, _msg: InitData) {}
}

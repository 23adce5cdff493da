//! Client side of the handshake.
//!
//! `ClientHandshake` answers the core's replies: it logs in once registered,
//! runs setup first if the core asks for it and credentials for a backend
//! were given, and publishes its progress on a watch channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::channel::mpsc;
use link_core::message::{
    ClientDenied, ClientRegistered, Login, LoginFailed, LoginSuccess, RegisterClient,
    SessionState, SetupData, SetupDone, SetupFailed,
};
use link_core::{
    AuthHandler, Features, HandshakeMessage, HeartbeatConfig, ObjectSyncHandler, TransportFactory,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{Connection, ConnectionHandle, ConnectionOutcome};

/// Progress of a client handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeStatus {
    Pending,
    Denied(String),
    /// The core requires features this client does not support.
    IncompatibleFeatures(u32),
    /// The core is unconfigured and no setup was requested.
    SetupRequired,
    SetupFailed(String),
    LoginFailed(String),
    LoggedIn,
    Established(SessionState),
}

impl HandshakeStatus {
    /// True once the handshake can make no further progress.
    pub fn is_final(&self) -> bool {
        !matches!(self, HandshakeStatus::Pending | HandshakeStatus::LoggedIn)
    }
}

/// Who to log in as.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub client_version: String,
    pub build_date: String,
    /// Backend to configure if the core has not been set up yet.
    pub setup_backend: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            client_version: concat!("link-daemon ", env!("CARGO_PKG_VERSION")).to_string(),
            build_date: "unknown".to_string(),
            setup_backend: None,
        }
    }

    pub fn with_setup_backend(mut self, backend: impl Into<String>) -> Self {
        self.setup_backend = Some(backend.into());
        self
    }
}

pub struct ClientHandshake {
    credentials: Credentials,
    status: watch::Sender<HandshakeStatus>,
}

impl ClientHandshake {
    pub fn new(credentials: Credentials) -> (Self, watch::Receiver<HandshakeStatus>) {
        let (status, status_rx) = watch::channel(HandshakeStatus::Pending);
        (
            Self {
                credentials,
                status,
            },
            status_rx,
        )
    }

    /// The message that opens the handshake.
    pub fn register_message(&self) -> RegisterClient {
        RegisterClient {
            client_version: self.credentials.client_version.clone(),
            build_date: self.credentials.build_date.clone(),
        }
    }

    fn login(&self) -> Vec<HandshakeMessage> {
        vec![
            Login {
                user: self.credentials.user.clone(),
                password: self.credentials.password.clone(),
            }
            .into(),
        ]
    }

    fn report(&self, status: HandshakeStatus) {
        let _ = self.status.send(status);
    }
}

impl AuthHandler for ClientHandshake {
    fn handle_client_denied(&mut self, msg: ClientDenied) -> Vec<HandshakeMessage> {
        warn!("Core denied registration: {}", msg.error_string);
        self.report(HandshakeStatus::Denied(msg.error_string));
        Vec::new()
    }

    fn handle_client_registered(&mut self, msg: ClientRegistered) -> Vec<HandshakeMessage> {
        if !Features::accepts_wire(msg.core_features) {
            warn!(
                "Core requires unsupported features {:#06x} (supported: {})",
                msg.core_features,
                Features::supported()
            );
            self.report(HandshakeStatus::IncompatibleFeatures(msg.core_features));
            return Vec::new();
        }

        info!(
            "Registered with core (features: {:#06x}, up since {})",
            msg.core_features, msg.core_start_time
        );
        if msg.core_configured {
            return self.login();
        }

        match &self.credentials.setup_backend {
            Some(backend) => {
                info!("Core is unconfigured, setting it up with {}", backend);
                vec![
                    SetupData {
                        admin_user: self.credentials.user.clone(),
                        admin_password: self.credentials.password.clone(),
                        backend: backend.clone(),
                        setup_data: Default::default(),
                    }
                    .into(),
                ]
            }
            None => {
                warn!("Core is unconfigured and no setup backend was given");
                self.report(HandshakeStatus::SetupRequired);
                Vec::new()
            }
        }
    }

    fn handle_setup_failed(&mut self, msg: SetupFailed) -> Vec<HandshakeMessage> {
        warn!("Core setup failed: {}", msg.error_string);
        self.report(HandshakeStatus::SetupFailed(msg.error_string));
        Vec::new()
    }

    fn handle_setup_done(&mut self, _msg: SetupDone) -> Vec<HandshakeMessage> {
        self.login()
    }

    fn handle_login_failed(&mut self, msg: LoginFailed) -> Vec<HandshakeMessage> {
        warn!("Login failed: {}", msg.error_string);
        self.report(HandshakeStatus::LoginFailed(msg.error_string));
        Vec::new()
    }

    fn handle_login_success(&mut self, _msg: LoginSuccess) -> Vec<HandshakeMessage> {
        self.report(HandshakeStatus::LoggedIn);
        Vec::new()
    }

    fn handle_session_state(&mut self, msg: SessionState) -> Vec<HandshakeMessage> {
        if self.status.borrow().is_final() {
            warn!("Ignoring session state after the handshake already ended");
            return Vec::new();
        }
        info!(
            "Session started ({} networks, {} buffers)",
            msg.network_ids.len(),
            msg.buffer_infos.len()
        );
        self.report(HandshakeStatus::Established(msg));
        Vec::new()
    }
}

/// A client connection running on its own task.
pub struct ClientSession {
    pub handle: ConnectionHandle,
    pub status: watch::Receiver<HandshakeStatus>,
    pub task: JoinHandle<ConnectionOutcome>,
}

impl ClientSession {
    /// Wait until the handshake reaches a final status.
    ///
    /// If the connection ends first the last status seen is returned.
    pub async fn wait_for_handshake(&mut self) -> HandshakeStatus {
        let _ = self.status.wait_for(HandshakeStatus::is_final).await;
        self.status.borrow().clone()
    }
}

/// Open a connection to a core and start the handshake.
pub async fn connect<F>(
    factory: &F,
    address: &str,
    credentials: Credentials,
    features: Features,
    sync: Arc<dyn ObjectSyncHandler>,
    heartbeat: HeartbeatConfig,
) -> Result<ClientSession>
where
    F: TransportFactory,
    F::Transport: 'static,
{
    let (sink, events) = mpsc::unbounded();
    let transport = factory
        .connect(address, sink)
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;

    let (handshake, status) = ClientHandshake::new(credentials);
    let register = handshake.register_message();
    let (connection, handle) = Connection::new(
        address,
        transport,
        events,
        features,
        Box::new(handshake),
        sync,
        heartbeat,
    )?;

    handle.send(register)?;
    let task = tokio::spawn(connection.run());
    Ok(ClientSession {
        handle,
        status,
        task,
    })
}

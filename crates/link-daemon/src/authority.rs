//! Config-backed authentication for the core side of a connection.
//!
//! Every connection gets its own clone of `CoreAuthority`. Accounts and the
//! configured flag are shared between clones, so a setup performed on one
//! connection lets the next one log in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use link_core::message::{
    ClientDenied, ClientRegistered, Login, LoginFailed, LoginSuccess, RegisterClient,
    SessionState, SetupData, SetupDone, SetupFailed,
};
use link_core::value::project_list;
use link_core::{
    AuthHandler, BufferId, BufferInfo, BufferKind, Features, HandshakeMessage, NetworkId,
    ToDocument,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug)]
struct Accounts {
    users: HashMap<String, String>,
}

impl Accounts {
    fn is_configured(&self) -> bool {
        !self.users.is_empty()
    }
}

/// What the core tells clients about itself.
#[derive(Debug)]
struct CoreIdentity {
    version: String,
    build_date: String,
    start_time: DateTime<Utc>,
    features: Features,
    backends: Vec<Value>,
    network_ids: Vec<NetworkId>,
    buffers: Vec<BufferInfo>,
}

#[derive(Debug, Clone)]
pub struct CoreAuthority {
    accounts: Arc<RwLock<Accounts>>,
    identity: Arc<CoreIdentity>,
    /// Whether this connection has sent `RegisterClient`.
    registered: bool,
    peer: String,
}

impl CoreAuthority {
    pub fn from_config(config: &Config) -> Self {
        let users = config
            .users
            .iter()
            .map(|account| (account.user.clone(), account.password.clone()))
            .collect();
        let buffers = config
            .core
            .buffers
            .iter()
            .map(|buffer| {
                let kind = if buffer.name.starts_with('#') {
                    BufferKind::Channel
                } else {
                    BufferKind::Query
                };
                BufferInfo::new(
                    BufferId(buffer.id),
                    NetworkId(buffer.network),
                    kind,
                    buffer.name.clone(),
                )
            })
            .collect();

        Self {
            accounts: Arc::new(RwLock::new(Accounts { users })),
            identity: Arc::new(CoreIdentity {
                version: config.core.version.clone(),
                build_date: config.core.build_date.clone(),
                start_time: link_core::timestamp::now(),
                features: config.features(),
                backends: config.core.backends.clone(),
                network_ids: config.core.network_ids.iter().copied().map(NetworkId).collect(),
                buffers,
            }),
            registered: false,
            peer: String::new(),
        }
    }

    /// A fresh per-connection copy sharing accounts with `self`.
    pub fn for_connection(&self, peer: impl Into<String>) -> Self {
        Self {
            accounts: self.accounts.clone(),
            identity: self.identity.clone(),
            registered: false,
            peer: peer.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_configured()
    }

    pub fn version(&self) -> &str {
        &self.identity.version
    }

    pub fn build_date(&self) -> &str {
        &self.identity.build_date
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.identity.start_time
    }

    fn session_state(&self) -> SessionState {
        SessionState {
            identities: Vec::new(),
            buffer_infos: project_list(&self.identity.buffers),
            network_ids: self.identity.network_ids.iter().map(ToDocument::to_document).collect(),
        }
    }

    fn knows_backend(&self, backend: &str) -> bool {
        self.identity.backends.is_empty()
            || self
                .identity
                .backends
                .iter()
                .any(|b| b.get("DisplayName").and_then(Value::as_str) == Some(backend))
    }
}

impl AuthHandler for CoreAuthority {
    fn handle_register_client(&mut self, msg: RegisterClient) -> Vec<HandshakeMessage> {
        if msg.client_version.trim().is_empty() {
            warn!("Denying {}: no client version", self.peer);
            return vec![
                ClientDenied {
                    error_string: "Client version is missing".to_string(),
                }
                .into(),
            ];
        }

        info!(
            "Client {} registered ({}, built {}) with core {} (built {})",
            self.peer,
            msg.client_version,
            msg.build_date,
            self.identity.version,
            self.identity.build_date
        );
        self.registered = true;
        vec![
            ClientRegistered {
                core_features: u32::from(self.identity.features.bits()),
                core_configured: self.is_configured(),
                backend_info: self.identity.backends.clone(),
                core_start_time: self.identity.start_time,
            }
            .into(),
        ]
    }

    fn handle_setup_data(&mut self, msg: SetupData) -> Vec<HandshakeMessage> {
        let failed = |reason: &str| -> Vec<HandshakeMessage> {
            vec![
                SetupFailed {
                    error_string: reason.to_string(),
                }
                .into(),
            ]
        };

        if !self.registered {
            return failed("Client is not registered");
        }
        if msg.admin_user.trim().is_empty() {
            return failed("Admin user name must not be empty");
        }
        if !self.knows_backend(&msg.backend) {
            return failed("Unknown storage backend");
        }

        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if accounts.is_configured() {
            return failed("Core is already configured");
        }
        accounts.users.insert(msg.admin_user.clone(), msg.admin_password);
        info!(
            "Core configured by {} with backend {} (admin: {})",
            self.peer, msg.backend, msg.admin_user
        );
        vec![SetupDone {}.into()]
    }

    fn handle_login(&mut self, msg: Login) -> Vec<HandshakeMessage> {
        let failed = |reason: &str| -> Vec<HandshakeMessage> {
            vec![
                LoginFailed {
                    error_string: reason.to_string(),
                }
                .into(),
            ]
        };

        if !self.registered {
            return failed("Client is not registered");
        }
        let accepted = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            if !accounts.is_configured() {
                return failed("Core is not configured");
            }
            accounts.users.get(&msg.user) == Some(&msg.password)
        };
        if !accepted {
            warn!("Rejected login for {} from {}", msg.user, self.peer);
            return failed("Invalid username or password!");
        }

        info!("User {} logged in from {}", msg.user, self.peer);
        vec![LoginSuccess {}.into(), self.session_state().into()]
    }
}

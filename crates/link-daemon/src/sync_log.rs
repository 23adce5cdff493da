//! Object-sync handler that logs traffic and remembers object state.
//!
//! `InitData` received for an object is kept, so a later `InitRequest` for
//! the same object can be answered from it. Sync calls and RPCs are logged
//! and counted; only the most recent sync calls are kept.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use link_core::message::{InitData, InitRequest, RpcCall, SyncMessage};
use link_core::{Document, ObjectSyncHandler};
use tracing::{debug, info};

/// Sync calls kept by `LoggingSyncHandler::recent_syncs`.
pub const RECENT_SYNCS: usize = 64;

#[derive(Debug, Default)]
pub struct LoggingSyncHandler {
    objects: Mutex<HashMap<(String, String), Document>>,
    recent_syncs: Mutex<VecDeque<SyncMessage>>,
    sync_calls: AtomicUsize,
    rpc_calls: AtomicUsize,
}

impl LoggingSyncHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last `RECENT_SYNCS` sync calls, oldest first.
    pub fn recent_syncs(&self) -> Vec<SyncMessage> {
        self.recent_syncs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn sync_count(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn rpc_count(&self) -> usize {
        self.rpc_calls.load(Ordering::SeqCst)
    }

    /// Last known state of an object.
    pub fn object(&self, class_name: &str, object_name: &str) -> Option<Document> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(class_name.to_string(), object_name.to_string()))
            .cloned()
    }
}

impl ObjectSyncHandler for LoggingSyncHandler {
    fn handle_sync(&self, msg: SyncMessage) {
        info!(
            "Sync {}::{} {} ({} params)",
            msg.class_name,
            msg.object_name,
            msg.slot_name,
            msg.params.len()
        );
        let mut recent = self.recent_syncs.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == RECENT_SYNCS {
            recent.pop_front();
        }
        recent.push_back(msg);
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_rpc_call(&self, msg: RpcCall) {
        info!("RPC {} ({} params)", msg.slot_name, msg.params.len());
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_init_request(&self, msg: InitRequest) -> Option<InitData> {
        let known = self.object(&msg.class_name, &msg.object_name);
        debug!(
            "Init request for {}::{} ({})",
            msg.class_name,
            msg.object_name,
            if known.is_some() { "known" } else { "unknown" }
        );
        known.map(|init_data| InitData {
            class_name: msg.class_name,
            object_name: msg.object_name,
            init_data,
        })
    }

    fn handle_init_data(&self, msg: InitData) {
        debug!("Init data for {}::{}", msg.class_name, msg.object_name);
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((msg.class_name, msg.object_name), msg.init_data);
    }
}

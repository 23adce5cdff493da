//! State shared between a socket transport and its I/O tasks.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use link_core::{Frame, SocketState, TransportEvent, TransportSink};
use tracing::debug;

/// Commands from a transport to its writer task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(Frame),
    Flush,
    /// Send any goodbye the protocol has, then shut the write side.
    Close,
}

#[derive(Debug)]
pub(crate) struct SocketShared {
    label: String,
    state: RwLock<SocketState>,
    error: RwLock<Option<String>>,
    disconnected: AtomicBool,
    events: TransportSink,
}

impl SocketShared {
    pub(crate) fn new(label: String, events: TransportSink) -> Self {
        Self {
            label,
            state: RwLock::new(SocketState::Connected),
            error: RwLock::new(None),
            disconnected: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn state(&self) -> SocketState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        let mut current = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            *current = state;
            drop(current);
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.error.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Remember `error` and report it.
    pub(crate) fn fail(&self, error: String) {
        *self.error.write().unwrap_or_else(|e| e.into_inner()) = Some(error.clone());
        self.emit(TransportEvent::Error(error));
    }

    pub(crate) fn deliver(&self, frame: Frame) {
        self.emit(TransportEvent::Frame(frame));
    }

    /// Mark the socket gone. Only the first call reports `Disconnected`.
    pub(crate) fn finish(&self) {
        self.set_state(SocketState::Unconnected);
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            debug!("Connection {} closed", self.label);
            self.emit(TransportEvent::Disconnected);
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.unbounded_send(event);
    }
}

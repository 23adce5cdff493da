//! Connection driver.
//!
//! A `Connection` owns one `Peer` and runs it on a tokio task: transport
//! events go into the peer, peer events are acted on, and once the session
//! is established a heartbeat goes out every interval. Everything else talks
//! to the connection through a cloneable `ConnectionHandle`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use link_core::timestamp;
use link_core::{
    AuthHandler, Features, HeartbeatAction, HeartbeatConfig, HeartbeatMonitor, ObjectSyncHandler,
    Peer, PeerError, PeerEvent, Phase, ProtocolMessage, Transport, TransportEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

/// How long a graceful close may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Command {
    Dispatch(ProtocolMessage),
    Close,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Closed locally through the handle.
    Closed,
    /// The remote went away.
    Disconnected,
    /// The remote sent something the protocol does not allow.
    ProtocolError(String),
    /// Too many heartbeats went unanswered.
    HeartbeatTimeout { missed: u32 },
}

/// Control side of a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
    lag: watch::Receiver<Option<Duration>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a message for the peer.
    ///
    /// Fails only when the connection is gone. A message from the wrong
    /// family for the current phase is refused by the peer and logged.
    pub fn send(&self, message: impl Into<ProtocolMessage>) -> Result<()> {
        self.commands
            .send(Command::Dispatch(message.into()))
            .map_err(|_| anyhow!("Connection {} is closed", self.id))
    }

    /// Ask the connection to close gracefully.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.phase() == Phase::Established
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait for the handshake to finish. Returns false if the connection
    /// ended first.
    pub async fn wait_established(&self) -> bool {
        let mut phase = self.phase.clone();
        phase.wait_for(|p| *p == Phase::Established).await.is_ok()
    }

    /// Round-trip time from the latest heartbeat reply.
    pub fn lag(&self) -> Option<Duration> {
        *self.lag.borrow()
    }
}

pub struct Connection<T: Transport> {
    id: String,
    peer: Peer<T>,
    peer_events: UnboundedReceiver<PeerEvent>,
    transport_events: UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    heartbeat: HeartbeatMonitor,
    phase_tx: watch::Sender<Phase>,
    lag_tx: watch::Sender<Option<Duration>>,
}

impl<T: Transport> Connection<T> {
    /// Build a connection around a transport and the receiver of its events.
    pub fn new(
        id: impl Into<String>,
        transport: T,
        transport_events: UnboundedReceiver<TransportEvent>,
        features: Features,
        auth: Box<dyn AuthHandler>,
        sync: Arc<dyn ObjectSyncHandler>,
        heartbeat: HeartbeatConfig,
    ) -> std::result::Result<(Self, ConnectionHandle), PeerError> {
        let id = id.into();
        let (peer, peer_events) = Peer::new(transport, features, auth, sync)?;
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (phase_tx, phase) = watch::channel(peer.phase());
        let (lag_tx, lag) = watch::channel(None);

        let handle = ConnectionHandle {
            id: id.clone(),
            commands: commands_tx,
            phase,
            lag,
        };
        let connection = Self {
            id,
            peer,
            peer_events,
            transport_events,
            commands,
            heartbeat: HeartbeatMonitor::new(heartbeat),
            phase_tx,
            lag_tx,
        };
        Ok((connection, handle))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Drive the connection until it ends.
    pub async fn run(mut self) -> ConnectionOutcome {
        let mut ticker = interval(self.heartbeat.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            "Connection {} running over {} ({:?})",
            self.id,
            self.peer.protocol_name(),
            self.peer.peer_address()
        );

        loop {
            tokio::select! {
                event = self.transport_events.next() => match event {
                    Some(event) => self.peer.on_transport_event(event),
                    None => return self.finish(ConnectionOutcome::Disconnected),
                },
                Some(event) = self.peer_events.next() => {
                    if let Some(outcome) = self.on_peer_event(event) {
                        return self.finish(outcome);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Dispatch(message)) => {
                        if let Err(e) = self.peer.dispatch(message) {
                            warn!("Failed to send on {}: {}", self.id, e);
                        }
                    }
                    Some(Command::Close) | None => {
                        self.close_gracefully().await;
                        return self.finish(ConnectionOutcome::Closed);
                    }
                },
                _ = ticker.tick(), if self.peer.is_established() => {
                    match self.heartbeat.tick(timestamp::now()) {
                        HeartbeatAction::Send(beat) => {
                            if let Err(e) = self.peer.dispatch(beat) {
                                warn!("Failed to send heartbeat on {}: {}", self.id, e);
                            }
                        }
                        HeartbeatAction::TimedOut { missed } => {
                            warn!("Connection {} missed {} heartbeats, dropping", self.id, missed);
                            self.peer.abort();
                            return self.finish(ConnectionOutcome::HeartbeatTimeout { missed });
                        }
                    }
                }
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) -> Option<ConnectionOutcome> {
        match event {
            PeerEvent::Established => {
                info!("Connection {} established", self.id);
                let _ = self.phase_tx.send(Phase::Established);
                None
            }
            PeerEvent::LagUpdated { lag, .. } => {
                debug!("Connection {} lag: {:?}", self.id, lag);
                self.heartbeat.on_reply(lag);
                let _ = self.lag_tx.send(Some(lag));
                None
            }
            PeerEvent::ProtocolError(description) => {
                warn!("Closing {}: {}", self.id, description);
                self.peer.close();
                Some(ConnectionOutcome::ProtocolError(description))
            }
            PeerEvent::SendFailed(reason) => {
                warn!("Reply on {} was not sent: {}", self.id, reason);
                None
            }
            PeerEvent::TransportError(error) => {
                warn!("Transport error on {}: {}", self.id, error);
                None
            }
            PeerEvent::StateChanged(state) => {
                debug!("Connection {} is now {:?}", self.id, state);
                None
            }
            PeerEvent::Disconnected => Some(ConnectionOutcome::Disconnected),
        }
    }

    /// Start a graceful close and wait for the transport to confirm it.
    async fn close_gracefully(&mut self) {
        self.peer.close();
        let drained = timeout(CLOSE_TIMEOUT, async {
            while let Some(event) = self.transport_events.next().await {
                if event == TransportEvent::Disconnected {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("Connection {} did not close in time, aborting", self.id);
            self.peer.abort();
        }
    }

    fn finish(&self, outcome: ConnectionOutcome) -> ConnectionOutcome {
        info!("Connection {} ended: {:?}", self.id, outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use link_core::message::{HeartBeat, SessionState, SetupDone};
    use link_core::{Frame, MemoryTransport, NullSyncHandler};

    struct Silent;
    impl AuthHandler for Silent {}

    fn connection(
        heartbeat: HeartbeatConfig,
    ) -> (
        Connection<MemoryTransport>,
        ConnectionHandle,
        MemoryTransport,
        fmpsc::UnboundedSender<TransportEvent>,
    ) {
        let wire = MemoryTransport::default();
        let (sink, events) = fmpsc::unbounded();
        let (connection, handle) = Connection::new(
            "conn-test",
            wire.clone(),
            events,
            Features::NONE,
            Box::new(Silent),
            Arc::new(NullSyncHandler),
            heartbeat,
        )
        .unwrap();
        (connection, handle, wire, sink)
    }

    fn quick_heartbeat(max_missed: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(20),
            max_missed,
        }
    }

    #[tokio::test]
    async fn test_remote_disconnect_ends_connection() {
        let (connection, handle, _wire, sink) = connection(HeartbeatConfig::default());
        let task = tokio::spawn(connection.run());
        sink.unbounded_send(TransportEvent::Disconnected).unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(outcome, ConnectionOutcome::Disconnected);
        assert!(!handle.wait_established().await);
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let (connection, _handle, wire, sink) = connection(HeartbeatConfig::default());
        let task = tokio::spawn(connection.run());
        sink.unbounded_send(TransportEvent::Frame(Frame::Text("not-json".into())))
            .unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ConnectionOutcome::ProtocolError("Invalid handshake message!".into())
        );
        assert!(!wire.is_open());
    }

    #[tokio::test]
    async fn test_handle_dispatches_and_tracks_phase() {
        let (connection, handle, wire, _sink) = connection(HeartbeatConfig::default());
        let task = tokio::spawn(connection.run());

        handle.send(SetupDone {}).unwrap();
        handle.send(SessionState::default()).unwrap();
        assert!(timeout(Duration::from_secs(2), handle.wait_established()).await.unwrap());
        assert!(handle.is_established());

        let sent: Vec<serde_json::Value> = wire
            .take_sent()
            .iter()
            .map(|f| serde_json::from_slice(f.as_bytes()).unwrap())
            .collect();
        assert_eq!(sent[0]["type"], "SetupDone");
        assert_eq!(sent[1]["type"], "SessionState");

        task.abort();
    }

    #[tokio::test]
    async fn test_heartbeats_only_after_establishment() {
        let (connection, handle, wire, _sink) = connection(quick_heartbeat(100));
        let task = tokio::spawn(connection.run());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(wire.sent_count(), 0);

        handle.send(SessionState::default()).unwrap();
        handle.wait_established().await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let beats = wire
            .take_sent()
            .iter()
            .filter(|f| {
                let doc: serde_json::Value = serde_json::from_slice(f.as_bytes()).unwrap();
                doc["type"] == "HeartBeat"
            })
            .count();
        assert!(beats >= 1, "expected heartbeats, got {beats}");

        task.abort();
    }

    #[tokio::test]
    async fn test_unanswered_heartbeats_time_out() {
        let (connection, handle, _wire, _sink) = connection(quick_heartbeat(2));
        let task = tokio::spawn(connection.run());
        handle.send(SessionState::default()).unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(outcome, ConnectionOutcome::HeartbeatTimeout { missed: 2 });
    }

    #[tokio::test]
    async fn test_heartbeat_reply_updates_lag() {
        let (connection, handle, _wire, sink) = connection(HeartbeatConfig::default());
        let task = tokio::spawn(connection.run());
        handle.send(SessionState::default()).unwrap();
        handle.wait_established().await;

        let beat = HeartBeat::now();
        let reply = serde_json::json!({
            "type": "HeartBeatReply",
            "timestamp": timestamp::format_timestamp(&beat.timestamp),
        });
        sink.unbounded_send(TransportEvent::Frame(Frame::Text(reply.to_string())))
            .unwrap();

        let mut lag = handle.lag.clone();
        timeout(Duration::from_secs(2), lag.wait_for(|l| l.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.lag().is_some());

        task.abort();
    }

    #[tokio::test]
    async fn test_close_through_handle() {
        let (connection, handle, _wire, sink) = connection(HeartbeatConfig::default());
        let task = tokio::spawn(connection.run());
        handle.close();
        // MemoryTransport has no socket to confirm the close; stand in for it.
        sink.unbounded_send(TransportEvent::Disconnected).unwrap();

        let outcome = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            ConnectionOutcome::Closed | ConnectionOutcome::Disconnected
        ));
        assert!(handle.send(SetupDone {}).is_err());
    }
}

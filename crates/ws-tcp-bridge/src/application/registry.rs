//! BridgeRegistry and EventDispatch: session events in, bridges out.
//!
//! The framed-protocol layer reports four things about each session: it
//! opened, a message arrived, it closed, it failed.  [`EventDispatch`] turns
//! those into bridge lifecycle calls and owns every [`ConnectionBridge`]
//! through a [`BridgeRegistry`].
//!
//! # Concurrency
//!
//! One task runs [`EventDispatch::run`] and is the only code that ever
//! touches the registry.  Events arrive one at a time on a channel, so there
//! is no lock: exclusivity comes from ownership, not from a mutex.
//!
//! ```text
//! ws_server tasks ──SessionEvent──► mpsc ──► EventDispatch::run
//!                                              ├─ on_open    → ConnectionBridge::open + start
//!                                              ├─ on_message → bridge.send
//!                                              └─ on_close / on_fail → bridge.stop, drop
//! ```

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::application::bridge::ConnectionBridge;
use crate::domain::{ClientSession, CloseStatus, SessionEvent, SessionId};
use crate::infrastructure::transport::UpstreamConnector;

/// Close reason sent to every client when the server stops.
pub const REASON_SERVER_QUIT: &str = "websocket server quit";

/// Owning map from session to bridge.
///
/// A session appears at most once.  Removing an entry hands ownership of the
/// bridge back to the caller, who decides when it is destroyed.
#[derive(Default)]
pub struct BridgeRegistry {
    bridges: HashMap<SessionId, ConnectionBridge>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.bridges.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ConnectionBridge> {
        self.bridges.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut ConnectionBridge> {
        self.bridges.get_mut(&id)
    }

    /// Inserts `bridge` under its session id.
    ///
    /// # Errors
    ///
    /// Hands the bridge back if the session already has one; the existing
    /// entry is left untouched.
    pub fn insert(&mut self, bridge: ConnectionBridge) -> Result<(), ConnectionBridge> {
        let id = bridge.session_id();
        if self.bridges.contains_key(&id) {
            return Err(bridge);
        }
        self.bridges.insert(id, bridge);
        Ok(())
    }

    pub fn remove(&mut self, id: SessionId) -> Option<ConnectionBridge> {
        self.bridges.remove(&id)
    }

    /// Removes and returns every bridge.
    pub fn drain(&mut self) -> impl Iterator<Item = ConnectionBridge> + '_ {
        self.bridges.drain().map(|(_, bridge)| bridge)
    }
}

/// Routes session events to bridges.
pub struct EventDispatch {
    registry: BridgeRegistry,
    upstream: UpstreamConnector,
}

impl EventDispatch {
    pub fn new(upstream: UpstreamConnector) -> Self {
        Self {
            registry: BridgeRegistry::new(),
            upstream,
        }
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Creates, registers and starts a bridge for a newly opened session.
    ///
    /// A second open for a session that already has a bridge is a bug in the
    /// session layer; it is logged and ignored.
    pub fn on_open(&mut self, id: SessionId, session: Weak<dyn ClientSession>) {
        if self.registry.contains(id) {
            error!("session {id}: opened twice; keeping the existing bridge");
            return;
        }

        let bridge = ConnectionBridge::open(id, session, &self.upstream);
        match self.registry.insert(bridge) {
            Ok(()) => {
                if let Some(bridge) = self.registry.get_mut(id) {
                    bridge.start();
                }
                debug!("session {id}: bridge registered ({} live)", self.registry.len());
            }
            Err(_duplicate) => {
                error!("session {id}: registry rejected a duplicate bridge");
            }
        }
    }

    /// Forwards a client message to the session's bridge, if it has one.
    pub fn on_message(&mut self, id: SessionId, payload: Vec<u8>) {
        match self.registry.get(id) {
            Some(bridge) => bridge.send(payload),
            None => debug!(
                "session {id}: message for unbridged session ignored ({} byte(s))",
                payload.len()
            ),
        }
    }

    pub fn on_close(&mut self, id: SessionId) {
        self.teardown(id, "closed");
    }

    pub fn on_fail(&mut self, id: SessionId) {
        self.teardown(id, "failed");
    }

    fn teardown(&mut self, id: SessionId, why: &str) {
        match self.registry.remove(id) {
            Some(mut bridge) => {
                bridge.stop();
                drop(bridge);
                debug!(
                    "session {id}: {why}; bridge removed ({} live)",
                    self.registry.len()
                );
            }
            None => debug!("session {id}: {why}, but no bridge was registered"),
        }
    }

    /// Stops every bridge and tells every client the server is going away.
    pub fn shutdown(&mut self) {
        let mut stopped = 0usize;
        for mut bridge in self.registry.drain() {
            bridge.stop();
            bridge.close_session(CloseStatus::GoingAway, REASON_SERVER_QUIT);
            stopped += 1;
        }
        info!("dispatcher shut down; stopped {stopped} bridge(s)");
    }

    /// Applies one event.  `Break` after a shutdown.
    pub fn handle(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Open { id, session } => self.on_open(id, session),
            SessionEvent::Message { id, payload } => self.on_message(id, payload),
            SessionEvent::Close { id } => self.on_close(id),
            SessionEvent::Fail { id } => self.on_fail(id),
            SessionEvent::Shutdown => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Consumes events until a shutdown event arrives or every sender is
    /// gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if self.handle(event).is_break() {
                return;
            }
        }
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

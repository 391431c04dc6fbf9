//! The contract between the bridging engine and the framed-protocol layer.
//!
//! The engine never touches WebSocket types directly.  It sees a client
//! session only through [`ClientSession`] and learns about the session's
//! lifecycle only through [`SessionEvent`]s.  The WebSocket server in
//! `infrastructure::ws_server` is one implementation; tests supply others.
//!
//! # Ownership
//!
//! The framed-protocol layer owns each session.  Everything else holds a
//! [`Weak`] handle, so a bridge can never keep a session alive after the
//! layer that owns it has let go.

use std::fmt;
use std::sync::Weak;

use uuid::Uuid;

/// Opaque, unique identifier for one client session.
///
/// This is the registry key.  A fresh random UUID is drawn for every accepted
/// connection, so identifiers are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The short form keeps log lines readable; collisions in the first
        // eight hex digits only make logs ambiguous, never the registry.
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Lifecycle of a client session as seen by the framed-protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake still in progress.
    Connecting,
    /// Messages may be sent.
    Open,
    /// A close was requested; no further messages will be sent.
    Closing,
    /// The session is gone.
    Closed,
}

/// How an outbound payload should be framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Binary,
}

/// Status attached to a session close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// The bridge finished or failed in an orderly way.
    Normal,
    /// The server is shutting down.
    GoingAway,
}

impl CloseStatus {
    /// RFC 6455 close code for this status.
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
        }
    }
}

/// Per-session primitives the bridging engine consumes.
///
/// Implementations must be cheap and non-blocking: every method is called
/// from the dispatcher or a relay task and must only enqueue work.
#[cfg_attr(test, mockall::automock)]
pub trait ClientSession: Send + Sync {
    /// Queues one outbound message.  Ignored unless the session is open.
    fn send(&self, payload: Vec<u8>, kind: MessageKind);

    /// Requests closure with a status and a human-readable reason.
    ///
    /// Idempotent: only the first call on an open session has an effect.
    fn close(&self, status: CloseStatus, reason: &str);

    /// Current lifecycle state.
    fn state(&self) -> SessionState;
}

/// Events delivered by the framed-protocol layer, one at a time, in the
/// order they occurred.
#[derive(Debug)]
pub enum SessionEvent {
    /// A session finished its handshake.
    Open {
        id: SessionId,
        session: Weak<dyn ClientSession>,
    },
    /// A complete message arrived from the client.
    Message { id: SessionId, payload: Vec<u8> },
    /// The session closed cleanly.
    Close { id: SessionId },
    /// The session failed (protocol or I/O error).
    Fail { id: SessionId },
    /// The server is stopping; tear every bridge down.
    Shutdown,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! ConnectionBridge: one client session paired with one upstream socket.
//!
//! # Lifecycle
//!
//! ```text
//!             connect ok + start()               read/write failure, EOF
//! Starting ───────────────────────► Active ───────────────────────────┐
//!    │                                 │ stop()                        │
//!    │ connect failure / stop()        ▼                               ▼
//!    └──────────────────────────► Stopping ─────── relay task done ──► Stopped
//! ```
//!
//! Construction spawns a relay task that resolves and connects the upstream
//! socket straight away.  The task enters the read loop only after *both*
//! the connect has completed and [`ConnectionBridge::start`] has been called,
//! so a read is never issued against a socket that is still connecting.
//!
//! # Cancellation
//!
//! [`ConnectionBridge::stop`] flips the lifecycle to `Stopping` and cancels a
//! [`CancellationToken`].  The relay task checks both before acting on any
//! completion, so a read that completes after `stop()` is dropped silently:
//! no re-arm, no failure report.  The bridge itself never has to outlive its
//! registry entry for this to hold.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::{ClientSession, CloseStatus, MessageKind, SessionId, SessionState};
use crate::infrastructure::transport::{TransportSocket, UpstreamConnector};

/// Size of the per-bridge upstream read buffer.
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

pub const REASON_CONNECT_FAILED: &str = "cannot establish upstream connection";
pub const REASON_UPSTREAM_EOF: &str = "upstream closed the connection";
pub const REASON_READ_FAILED: &str = "failed to receive data from upstream";
pub const REASON_WRITE_FAILED: &str = "cannot write to upstream";
pub const REASON_BRIDGE_CLOSED: &str = "closing connection";

/// Lifecycle state of a [`ConnectionBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Starting = 0,
    Active = 1,
    Stopping = 2,
    Stopped = 3,
}

impl BridgeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BridgeState::Starting,
            1 => BridgeState::Active,
            2 => BridgeState::Stopping,
            _ => BridgeState::Stopped,
        }
    }
}

/// Shared between the bridge and its relay task.
///
/// Every transition is a compare-and-swap, so exactly one side wins the move
/// into `Stopping` and only that side may report a failure.
#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(BridgeState::Starting as u8))
    }

    fn get(&self) -> BridgeState {
        BridgeState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Starting → Active`.
    fn activate(&self) -> bool {
        self.transition(BridgeState::Starting, BridgeState::Active)
    }

    /// `Starting | Active → Stopping`.  `false` if someone else got there
    /// first.
    fn begin_stop(&self) -> bool {
        self.transition(BridgeState::Starting, BridgeState::Stopping)
            || self.transition(BridgeState::Active, BridgeState::Stopping)
    }

    fn finish(&self) {
        self.0.store(BridgeState::Stopped as u8, Ordering::Release);
    }
}

/// What the relay task needs to talk back to its session.
#[derive(Clone)]
struct RelayContext {
    id: SessionId,
    session: Weak<dyn ClientSession>,
    lifecycle: Arc<Lifecycle>,
    cancel: CancellationToken,
}

impl RelayContext {
    /// `true` once `stop()` has run or the bridge has been dropped.
    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The session, if it still exists and is open.
    fn open_session(&self) -> Option<Arc<dyn ClientSession>> {
        self.session
            .upgrade()
            .filter(|s| s.state() == SessionState::Open)
    }

    fn close_session(&self, status: CloseStatus, reason: &str) {
        if let Some(session) = self.open_session() {
            session.close(status, reason);
        }
    }

    /// Moves to `Stopping` and, if this side won the move, closes the session
    /// with `reason`.
    fn fail(&self, reason: &str) {
        if self.lifecycle.begin_stop() {
            info!("session {}: {reason}", self.id);
            self.close_session(CloseStatus::Normal, reason);
        }
    }
}

/// Why the relay loop returned.
#[derive(Debug)]
enum RelayEnd {
    /// `stop()` ran or the bridge was dropped.
    Cancelled,
    /// The client session is gone or no longer open.
    SessionGone,
    /// The upstream peer closed its side.
    UpstreamEof,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

impl RelayEnd {
    /// The upstream I/O error behind this end, if any.
    fn io_error(&self) -> Option<&io::Error> {
        match self {
            RelayEnd::ReadFailed(e) | RelayEnd::WriteFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Reason to close the session with, or `None` if nobody should be told.
    fn close_reason(&self) -> Option<&'static str> {
        match self {
            RelayEnd::Cancelled | RelayEnd::SessionGone => None,
            RelayEnd::UpstreamEof => Some(REASON_UPSTREAM_EOF),
            RelayEnd::ReadFailed(_) => Some(REASON_READ_FAILED),
            RelayEnd::WriteFailed(_) => Some(REASON_WRITE_FAILED),
        }
    }
}

/// Relays bytes between one client session and one upstream socket.
///
/// Owned by the registry.  Holds only a [`Weak`] handle to its session.
pub struct ConnectionBridge {
    id: SessionId,
    ctx: RelayContext,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    arm: Option<oneshot::Sender<()>>,
}

impl ConnectionBridge {
    /// Creates the bridge and immediately starts connecting upstream.
    ///
    /// Must be called from within a tokio runtime.  If the connect fails the
    /// session is closed with [`REASON_CONNECT_FAILED`] and the bridge ends up
    /// `Stopped` without ever becoming `Active`.
    pub fn open(
        id: SessionId,
        session: Weak<dyn ClientSession>,
        upstream: &UpstreamConnector,
    ) -> Self {
        let ctx = RelayContext {
            id,
            session,
            lifecycle: Arc::new(Lifecycle::new()),
            cancel: CancellationToken::new(),
        };
        let (outbound, writes) = mpsc::unbounded_channel();
        let (arm, armed) = oneshot::channel();

        debug!(
            "session {id}: connecting to upstream {} ({:?})",
            upstream.target(),
            upstream.kind()
        );
        tokio::spawn(drive(upstream.socket(), ctx.clone(), armed, writes));

        Self {
            id,
            ctx,
            outbound,
            arm: Some(arm),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        self.ctx.lifecycle.get()
    }

    /// Arms the upstream read loop.
    ///
    /// The loop starts as soon as the connect completes (or right away if it
    /// already has); the bridge becomes `Active` at that point.  Calling this
    /// more than once has no further effect.
    pub fn start(&mut self) {
        if let Some(arm) = self.arm.take() {
            // The task may already be gone after a failed connect.
            let _ = arm.send(());
        }
    }

    /// Queues `payload` for the upstream socket.
    ///
    /// Payloads are written in the order `send` was called.  Failures are
    /// never returned: a write error closes the client session with
    /// [`REASON_WRITE_FAILED`].
    pub fn send(&self, payload: Vec<u8>) {
        match self.state() {
            BridgeState::Stopping | BridgeState::Stopped => {
                debug!(
                    "session {}: bridge is stopping; dropping {} byte(s)",
                    self.id,
                    payload.len()
                );
            }
            BridgeState::Starting | BridgeState::Active => {
                let len = payload.len();
                if self.outbound.send(payload).is_err() {
                    debug!("session {}: relay task gone; dropping {len} byte(s)", self.id);
                }
            }
        }
    }

    /// Cancels any outstanding upstream I/O and closes the upstream socket.
    ///
    /// Idempotent, and safe on a bridge that never became `Active`.
    pub fn stop(&mut self) {
        // Dropping the arm signal keeps a not-yet-started relay from reading.
        self.arm.take();
        if self.ctx.lifecycle.begin_stop() {
            debug!("session {}: stopping bridge", self.id);
        }
        self.ctx.cancel.cancel();
    }

    /// Closes the client session if it is still open.
    pub fn close_session(&self, status: CloseStatus, reason: &str) {
        self.ctx.close_session(status, reason);
    }
}

impl Drop for ConnectionBridge {
    fn drop(&mut self) {
        self.stop();
        // Never leave the session dangling without its upstream.
        self.ctx.close_session(CloseStatus::Normal, REASON_BRIDGE_CLOSED);
    }
}

// ── Relay task ────────────────────────────────────────────────────────────────

/// Body of the per-bridge task: connect, wait for `start()`, relay, close.
async fn drive(
    mut socket: TransportSocket,
    ctx: RelayContext,
    armed: oneshot::Receiver<()>,
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let id = ctx.id;

    let connected = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => None,
        result = socket.connect() => Some(result),
    };
    match connected {
        None => {
            debug!("session {id}: stopped while connecting");
        }
        Some(Err(e)) => {
            warn!("session {id}: {e}");
            ctx.fail(REASON_CONNECT_FAILED);
        }
        Some(Ok(())) => {
            let start = tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => false,
                result = armed => result.is_ok(),
            };
            if start && !ctx.is_cancelled() && ctx.lifecycle.activate() {
                info!("session {id}: bridged to upstream {}", socket.target());
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                let end = relay(&mut socket, &mut buf, &ctx, &mut writes).await;
                settle(&ctx, &end);
            }
        }
    }

    // Covers the paths that never reached the relay loop.
    ctx.lifecycle.begin_stop();
    socket.close().await;
    ctx.lifecycle.finish();
    debug!("session {id}: bridge stopped");
}

/// Moves the bridge to `Stopping` after the relay loop returns, telling the
/// session why when there is something to tell.
fn settle(ctx: &RelayContext, end: &RelayEnd) {
    debug!("session {}: relay ended: {end:?}", ctx.id);
    if let Some(e) = end.io_error() {
        warn!("session {}: upstream I/O failed: {e}", ctx.id);
    }
    match end.close_reason() {
        Some(reason) => ctx.fail(reason),
        None => {
            ctx.lifecycle.begin_stop();
        }
    }
}

/// Pumps bytes both ways until something ends the session.
///
/// Only one read is ever outstanding.  Writes are applied one at a time in
/// queue order.  Every completion is checked against the cancellation token
/// before it is acted on.
async fn relay<S>(
    stream: &mut S,
    buf: &mut [u8],
    ctx: &RelayContext,
    writes: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> RelayEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => return RelayEnd::Cancelled,

            read = stream.read(&mut buf[..]) => {
                if ctx.is_cancelled() {
                    return RelayEnd::Cancelled;
                }
                match read {
                    Ok(0) => return RelayEnd::UpstreamEof,
                    Ok(n) => {
                        let Some(session) = ctx.open_session() else {
                            return RelayEnd::SessionGone;
                        };
                        debug!("session {}: upstream → client {n} byte(s)", ctx.id);
                        trace!("session {}: upstream → client\n{}", ctx.id, HexDump(&buf[..n]));
                        // One read completion becomes exactly one frame.
                        session.send(buf[..n].to_vec(), MessageKind::Binary);
                    }
                    Err(e) => return RelayEnd::ReadFailed(e),
                }
            }

            payload = writes.recv() => {
                let Some(payload) = payload else {
                    // The bridge was dropped.
                    return RelayEnd::Cancelled;
                };
                if ctx.is_cancelled() {
                    return RelayEnd::Cancelled;
                }
                debug!("session {}: client → upstream {} byte(s)", ctx.id, payload.len());
                trace!("session {}: client → upstream\n{}", ctx.id, HexDump(&payload));
                let written = tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => return RelayEnd::Cancelled,
                    result = stream.write_all(&payload) => result,
                };
                if let Err(e) = written {
                    return RelayEnd::WriteFailed(e);
                }
            }
        }
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// Classic hex + ASCII dump, 16 bytes per line.  Formatting only happens if
/// the log line is actually emitted.
struct HexDump<'a>(&'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (line, chunk) in self.0.chunks(16).enumerate() {
            if line > 0 {
                writeln!(f)?;
            }
            write!(f, "{:08x}  ", line * 16)?;
            for slot in 0..16 {
                match chunk.get(slot) {
                    Some(byte) => write!(f, "{byte:02x} ")?,
                    None => f.write_str("   ")?,
                }
            }
            f.write_str("|")?;
            for &byte in chunk {
                let shown = if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                };
                write!(f, "{shown}")?;
            }
            f.write_str("|")?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

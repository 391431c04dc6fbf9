//! WebSocket server: accept loop, per-session tasks, and the
//! [`ClientSession`] implementation the bridging engine talks to.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each accepted connection to a WebSocket session.
//! 3. Reporting each session's lifecycle to the dispatcher as
//!    [`SessionEvent`]s (open, message, close, fail).
//! 4. Writing whatever the bridge queues on a [`WsSession`] back to the
//!    browser, including the final Close frame.
//! 5. Shutting down gracefully when the `running` flag is cleared.
//!
//! # Per-session tasks
//!
//! ```text
//!                 ┌──────── reader (this task) ──── SessionEvent ──► dispatcher
//! WebSocket ──────┤
//!                 └──────── writer task ◄── WsMessage queue ◄── WsSession::send/close
//! ```
//!
//! The session task holds the only strong reference to its [`WsSession`].
//! When the reader finishes, that reference is dropped, the outbound queue
//! closes, and the writer flushes and exits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};

use crate::application::registry::REASON_SERVER_QUIT;
use crate::application::EventDispatch;
use crate::domain::{
    BridgeConfig, ClientSession, CloseStatus, MessageKind, SessionEvent, SessionId, SessionState,
};
use crate::infrastructure::tls::TlsContext;
use crate::infrastructure::transport::UpstreamConnector;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// How long sessions get to flush their Close frames on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long a closing session waits for the client's Close reply before the
/// connection is dropped anyway.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

// ── Public API ────────────────────────────────────────────────────────────────

/// Builds the upstream connector described by `config`.
///
/// # Errors
///
/// Fails if TLS was requested and the TLS context cannot be built.
pub fn upstream_connector(config: &BridgeConfig) -> anyhow::Result<UpstreamConnector> {
    let tls = match &config.upstream_tls {
        Some(options) => Some(
            TlsContext::from_options(options, &config.upstream)
                .context("failed to set up TLS for the upstream connection")?,
        ),
        None => None,
    };
    Ok(UpstreamConnector::new(config.upstream.clone(), tls))
}

/// Runs the WebSocket bridge until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the TLS context cannot be built or the listener
/// cannot be bound (e.g., the port is already in use).  Both happen before
/// any connection is accepted.
pub async fn run_server(config: BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let upstream = upstream_connector(&config)?;

    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket listener on {}",
                config.ws_bind_addr
            )
        })?;

    info!(
        "WebSocket bridge listening on {} → upstream {} ({:?})",
        config.ws_bind_addr,
        upstream.target(),
        upstream.kind()
    );

    serve(listener, upstream, config.verbose, running).await;
    Ok(())
}

/// Accepts sessions on an already bound `listener` until `running` is
/// cleared, then tears every bridge down.
pub async fn serve(
    listener: TcpListener,
    upstream: UpstreamConnector,
    verbose: bool,
    running: Arc<AtomicBool>,
) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(EventDispatch::new(upstream).run(events_rx));
    let mut sessions = JoinSet::new();

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // A short timeout lets the loop notice the shutdown flag even when
        // nobody is connecting.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new connection from {peer_addr}");
                sessions.spawn(handle_client(stream, peer_addr, events.clone(), verbose));
            }
            Ok(Err(e)) => {
                // Transient (e.g., too many open file descriptors); keep going.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }

        while sessions.try_join_next().is_some() {}
    }

    let _ = events.send(SessionEvent::Shutdown);
    if let Err(e) = dispatcher.await {
        error!("dispatcher task failed: {e}");
    }

    let drained = timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} session(s) did not close within {SHUTDOWN_GRACE:?}; aborting",
            sessions.len()
        );
        sessions.abort_all();
    }
}

// ── ClientSession implementation ──────────────────────────────────────────────

/// One WebSocket session as seen by the bridging engine.
///
/// `send` and `close` only enqueue; the session's writer task does the I/O.
pub struct WsSession {
    id: SessionId,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<WsMessage>,
    closing: Notify,
}

impl WsSession {
    fn new(id: SessionId, outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            id,
            state: AtomicU8::new(encode_state(SessionState::Open)),
            outbound,
            closing: Notify::new(),
        }
    }

    /// Resolves [`CLOSE_HANDSHAKE_TIMEOUT`] after the session starts closing.
    async fn close_deadline(&self) {
        self.closing.notified().await;
        sleep(CLOSE_HANDSHAKE_TIMEOUT).await;
    }

    fn mark_closed(&self) {
        self.state
            .store(encode_state(SessionState::Closed), Ordering::Release);
    }
}

impl ClientSession for WsSession {
    fn send(&self, payload: Vec<u8>, kind: MessageKind) {
        if self.state() != SessionState::Open {
            debug!("session {}: not open; dropping outbound message", self.id);
            return;
        }
        let message = match kind {
            MessageKind::Binary => WsMessage::Binary(payload),
        };
        let _ = self.outbound.send(message);
    }

    fn close(&self, status: CloseStatus, reason: &str) {
        let claimed = self
            .state
            .compare_exchange(
                encode_state(SessionState::Open),
                encode_state(SessionState::Closing),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !claimed {
            return;
        }
        debug!("session {}: closing ({}) {reason}", self.id, status.code());
        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: reason.to_string().into(),
        };
        let _ = self.outbound.send(WsMessage::Close(Some(frame)));
        self.closing.notify_one();
    }

    fn state(&self) -> SessionState {
        decode_state(self.state.load(Ordering::Acquire))
    }
}

fn encode_state(state: SessionState) -> u8 {
    match state {
        SessionState::Connecting => 0,
        SessionState::Open => 1,
        SessionState::Closing => 2,
        SessionState::Closed => 3,
    }
}

fn decode_state(raw: u8) -> SessionState {
    match raw {
        0 => SessionState::Connecting,
        1 => SessionState::Open,
        2 => SessionState::Closing,
        _ => SessionState::Closed,
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

/// Runs one client connection from handshake to teardown.
async fn handle_client(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    events: mpsc::UnboundedSender<SessionEvent>,
    verbose: bool,
) {
    let ws_stream = match accept_async(raw_stream).await {
        Ok(ws) => ws,
        Err(e) => {
            if verbose {
                warn!("WebSocket handshake failed with {peer_addr}: {e}");
            } else {
                debug!("WebSocket handshake failed with {peer_addr}: {e}");
            }
            return;
        }
    };

    let id = SessionId::new();
    info!("session {id}: opened by {peer_addr}");

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_frames(ws_tx, outbound_rx, id));

    let session = Arc::new(WsSession::new(id, outbound));
    let handle = Arc::downgrade(&session) as Weak<dyn ClientSession>;
    let opened = events.send(SessionEvent::Open {
        id,
        session: handle,
    });
    if opened.is_err() {
        session.close(CloseStatus::GoingAway, REASON_SERVER_QUIT);
    }

    let outcome = tokio::select! {
        end = read_frames(&mut ws_rx, id, &events, verbose) => end,
        () = session.close_deadline() => {
            debug!("session {id}: no Close reply within {CLOSE_HANDSHAKE_TIMEOUT:?}; dropping connection");
            SessionEvent::Close { id }
        }
    };
    session.mark_closed();
    let _ = events.send(outcome);
    drop(ws_rx);

    // Last strong reference: the outbound queue closes with it and the
    // writer flushes and exits.
    drop(session);
    match timeout(CLOSE_HANDSHAKE_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("session {id}: writer task ended abnormally: {e}"),
        Err(_) => {
            debug!("session {id}: writer stalled; aborting");
            writer.abort();
        }
    }
    info!("session {id}: ended");
}

/// Reads client frames until the session ends, turning payloads into
/// [`SessionEvent::Message`]s.
///
/// Returns the event that describes how the session ended.
async fn read_frames<S>(
    ws_rx: &mut S,
    id: SessionId,
    events: &mpsc::UnboundedSender<SessionEvent>,
    verbose: bool,
) -> SessionEvent
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let payload = match ws_rx.next().await {
            Some(Ok(WsMessage::Binary(data))) => data,
            // Text is relayed as its UTF-8 bytes, never parsed.
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                // Control frames are answered by tungstenite itself.
                continue;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                debug!("session {id}: client sent Close {frame:?}");
                return SessionEvent::Close { id };
            }
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                debug!("session {id}: WebSocket stream ended");
                return SessionEvent::Close { id };
            }
            Some(Err(e)) => {
                if verbose {
                    warn!("session {id}: WebSocket error: {e}");
                } else {
                    debug!("session {id}: WebSocket error: {e}");
                }
                return SessionEvent::Fail { id };
            }
        };

        // A closed channel means the dispatcher is shutting down; keep
        // reading so the client's Close handshake can complete.
        let _ = events.send(SessionEvent::Message { id, payload });
    }
}

/// Drains the outbound queue into the WebSocket sink.
///
/// Stops after a Close frame or when the queue closes, then closes the sink.
async fn write_frames<S>(mut ws_tx: S, mut outbound: mpsc::UnboundedReceiver<WsMessage>, id: SessionId)
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let is_close = matches!(message, WsMessage::Close(_));
        if let Err(e) = ws_tx.send(message).await {
            debug!("session {id}: WebSocket send failed (client disconnected): {e}");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

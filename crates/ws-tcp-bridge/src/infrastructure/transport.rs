//! Outbound connection to the upstream byte-stream peer.
//!
//! [`TransportSocket`] hides whether the upstream link is plain TCP or TLS.
//! The variant is chosen once, in [`TransportSocket::new`], from whether a
//! [`TlsContext`] is supplied.  After [`connect`](TransportSocket::connect)
//! succeeds the socket is an ordinary `AsyncRead + AsyncWrite`, so the bridge
//! is written once against that interface.
//!
//! For the encrypted variant the TLS handshake is folded into `connect`: a
//! handshake failure comes back through the same `Result` as a refused
//! connection, so callers need no separate failure path.
//!
//! Any I/O error after connecting is terminal.  There is no retry; the owner
//! is expected to [`close`](TransportSocket::close) the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::domain::UpstreamTarget;
use crate::infrastructure::tls::TlsContext;

/// Which variant a [`TransportSocket`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plaintext,
    Encrypted,
}

/// Connection state of a [`TransportSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

/// Errors reported by [`TransportSocket::connect`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot resolve {target}: {source}")]
    Resolve {
        target: UpstreamTarget,
        #[source]
        source: io::Error,
    },

    #[error("{0} resolved to no addresses")]
    NoAddresses(UpstreamTarget),

    #[error("cannot connect to {target}: {source}")]
    Connect {
        target: UpstreamTarget,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {target} failed: {source}")]
    Handshake {
        target: UpstreamTarget,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect a transport that is {0:?}")]
    InvalidState(SocketState),
}

/// Cheap, cloneable recipe for upstream sockets.
///
/// Holds the target and the optional TLS context.  Every bridge asks it for a
/// fresh [`TransportSocket`].
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    target: UpstreamTarget,
    tls: Option<TlsContext>,
}

impl UpstreamConnector {
    pub fn new(target: UpstreamTarget, tls: Option<TlsContext>) -> Self {
        Self { target, tls }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    pub fn kind(&self) -> TransportKind {
        if self.tls.is_some() {
            TransportKind::Encrypted
        } else {
            TransportKind::Plaintext
        }
    }

    /// Creates an unconnected socket of the configured variant.
    pub fn socket(&self) -> TransportSocket {
        TransportSocket::new(self.target.clone(), self.tls.clone())
    }
}

enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One outbound connection, plaintext or encrypted.
pub struct TransportSocket {
    target: UpstreamTarget,
    tls: Option<TlsContext>,
    state: SocketState,
    stream: Option<UpstreamStream>,
}

impl TransportSocket {
    /// Creates an unconnected socket.  `Some(tls)` selects the encrypted
    /// variant.
    pub fn new(target: UpstreamTarget, tls: Option<TlsContext>) -> Self {
        Self {
            target,
            tls,
            state: SocketState::Unconnected,
            stream: None,
        }
    }

    pub fn kind(&self) -> TransportKind {
        if self.tls.is_some() {
            TransportKind::Encrypted
        } else {
            TransportKind::Plaintext
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Resolves the target and connects to the first address that accepts,
    /// then runs the TLS handshake for the encrypted variant.
    ///
    /// On failure the socket ends up `Closed`.
    ///
    /// # Errors
    ///
    /// See [`TransportError`].  Calling this on a socket that is not
    /// `Unconnected` returns [`TransportError::InvalidState`].
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state != SocketState::Unconnected {
            return Err(TransportError::InvalidState(self.state));
        }
        self.state = SocketState::Connecting;

        match self.establish().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SocketState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SocketState::Closed;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<UpstreamStream, TransportError> {
        let target = &self.target;
        let addrs = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|source| TransportError::Resolve {
                target: target.clone(),
                source,
            })?;

        // Try each resolved endpoint in turn, keeping the last error.
        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("connected to upstream {target} via {addr}");
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("upstream {target}: {addr} refused: {e}");
                    last_err = Some(e);
                }
            }
        }

        let tcp = match (tcp, last_err) {
            (Some(stream), _) => stream,
            (None, Some(source)) => {
                return Err(TransportError::Connect {
                    target: target.clone(),
                    source,
                })
            }
            (None, None) => return Err(TransportError::NoAddresses(target.clone())),
        };

        // Small control packets (MQTT PINGREQ and friends) must not wait on
        // Nagle's algorithm.
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("upstream {target}: cannot disable Nagle: {e}");
        }

        match &self.tls {
            None => Ok(UpstreamStream::Plain(tcp)),
            Some(tls) => {
                let stream = tls
                    .connector()
                    .connect(tls.server_name(), tcp)
                    .await
                    .map_err(|source| TransportError::Handshake {
                        target: target.clone(),
                        source,
                    })?;
                Ok(UpstreamStream::Tls(Box::new(stream)))
            }
        }
    }

    /// Shuts the connection down and releases the handle.
    ///
    /// Idempotent: closing a closed (or never connected) socket is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // Best effort: sends FIN (and close_notify for TLS).
            if let Err(e) = stream.shutdown().await {
                debug!("upstream {}: shutdown failed: {e}", self.target);
            }
        }
        self.state = SocketState::Closed;
    }

    fn stream_mut(&mut self) -> io::Result<&mut UpstreamStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "upstream is not connected"))
    }
}

// ── Stream plumbing ───────────────────────────────────────────────────────────

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl AsyncRead for TransportSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for TransportSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

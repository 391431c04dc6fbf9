//! Infrastructure layer for ws-tcp-bridge.
//!
//! The infrastructure layer handles all I/O: accepting WebSocket connections
//! from clients and opening TCP (optionally TLS) connections upstream.
//!
//! # Responsibilities
//!
//! - Binding a TCP listener for WebSocket clients
//! - Performing the WebSocket HTTP upgrade handshake
//! - Resolving and connecting to the upstream service
//! - Wrapping the upstream connection in TLS when configured
//! - Spawning per-session Tokio tasks
//! - Handling the graceful shutdown signal
//!
//! # What does NOT belong here?
//!
//! - Pairing sessions with upstream sockets (that is the application layer)
//! - Session and configuration types (that is the domain layer)
//! - Command-line parsing (that is done in `main.rs`)

pub mod tls;
pub mod transport;
pub mod ws_server;

// Re-export the primary entry points so `main.rs` can call them concisely.
pub use tls::{TlsContext, TlsSetupError};
pub use transport::{SocketState, TransportError, TransportKind, TransportSocket, UpstreamConnector};
pub use ws_server::{run_server, serve, upstream_connector, WsSession, CLOSE_HANDSHAKE_TIMEOUT};

//! ws-tcp-bridge library crate.
//!
//! This crate provides a WebSocket-to-TCP bridge: each WebSocket client gets
//! its own TCP connection to a fixed upstream service, and bytes are relayed
//! verbatim in both directions.  Typical use is letting browsers speak a
//! binary protocol such as MQTT to a broker that only listens on raw TCP.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Client (binary or text frames over WebSocket)
//!         ↕
//! [ws-tcp-bridge]
//!   ├── domain/           Pure types: BridgeConfig, session ids, ClientSession
//!   ├── application/      Bridging engine: ConnectionBridge, EventDispatch
//!   └── infrastructure/
//!         ├── ws_server/  WebSocket accept loop (tokio-tungstenite)
//!         ├── transport/  Upstream TCP socket, plaintext or TLS
//!         └── tls/        rustls client configuration
//!         ↕
//! Upstream service (raw TCP)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and on the upstream socket type.
//! - `infrastructure` depends on all other layers plus `tokio`,
//!   `tungstenite` and `rustls`.
//!
//! The payload is never interpreted.  What goes in one side comes out the
//! other, in order, until either side closes.

/// Domain layer: configuration and session types (no I/O).
pub mod domain;

/// Application layer: one bridge per session, and the dispatcher that owns them.
pub mod application;

/// Infrastructure layer: WebSocket server and upstream transport.
pub mod infrastructure;

//! Domain layer for ws-tcp-bridge.
//!
//! Pure types with no dependencies on I/O, networking, or async runtimes:
//!
//! - Configuration structures
//! - The session contract the bridging engine is written against
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - File I/O or environment variable reading

pub mod config;
pub mod session;

pub use config::{BridgeConfig, UpstreamTarget, UpstreamTlsOptions};
pub use session::{ClientSession, CloseStatus, MessageKind, SessionEvent, SessionId, SessionState};

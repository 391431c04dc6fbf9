//! Application layer for ws-tcp-bridge.
//!
//! The bridging engine: it knows *what* happens to a session's bytes, and
//! delegates *how* they move to the infrastructure layer.
//!
//! # Responsibilities
//!
//! - Pairing each client session with one upstream socket ([`ConnectionBridge`])
//! - Creating and destroying bridges as sessions open and close
//!   ([`EventDispatch`], [`BridgeRegistry`])
//!
//! # What does NOT belong here?
//!
//! - Accepting WebSocket connections or framing messages (infrastructure)
//! - Interpreting the relayed payload (nothing does)

pub mod bridge;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeState, ConnectionBridge, READ_BUFFER_SIZE};
pub use registry::{BridgeRegistry, EventDispatch};

//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is built once at startup from CLI arguments (see `main.rs`) and then
//! passed by value into the server.  Nothing reads it from global state.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default WebSocket listener port.
pub const DEFAULT_WS_PORT: u16 = 1337;

/// Default upstream host.
pub const DEFAULT_UPSTREAM_HOST: &str = "localhost";

/// Default upstream port (the MQTT broker port).
pub const DEFAULT_UPSTREAM_PORT: u16 = 1883;

/// The raw TCP endpoint every bridge connects to.
///
/// The host is kept as a name, not a resolved address: resolution happens
/// per connection so DNS changes are picked up without a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for UpstreamTarget {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_HOST, DEFAULT_UPSTREAM_PORT)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Settings for the encrypted upstream variant.
///
/// Present only when `--upstream-tls` was given.  The infrastructure layer
/// turns this into a TLS client context at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamTlsOptions {
    /// Extra PEM-encoded trust anchors added on top of the webpki roots.
    pub ca_file: Option<PathBuf>,

    /// Name used for SNI and certificate verification.
    ///
    /// Falls back to [`UpstreamTarget::host`] when `None`.
    pub server_name: Option<String>,
}

/// All runtime configuration for the WebSocket bridge.
///
/// # Example
///
/// ```rust
/// use ws_tcp_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 1337);
/// assert_eq!(cfg.upstream.to_string(), "localhost:1883");
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The address and port the WebSocket server binds to.
    pub ws_bind_addr: SocketAddr,

    /// Where every bridge relays its bytes to.
    pub upstream: UpstreamTarget,

    /// `Some` selects the encrypted transport for every bridge.
    pub upstream_tls: Option<UpstreamTlsOptions>,

    /// Surface WebSocket protocol errors and warnings in the log.
    pub verbose: bool,
}

impl Default for BridgeConfig {
    /// | Field         | Default          |
    /// |---------------|------------------|
    /// | ws_bind_addr  | `0.0.0.0:1337`   |
    /// | upstream      | `localhost:1883` |
    /// | upstream_tls  | `None`           |
    /// | verbose       | `false`          |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WS_PORT)),
            upstream: UpstreamTarget::default(),
            upstream_tls: None,
            verbose: false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ws_port_is_1337() {
        // Arrange / Act
        let cfg = BridgeConfig::default();
        // Assert
        assert_eq!(cfg.ws_bind_addr.port(), 1337);
    }

    #[test]
    fn test_default_upstream_is_localhost_1883() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.upstream.host, "localhost");
        assert_eq!(cfg.upstream.port, 1883);
    }

    #[test]
    fn test_default_is_plaintext_and_quiet() {
        let cfg = BridgeConfig::default();
        assert!(cfg.upstream_tls.is_none());
        assert!(!cfg.verbose);
    }

    #[test]
    fn test_upstream_target_display_joins_host_and_port() {
        let target = UpstreamTarget::new("broker.example.net", 8883);
        assert_eq!(target.to_string(), "broker.example.net:8883");
    }

    #[test]
    fn test_tls_options_default_has_no_overrides() {
        let tls = UpstreamTlsOptions::default();
        assert!(tls.ca_file.is_none());
        assert!(tls.server_name.is_none());
    }
}

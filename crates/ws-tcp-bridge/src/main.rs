//! WebSocket-to-TCP bridge: entry point.
//!
//! This binary accepts WebSocket connections and gives each one its own TCP
//! connection to a fixed upstream service.  Bytes are relayed verbatim in
//! both directions: every WebSocket message is written to the upstream
//! socket, and every chunk read from the upstream socket goes back to the
//! client as one binary message.
//!
//! # Why a bridge process?
//!
//! Web browsers can only open HTTP/WebSocket connections, not raw TCP
//! sockets.  Services such as MQTT brokers often listen on raw TCP only.
//! This bridge sits in between so the browser can speak the service's
//! protocol without the service knowing WebSockets exist.
//!
//! # Usage
//!
//! ```text
//! ws-tcp-bridge [OPTIONS]
//!
//! Options:
//!   --ws-port <PORT>                WebSocket listener port [default: 1337]
//!   --ws-bind <IP>                  WebSocket listener address [default: 0.0.0.0]
//!   --upstream-host <HOST>          Upstream hostname or IP [default: localhost]
//!   --upstream-port <PORT>          Upstream TCP port [default: 1883]
//!   --upstream-tls                  Connect to the upstream over TLS
//!   --upstream-ca <FILE>            Extra PEM roots for the upstream certificate
//!   --upstream-server-name <NAME>   Name to verify the upstream certificate against
//!   -v, --verbose                   Log WebSocket protocol errors
//! ```
//!
//! `--websocketPort`, `--brokerHost` and `--brokerPort` are accepted as
//! aliases for older deployment scripts.
//!
//! # Environment variable overrides
//!
//! CLI args take precedence when both are present.
//!
//! | Variable                          | Default     | Description              |
//! |-----------------------------------|-------------|--------------------------|
//! | `WS_BRIDGE_PORT`                  | `1337`      | WebSocket listener port  |
//! | `WS_BRIDGE_BIND`                  | `0.0.0.0`   | WebSocket listener IP    |
//! | `WS_BRIDGE_UPSTREAM_HOST`         | `localhost` | Upstream host            |
//! | `WS_BRIDGE_UPSTREAM_PORT`         | `1883`      | Upstream port            |
//! | `WS_BRIDGE_UPSTREAM_TLS`          | `false`     | Use TLS upstream         |
//! | `WS_BRIDGE_UPSTREAM_CA`           | (none)      | Extra PEM roots          |
//! | `WS_BRIDGE_UPSTREAM_SERVER_NAME`  | host        | TLS verification name    |
//!
//! # Exit codes
//!
//! - `0` after a graceful shutdown (SIGINT/SIGTERM) or `--version`
//! - `1` after `--help`, or when startup fails (bad option, bind failure)
//! - `2` for any other command-line parse error

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::{error::ErrorKind, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ws_tcp_bridge::domain::{
    config::{DEFAULT_UPSTREAM_HOST, DEFAULT_UPSTREAM_PORT, DEFAULT_WS_PORT},
    BridgeConfig, UpstreamTarget, UpstreamTlsOptions,
};
use ws_tcp_bridge::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket-to-TCP bridge.
///
/// Accepts WebSocket connections and relays each one, byte for byte, to its
/// own TCP connection to the upstream service.
#[derive(Debug, Parser)]
#[command(
    name = "ws-tcp-bridge",
    about = "Relays WebSocket sessions to a raw TCP service",
    version
)]
struct Cli {
    /// TCP port for the WebSocket server to listen on.
    #[arg(
        long,
        alias = "websocketPort",
        default_value_t = DEFAULT_WS_PORT,
        env = "WS_BRIDGE_PORT"
    )]
    ws_port: u16,

    /// IP address to bind the WebSocket server to.
    ///
    /// Use `0.0.0.0` to accept connections from any interface, or
    /// `127.0.0.1` to accept only local connections.
    #[arg(long, default_value = "0.0.0.0", env = "WS_BRIDGE_BIND")]
    ws_bind: String,

    /// Hostname or IP address of the upstream service.
    #[arg(
        long,
        alias = "brokerHost",
        default_value = DEFAULT_UPSTREAM_HOST,
        env = "WS_BRIDGE_UPSTREAM_HOST"
    )]
    upstream_host: String,

    /// TCP port of the upstream service.
    #[arg(
        long,
        alias = "brokerPort",
        default_value_t = DEFAULT_UPSTREAM_PORT,
        env = "WS_BRIDGE_UPSTREAM_PORT"
    )]
    upstream_port: u16,

    /// Connect to the upstream service over TLS.
    #[arg(long, env = "WS_BRIDGE_UPSTREAM_TLS")]
    upstream_tls: bool,

    /// PEM file with extra root certificates for the upstream service.
    ///
    /// The built-in web PKI roots are always trusted as well.
    #[arg(long, requires = "upstream_tls", env = "WS_BRIDGE_UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    /// Name to send as SNI and verify the upstream certificate against.
    ///
    /// Defaults to `--upstream-host`.
    #[arg(
        long,
        requires = "upstream_tls",
        env = "WS_BRIDGE_UPSTREAM_SERVER_NAME"
    )]
    upstream_server_name: Option<String>,

    /// Log WebSocket handshake and protocol errors.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`BridgeConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` is not a valid IP address.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let bind_ip: IpAddr = self
            .ws_bind
            .parse()
            .with_context(|| format!("invalid WebSocket bind address: '{}'", self.ws_bind))?;

        let upstream_tls = self.upstream_tls.then(|| UpstreamTlsOptions {
            ca_file: self.upstream_ca,
            server_name: self.upstream_server_name,
        });

        Ok(BridgeConfig {
            ws_bind_addr: SocketAddr::new(bind_ip, self.ws_port),
            upstream: UpstreamTarget::new(self.upstream_host, self.upstream_port),
            upstream_tls,
            verbose: self.verbose,
        })
    }
}

/// Parses the command line, exiting for `--help` (status 1), `--version`
/// (status 0) and parse errors (clap's usage status).
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp => {
                let _ = e.print();
                std::process::exit(1);
            }
            ErrorKind::DisplayVersion => {
                let _ = e.print();
                std::process::exit(0);
            }
            _ => e.exit(),
        },
    }
}

/// Default log directives when `RUST_LOG` is not set.
///
/// The WebSocket crates stay silent unless `verbose` is on.
fn default_log_directives(verbose: bool) -> &'static str {
    if verbose {
        "info,ws_tcp_bridge=debug,tungstenite=warn,tokio_tungstenite=warn"
    } else {
        "info,tungstenite=off,tokio_tungstenite=off"
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// Every session, bridge and the dispatcher run as tasks on one
/// single-threaded Tokio runtime.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed with `clap` into a [`Cli`] struct.
/// 2. `tracing_subscriber` is initialised.  `RUST_LOG` wins when set;
///    otherwise `--verbose` picks the defaults.
/// 3. A [`BridgeConfig`] is constructed from the CLI arguments.
/// 4. Signal handlers are spawned; they clear a shared `AtomicBool` on
///    SIGINT (and SIGTERM on Unix).
/// 5. [`run_server`] binds the WebSocket port and serves sessions until the
///    flag is cleared.
fn main() -> ExitCode {
    let cli = parse_cli();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_directives(cli.verbose))),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.into_bridge_config()?;

    info!(
        "ws-tcp-bridge starting — ws={}, upstream={}{}",
        config.ws_bind_addr,
        config.upstream,
        if config.upstream_tls.is_some() { " (tls)" } else { "" }
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    //
    // The accept loop in `run_server` checks this flag every 200 ms and
    // exits cleanly once it is cleared.
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(watch_signals(Arc::clone(&running)));

    run_server(config, running).await?;

    info!("ws-tcp-bridge stopped");
    Ok(())
}

/// Clears `running` on the first SIGINT, or SIGTERM on Unix.
async fn watch_signals(running: Arc<AtomicBool>) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received Ctrl+C — initiating graceful shutdown"),
            Err(e) => {
                error!("failed to listen for Ctrl+C signal: {e}");
                return;
            }
        },
        () = terminate => info!("received SIGTERM — initiating graceful shutdown"),
    }

    running.store(false, Ordering::Relaxed);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! End-to-end tests for the WebSocket-to-TCP bridge.
//!
//! # Purpose
//!
//! These tests run the real server (`serve`) on a loopback port, connect to
//! it with a `tokio-tungstenite` client, and stand in for the upstream
//! service with a plain `TcpListener`.  They verify:
//!
//! - Client messages reach the upstream byte for byte.
//! - Upstream bytes come back as one binary message per read.
//! - A refused upstream connection closes the client session with a reason.
//! - Closing the client while the bridge is waiting on the upstream closes
//!   the upstream connection.
//! - Clearing the `running` flag closes every session with "going away".
//! - A client that never answers a Close frame is dropped after the close
//!   handshake deadline.
//! - Streams larger than one read buffer pass through intact, and the
//!   encrypted upstream variant relays just like the plaintext one.
//!
//! ```text
//! test client ──ws──► serve() ──tcp──► test upstream
//! ```

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::CloseFrame, tungstenite::Message, MaybeTlsStream,
    WebSocketStream,
};

use ws_tcp_bridge::application::READ_BUFFER_SIZE;
use ws_tcp_bridge::domain::{UpstreamTarget, UpstreamTlsOptions};
use ws_tcp_bridge::infrastructure::{serve, TlsContext, UpstreamConnector, CLOSE_HANDSHAKE_TIMEOUT};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

/// A running bridge on a loopback port.
struct Bridge {
    url: String,
    running: Arc<AtomicBool>,
    server: JoinHandle<()>,
}

/// Starts `serve` in the background, relaying to `127.0.0.1:upstream_port`.
async fn start_bridge(upstream_port: u16) -> Bridge {
    let connector = UpstreamConnector::new(UpstreamTarget::new("127.0.0.1", upstream_port), None);
    start_bridge_with(connector).await
}

async fn start_bridge_with(connector: UpstreamConnector) -> Bridge {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let running = Arc::new(AtomicBool::new(true));

    let server = tokio::spawn(serve(listener, connector, false, Arc::clone(&running)));
    Bridge {
        url,
        running,
        server,
    }
}

async fn upstream_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn connect_client(url: &str) -> Client {
    let (client, _response) = timeout(STEP, connect_async(url))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    client
}

/// Returns the next data or Close message, skipping pings and pongs.
async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = timeout(STEP, client.next())
            .await
            .expect("no message within 5s")
            .expect("stream ended")
            .expect("WebSocket error");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// TLS server side presenting the `localhost` certificate from the fixtures.
fn fixture_acceptor() -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(fixture("server.pem")).unwrap(),
    ))
    .collect::<Result<Vec<_>, _>>()
    .unwrap();
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(fixture("server.key")).unwrap(),
    ))
    .unwrap()
    .expect("fixture key");
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Collects binary messages until `len` bytes have arrived.
async fn collect_binary(client: &mut Client, len: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut total = 0;
    while total < len {
        match next_message(client).await {
            Message::Binary(data) => {
                total += data.len();
                frames.push(data);
            }
            other => panic!("expected binary data, got {other:?}"),
        }
    }
    frames
}

fn expect_close(message: Message) -> CloseFrame<'static> {
    match message {
        Message::Close(Some(frame)) => frame,
        other => panic!("expected a Close frame with a reason, got {other:?}"),
    }
}

// ── Relay tests ───────────────────────────────────────────────────────────────

/// A 7-byte client message arrives upstream as exactly those 7 bytes.
#[tokio::test]
async fn test_client_message_reaches_upstream_verbatim() {
    // Arrange
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;

    // Act
    client
        .send(Message::Binary(b"PINGREQ".to_vec()))
        .await
        .unwrap();
    let (mut peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    // Assert
    let mut received = [0u8; 7];
    timeout(STEP, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"PINGREQ");
}

/// Text frames are relayed as their UTF-8 bytes, in order with binary ones.
#[tokio::test]
async fn test_text_and_binary_messages_arrive_in_order() {
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (mut peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    client.send(Message::Text("ab".to_string())).await.unwrap();
    client.send(Message::Binary(b"cd".to_vec())).await.unwrap();
    client.send(Message::Text("ef".to_string())).await.unwrap();

    let mut received = [0u8; 6];
    timeout(STEP, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"abcdef");
}

/// 20 bytes written upstream in one go come back as one binary message.
#[tokio::test]
async fn test_upstream_chunk_arrives_as_single_binary_message() {
    // Arrange
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (mut peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();
    let payload: Vec<u8> = (0u8..20).collect();

    // Act
    peer.write_all(&payload).await.unwrap();

    // Assert
    assert_eq!(next_message(&mut client).await, Message::Binary(payload));
}

/// More than one read buffer each way: bytes arrive intact and in order,
/// and no upstream → client frame exceeds the read buffer.
#[tokio::test]
async fn test_large_streams_pass_through_intact_both_ways() {
    // Arrange
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (mut peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();
    let down: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let up: Vec<u8> = (0..30_000u32).map(|i| (i % 241) as u8).collect();

    // Act: client → upstream in three messages
    for chunk in up.chunks(10_000) {
        client.send(Message::Binary(chunk.to_vec())).await.unwrap();
    }
    let mut received = vec![0u8; up.len()];
    timeout(STEP, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();

    // Act: upstream → client in one write
    let writer = tokio::spawn(async move {
        peer.write_all(&down).await.unwrap();
        (peer, down)
    });
    let frames = collect_binary(&mut client, 200_000).await;
    let (_peer, down) = writer.await.unwrap();

    // Assert
    assert_eq!(received, up);
    assert!(frames.len() > 1);
    assert!(frames.iter().all(|f| f.len() <= READ_BUFFER_SIZE));
    assert_eq!(frames.concat(), down);
}

/// The encrypted variant relays both ways once the handshake succeeds.
#[tokio::test]
async fn test_encrypted_upstream_relays_both_ways() {
    // Arrange: a TLS upstream trusted through the fixture CA
    let (upstream, port) = upstream_listener().await;
    let target = UpstreamTarget::new("127.0.0.1", port);
    let options = UpstreamTlsOptions {
        ca_file: Some(fixture("ca.pem")),
        server_name: Some("localhost".to_string()),
    };
    let tls = TlsContext::from_options(&options, &target).unwrap();
    let bridge = start_bridge_with(UpstreamConnector::new(target, Some(tls))).await;
    let acceptor = fixture_acceptor();
    let mut client = connect_client(&bridge.url).await;

    // Act
    client
        .send(Message::Binary(b"PINGREQ".to_vec()))
        .await
        .unwrap();
    let (tcp, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();
    let mut peer = timeout(STEP, acceptor.accept(tcp)).await.unwrap().unwrap();
    let mut received = [0u8; 7];
    timeout(STEP, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    peer.write_all(&[0xd0, 0x00]).await.unwrap();
    peer.flush().await.unwrap();

    // Assert
    assert_eq!(&received, b"PINGREQ");
    assert_eq!(next_message(&mut client).await, Message::Binary(vec![0xd0, 0x00]));
}

// ── Failure tests ─────────────────────────────────────────────────────────────

/// A refused upstream connection closes the client with a non-empty reason.
#[tokio::test]
async fn test_refused_upstream_closes_client_with_reason() {
    // Arrange: grab a free port, then stop listening on it
    let (upstream, port) = upstream_listener().await;
    drop(upstream);
    let bridge = start_bridge(port).await;

    // Act
    let mut client = connect_client(&bridge.url).await;
    let frame = expect_close(next_message(&mut client).await);

    // Assert
    assert_eq!(u16::from(frame.code), 1000);
    assert_eq!(frame.reason, "cannot establish upstream connection");
}

/// The upstream closing its end closes the client session.
#[tokio::test]
async fn test_upstream_close_closes_client() {
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    drop(peer);

    let frame = expect_close(next_message(&mut client).await);
    assert_eq!(frame.reason, "upstream closed the connection");
}

/// Closing the client while the bridge waits on the upstream makes the
/// upstream see end-of-stream.
#[tokio::test]
async fn test_client_close_during_outstanding_read_closes_upstream() {
    // Arrange: the bridge is connected and reading; the upstream is silent
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (mut peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    // Act
    client.close(None).await.unwrap();

    // Assert
    let mut rest = Vec::new();
    let read = timeout(STEP, peer.read_to_end(&mut rest))
        .await
        .expect("upstream was not closed")
        .unwrap();
    assert_eq!(read, 0);
}

/// A client that never answers the Close frame is dropped after the close
/// handshake deadline, so nothing is left for shutdown to wait on.
#[tokio::test]
async fn test_unanswered_close_does_not_keep_session_alive() {
    // Arrange: the client stays connected but never reads again
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let _client = connect_client(&bridge.url).await;
    let (peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    // Act: the upstream goes away, the bridge sends Close, nobody replies
    drop(peer);
    tokio::time::sleep(CLOSE_HANDSHAKE_TIMEOUT + Duration::from_secs(1)).await;
    bridge.running.store(false, Ordering::Relaxed);

    // Assert: serve returns well inside its 2 s shutdown grace period
    timeout(Duration::from_secs(1), bridge.server)
        .await
        .expect("a session outlived its close handshake deadline")
        .unwrap();
}

// ── Shutdown tests ────────────────────────────────────────────────────────────

/// Clearing the running flag closes open sessions with 1001 and ends `serve`.
#[tokio::test]
async fn test_shutdown_closes_sessions_with_going_away() {
    // Arrange
    let (upstream, port) = upstream_listener().await;
    let bridge = start_bridge(port).await;
    let mut client = connect_client(&bridge.url).await;
    let (_peer, _) = timeout(STEP, upstream.accept()).await.unwrap().unwrap();

    // Act
    bridge.running.store(false, Ordering::Relaxed);
    let frame = expect_close(next_message(&mut client).await);

    // Assert
    assert_eq!(u16::from(frame.code), 1001);
    assert_eq!(frame.reason, "websocket server quit");
    drop(client);
    timeout(STEP, bridge.server)
        .await
        .expect("serve did not return")
        .unwrap();
}

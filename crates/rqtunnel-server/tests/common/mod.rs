//! Shared helpers for tunnel integration tests
#![allow(dead_code)]

use rqtunnel_server::{TunnelConfig, TunnelService};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Server on ephemeral loopback ports without a cipher
pub fn plain_server(capacity: usize) -> TunnelConfig {
    TunnelConfig::server("127.0.0.1:0", "127.0.0.1:0")
        .with_cipher("none", "")
        .with_capacity(capacity)
        .with_shutdown_grace(Duration::from_secs(2))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub async fn start(config: TunnelConfig) -> TunnelService {
    init_tracing();
    let service = TunnelService::new(config).expect("valid config");
    service.start().await.expect("service should start");
    service
}

pub fn tunnel_addr(service: &TunnelService) -> SocketAddr {
    service.bound_addrs().tunnel.expect("tunnel listener bound")
}

pub fn user_addr(service: &TunnelService) -> SocketAddr {
    service.bound_addrs().service.expect("user listener bound")
}

/// Poll `condition` until it holds or panic after [`WAIT`]
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_pending(service: &TunnelService, count: usize) {
    wait_until(&format!("{} pending links", count), || {
        service.stats().pending_links == count
    })
    .await;
}

pub async fn read_exact_bytes(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

/// Whether the peer has closed `stream` (EOF or reset) within [`WAIT`]
pub async fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match timeout(WAIT, stream.read(&mut buf)).await {
            Err(_) => return false,
            Ok(Ok(0)) | Ok(Err(_)) => return true,
            Ok(Ok(_)) => continue,
        }
    }
}

/// Stub private service echoing every connection back until EOF
pub async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Stub private service answering `ping` with `pong`
pub async fn spawn_ping_pong_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = [0u8; 4];
                if stream.read_exact(&mut request).await.is_ok() && &request == b"ping" {
                    let _ = stream.write_all(b"pong").await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

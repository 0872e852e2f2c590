//! Control channel: tunnel registration, heartbeats and liveness loss.

mod common;

use common::*;
use futures::SinkExt;
use rqtunnel_control::{ControlCodec, ControlMessage};
use rqtunnel_server::{ReconnectConfig, TunnelConfig, TunnelService};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

const HEARTBEAT: Duration = Duration::from_millis(100);

async fn start_server() -> TunnelService {
    start(
        plain_server(8)
            .with_control_addr("127.0.0.1:0")
            .with_heartbeat(HEARTBEAT),
    )
    .await
}

fn control_addr(server: &TunnelService) -> SocketAddr {
    server.bound_addrs().control.expect("control listener bound")
}

#[tokio::test]
async fn test_agent_registers_and_quits() {
    let (service_addr, _service) = spawn_echo_server().await;
    let server = start_server().await;

    let agent = start(
        TunnelConfig::agent(tunnel_addr(&server).to_string(), service_addr.to_string())
            .with_cipher("none", "")
            .with_tunnel_name("localservice1")
            .with_control_addr(control_addr(&server).to_string())
            .with_heartbeat(HEARTBEAT)
            .with_backoff(ReconnectConfig::fixed(Duration::from_millis(50)))
            .with_shutdown_grace(Duration::from_millis(500)),
    )
    .await;

    let registry = server.registry();
    wait_until("tunnel registration", || {
        registry.get("localservice1").is_some()
    })
    .await;
    assert_eq!(
        registry.get("localservice1").unwrap().port,
        user_addr(&server).port()
    );
    wait_for_pending(&server, 1).await;

    // Heartbeats keep the registration alive well past the timeout
    tokio::time::sleep(HEARTBEAT * 6).await;
    assert!(registry.get("localservice1").is_some());
    assert_eq!(server.stats().pending_links, 1);

    agent.shutdown().await;
    wait_until("unregistration", || registry.count() == 0).await;
    wait_for_pending(&server, 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_agent_loses_pending_links() {
    let server = start_server().await;
    let registry = server.registry();

    let control = TcpStream::connect(control_addr(&server)).await.unwrap();
    let mut sink = FramedWrite::new(control, ControlCodec::new());
    sink.send(ControlMessage::Data("db".into())).await.unwrap();
    wait_until("tunnel registration", || registry.get("db").is_some()).await;

    let mut first = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    let mut second = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 2).await;

    // Stop heartbeating but keep the socket open
    assert!(is_closed_by_peer(&mut first).await);
    assert!(is_closed_by_peer(&mut second).await);
    assert_eq!(server.stats().pending_links, 0);
    assert!(registry.get("db").is_none());

    drop(sink);
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_drains_but_queue_stays_open() {
    let server = start_server().await;

    let control = TcpStream::connect(control_addr(&server)).await.unwrap();
    let mut sink = FramedWrite::new(control, ControlCodec::new());
    sink.send(ControlMessage::HeartBeat).await.unwrap();

    let mut stale = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    drop(sink);
    assert!(is_closed_by_peer(&mut stale).await);

    // A reconnecting agent's new links are accepted as usual
    let _fresh = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_garbage_on_control_channel_counts_as_loss() {
    let server = start_server().await;

    let mut control = TcpStream::connect(control_addr(&server)).await.unwrap();
    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    control.write_all(b"definitely not base64!\n").await.unwrap();
    assert!(is_closed_by_peer(&mut link).await);

    server.shutdown().await;
}

async fn control_channel(server: &TunnelService) -> FramedWrite<TcpStream, ControlCodec> {
    let stream = TcpStream::connect(control_addr(server)).await.unwrap();
    FramedWrite::new(stream, ControlCodec::new())
}

#[tokio::test]
async fn test_superseded_channel_keeps_newer_registration() {
    let server = start_server().await;
    let registry = server.registry();

    let mut old = control_channel(&server).await;
    old.send(ControlMessage::Data("db".into())).await.unwrap();
    wait_until("first registration", || registry.get("db").is_some()).await;
    let first = registry.get("db").unwrap().generation;

    // The agent reconnects its control channel before the old one is noticed dead
    let mut new = control_channel(&server).await;
    new.send(ControlMessage::Data("db".into())).await.unwrap();
    wait_until("re-registration", || {
        registry.get("db").map(|entry| entry.generation) != Some(first)
    })
    .await;
    let heartbeats = tokio::spawn(async move {
        while new.send(ControlMessage::HeartBeat).await.is_ok() {
            tokio::time::sleep(HEARTBEAT / 2).await;
        }
    });

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    drop(old);
    tokio::time::sleep(HEARTBEAT * 5).await;

    let entry = registry.get("db").expect("newer registration survives");
    assert_ne!(entry.generation, first);
    assert_eq!(server.stats().pending_links, 1);

    // Losing the live channel still cleans up
    heartbeats.abort();
    wait_until("unregistration", || registry.get("db").is_none()).await;
    assert!(is_closed_by_peer(&mut link).await);
    assert_eq!(server.stats().pending_links, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_paired_session_survives_liveness_loss() {
    let server = start_server().await;
    let registry = server.registry();

    let mut control = control_channel(&server).await;
    control.send(ControlMessage::Data("db".into())).await.unwrap();
    wait_until("tunnel registration", || registry.get("db").is_some()).await;

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
    wait_until("session", || server.stats().active_sessions == 1).await;

    drop(control);
    wait_until("unregistration", || registry.get("db").is_none()).await;

    // The already-paired session keeps relaying in both directions
    user.write_all(b"still here").await.unwrap();
    assert_eq!(read_exact_bytes(&mut link, 10).await, b"still here");
    link.write_all(b"ack").await.unwrap();
    assert_eq!(read_exact_bytes(&mut user, 3).await, b"ack");
    assert_eq!(server.stats().active_sessions, 1);

    drop(user);
    drop(link);
    wait_until("session end", || server.stats().active_sessions == 0).await;
    assert_eq!(server.stats().bytes_in, 10);
    assert_eq!(server.stats().bytes_out, 3);

    server.shutdown().await;
}

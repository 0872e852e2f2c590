//! Server-mode pairing of user connections with agent links, driven by
//! raw sockets standing in for the agent.

mod common;

use common::*;
use rqtunnel_server::{CipherSpec, ServiceState, TunnelConfig};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn test_users_pair_with_links_in_fifo_order() {
    let server = start(plain_server(8)).await;

    let mut links = Vec::new();
    for i in 0..3 {
        links.push(TcpStream::connect(tunnel_addr(&server)).await.unwrap());
        wait_for_pending(&server, i + 1).await;
    }

    let mut users = Vec::new();
    for (i, link) in links.iter_mut().enumerate() {
        let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
        let message = format!("user-{}", i);
        user.write_all(message.as_bytes()).await.unwrap();

        let received = read_exact_bytes(link, message.len()).await;
        assert_eq!(received, message.as_bytes(), "link {} got the wrong user", i);
        users.push(user);
    }

    assert_eq!(server.stats().pending_links, 0);
    assert_eq!(server.stats().active_sessions, 3);
    println!("✅ Links paired oldest-first");

    drop(users);
    drop(links);
    server.shutdown().await;
}

#[tokio::test]
async fn test_user_waits_for_agent_link() {
    let server = start(plain_server(4)).await;

    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
    user.write_all(b"early").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats().active_sessions, 0);

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    assert_eq!(read_exact_bytes(&mut link, 5).await, b"early");

    link.write_all(b"late reply").await.unwrap();
    assert_eq!(read_exact_bytes(&mut user, 10).await, b"late reply");

    server.shutdown().await;
}

#[tokio::test]
async fn test_third_user_waits_for_a_new_link() {
    let server = start(plain_server(2)).await;

    let mut first_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut second_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 2).await;

    let mut users = Vec::new();
    for i in 0..3 {
        let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
        user.write_all(format!("u{}", i).as_bytes()).await.unwrap();
        users.push(user);
    }

    assert_eq!(read_exact_bytes(&mut first_link, 2).await, b"u0");
    assert_eq!(read_exact_bytes(&mut second_link, 2).await, b"u1");

    // Nothing left to pair with
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.stats().active_sessions, 2);

    let mut third_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    assert_eq!(read_exact_bytes(&mut third_link, 2).await, b"u2");
    wait_until("third session", || server.stats().active_sessions == 3).await;

    drop(users);
    server.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_stops_agent_intake() {
    let server = start(plain_server(1)).await;

    let mut first_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    // Accepted, but held back until a queue slot frees up
    let mut second_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats().pending_links, 1);

    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
    user.write_all(b"a").await.unwrap();
    assert_eq!(read_exact_bytes(&mut first_link, 1).await, b"a");

    // The freed slot lets the second link in
    wait_for_pending(&server, 1).await;
    let mut second_user = TcpStream::connect(user_addr(&server)).await.unwrap();
    second_user.write_all(b"b").await.unwrap();
    assert_eq!(read_exact_bytes(&mut second_link, 1).await, b"b");

    server.shutdown().await;
}

#[tokio::test]
async fn test_link_traffic_is_ciphered() {
    let config = TunnelConfig::server("127.0.0.1:0", "127.0.0.1:0").with_cipher("rc4", "s3cret");
    let server = start(config).await;
    let spec = CipherSpec::new("rc4", "s3cret").unwrap();
    let (mut encryptor, mut decryptor) = spec.new_cipher().into_split();

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();

    let plaintext = b"GET / HTTP/1.1\r\n\r\n";
    user.write_all(plaintext).await.unwrap();

    let mut on_wire = read_exact_bytes(&mut link, plaintext.len()).await;
    assert_ne!(&on_wire[..], &plaintext[..]);
    decryptor.decrypt(&mut on_wire);
    assert_eq!(&on_wire[..], &plaintext[..]);

    // Replies from the agent side are decrypted before reaching the user
    let mut reply = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
    encryptor.encrypt(&mut reply);
    link.write_all(&reply).await.unwrap();
    assert_eq!(
        read_exact_bytes(&mut user, reply.len()).await,
        b"HTTP/1.1 200 OK\r\n\r\n"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_session_ends_when_agent_link_dies() {
    let server = start(plain_server(4)).await;

    let link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
    wait_until("session", || server.stats().active_sessions == 1).await;

    drop(link);
    assert!(is_closed_by_peer(&mut user).await);
    drop(user);
    wait_until("session teardown", || server.stats().active_sessions == 0).await;
    assert_eq!(server.stats().total_sessions, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stop_closes_listeners_and_lets_sessions_finish() {
    let server = start(plain_server(4)).await;
    let users_at = user_addr(&server);

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut user = TcpStream::connect(users_at).await.unwrap();
    user.write_all(b"before").await.unwrap();
    assert_eq!(read_exact_bytes(&mut link, 6).await, b"before");

    let mut idle_link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;

    server.stop();
    assert_eq!(server.state(), ServiceState::Stopping);

    // Queued links are closed right away
    assert!(is_closed_by_peer(&mut idle_link).await);

    // New users are refused once the listener is gone
    let refused = timeout(WAIT, async {
        while TcpStream::connect(users_at).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(refused.is_ok(), "user listener should close");

    // The in-flight session keeps relaying
    user.write_all(b"after").await.unwrap();
    assert_eq!(read_exact_bytes(&mut link, 5).await, b"after");
    assert_eq!(server.state(), ServiceState::Stopping);

    drop(user);
    drop(link);
    timeout(WAIT, server.wait_stopped())
        .await
        .expect("service should stop once the last session ends");
    assert_eq!(server.stats().active_sessions, 0);
}

#[tokio::test]
async fn test_grace_period_closes_stragglers() {
    let config = plain_server(4).with_shutdown_grace(Duration::from_millis(200));
    let server = start(config).await;

    let mut link = TcpStream::connect(tunnel_addr(&server)).await.unwrap();
    wait_for_pending(&server, 1).await;
    let mut user = TcpStream::connect(user_addr(&server)).await.unwrap();
    wait_until("session", || server.stats().active_sessions == 1).await;

    user.write_all(b"abc").await.unwrap();
    assert_eq!(read_exact_bytes(&mut link, 3).await, b"abc");

    server.stop();
    timeout(WAIT, server.wait_stopped())
        .await
        .expect("grace period should bound shutdown");
    assert_eq!(server.state(), ServiceState::Stopped);
    assert!(is_closed_by_peer(&mut user).await);

    // Bytes relayed before the forced close are still accounted for
    let stats = server.stats();
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.bytes_in, 3);
}

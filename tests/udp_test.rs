// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use ytnet::buffer::StreamBuf;
use ytnet::service::{setup_local_tracing, UdpClientCfg, UdpServerCfg, UdpSessionCfg};
use ytnet::utils::SessionState;
use ytnet::{AppError, AppResult, UdpClientPool, UdpServer};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn client_cfg(max_client_num: usize, idle_ms: u64) -> UdpClientCfg {
    UdpClientCfg {
        local_ep: loopback(),
        max_client_num,
        mgr_timer_dt_ms: 50,
        session: UdpSessionCfg {
            max_package_size: 1024,
            max_no_data_duration_ms: idle_ms,
        },
    }
}

fn server_cfg() -> UdpServerCfg {
    UdpServerCfg {
        listen_ep: loopback(),
        max_session_num: 16,
        mgr_timer_dt_ms: 50,
        session: UdpSessionCfg::default(),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_round_trip(_setup: ()) -> AppResult<()> {
    let server = UdpServer::new(server_cfg());
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    server.register_msg_handle_func(move |remote, data| {
        let _ = server_tx.send((remote, data));
    });
    server.start().await?;

    let clients = UdpClientPool::new(client_cfg(4, 60_000));
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    clients.register_msg_handle_func(move |remote, data| {
        let _ = client_tx.send((remote, data));
    });
    clients.start()?;

    // the payload is assembled in two prepare/commit rounds
    let mut buf = StreamBuf::new();
    buf.prepare(8).copy_from_slice(b"12345678");
    buf.commit(8);
    buf.prepare(8).copy_from_slice(b"abcdefgh");
    buf.commit(8);
    let payload = buf.split();
    assert_eq!(payload.len(), 16);

    let server_addr = server.local_addr()?;
    clients.send_msg(server_addr, payload.clone()).await?;

    let (from, received) = server_rx.recv().await.unwrap();
    assert_eq!(&received[..], b"12345678abcdefgh");
    assert_eq!(from, clients.get_client(server_addr).await?.local_addr());
    assert_eq!(server.session_count().await?, 1);

    server.send_msg(from, Bytes::from_static(b"pong")).await?;
    let (reply_from, reply) = client_rx.recv().await.unwrap();
    assert_eq!(reply_from, server_addr);
    assert_eq!(&reply[..], b"pong");

    clients.stop().await;
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_session_is_stopped(_setup: ()) -> AppResult<()> {
    let sink = UdpSocket::bind(loopback()).await?;
    let clients = UdpClientPool::new(client_cfg(4, 100));
    clients.start()?;

    let session = clients.get_client(sink.local_addr()?).await?;
    session.send_msg(Bytes::from_static(b"hello")).await?;
    assert!(session.is_running());

    // one tick clears the traffic flag, the next one finds it clear
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!session.is_running());
    assert!(matches!(
        session.send_msg(Bytes::from_static(b"late")).await,
        Err(AppError::SessionStopped(_))
    ));

    // a fresh session replaces the dead one
    let replacement = clients.get_client(sink.local_addr()?).await?;
    assert_ne!(replacement.id(), session.id());
    assert_eq!(session.state(), SessionState::Stopped);
    clients.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_with_traffic_stays_alive(_setup: ()) -> AppResult<()> {
    let sink = UdpSocket::bind(loopback()).await?;
    let clients = UdpClientPool::new(client_cfg(4, 200));
    clients.start()?;

    let session = clients.get_client(sink.local_addr()?).await?;
    // traffic well inside every period, across five idle ticks
    for _ in 0..20 {
        session.send_msg(Bytes::from_static(b"keepalive")).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(session.is_running());
    clients.stop().await;
    assert!(!session.is_running());
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_is_enforced(_setup: ()) -> AppResult<()> {
    let clients = UdpClientPool::new(client_cfg(2, 60_000));
    clients.start()?;

    let mut sinks = Vec::new();
    for _ in 0..3 {
        sinks.push(UdpSocket::bind(loopback()).await?);
    }
    clients.get_client(sinks[0].local_addr()?).await?;
    let second = clients.get_client(sinks[1].local_addr()?).await?;

    let refused = clients.get_client(sinks[2].local_addr()?).await;
    assert!(matches!(refused, Err(AppError::CapacityExceeded(_))));
    assert_eq!(clients.session_count().await?, 2);

    // a stopped session frees its slot for the next request
    second.stop();
    clients.get_client(sinks[2].local_addr()?).await?;
    assert_eq!(clients.session_count().await?, 2);
    clients.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_arrive_intact(_setup: ()) -> AppResult<()> {
    const SENDERS: usize = 32;
    let sink = UdpSocket::bind(loopback()).await?;
    let remote = sink.local_addr()?;
    let clients = std::sync::Arc::new(UdpClientPool::new(client_cfg(4, 60_000)));
    clients.start()?;

    let mut tasks = Vec::new();
    for i in 0..SENDERS {
        let clients = clients.clone();
        tasks.push(tokio::spawn(async move {
            let payload = format!("message-{:04}-{}", i, "x".repeat(i));
            clients.send_msg(remote, Bytes::from(payload)).await
        }));
    }
    for task in tasks {
        task.await.unwrap()?;
    }

    let mut seen = HashSet::new();
    let mut buf = vec![0u8; 2048];
    while seen.len() < SENDERS {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sink.recv_from(&mut buf))
            .await
            .expect("datagram lost")?;
        seen.insert(String::from_utf8(buf[..n].to_vec()).unwrap());
    }
    let expected: HashSet<String> = (0..SENDERS)
        .map(|i| format!("message-{:04}-{}", i, "x".repeat(i)))
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(clients.session_count().await?, 1);
    clients.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_oversized_message_is_rejected(_setup: ()) -> AppResult<()> {
    let sink = UdpSocket::bind(loopback()).await?;
    let clients = UdpClientPool::new(client_cfg(1, 60_000));
    clients.start()?;
    let session = clients.get_client(sink.local_addr()?).await?;
    let result = session.send_msg(Bytes::from(vec![0u8; 1025])).await;
    assert!(matches!(result, Err(AppError::MessageTooLarge(_))));
    // a refused message does not hurt the session
    assert!(session.is_running());
    clients.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_socket_released_on_stop(_setup: ()) -> AppResult<()> {
    let sink = UdpSocket::bind(loopback()).await?;
    let clients = UdpClientPool::new(client_cfg(4, 60_000));
    clients.start()?;
    let session = clients.get_client(sink.local_addr()?).await?;
    session.send_msg(Bytes::from_static(b"hello")).await?;
    let local = session.local_addr();

    session.stop();
    clients.stop().await;

    // the session handle is still held, its port must be free anyway
    let mut rebound = UdpSocket::bind(local).await;
    for _ in 0..100 {
        if rebound.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        rebound = UdpSocket::bind(local).await;
    }
    assert!(rebound.is_ok(), "{} still bound: {:?}", local, rebound.err());
    assert_eq!(session.state(), SessionState::Stopped);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_server_delivers_after_idle_slot_frees(_setup: ()) -> AppResult<()> {
    let server = UdpServer::new(UdpServerCfg {
        max_session_num: 1,
        session: UdpSessionCfg {
            max_package_size: 1024,
            max_no_data_duration_ms: 100,
        },
        ..server_cfg()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_msg_handle_func(move |remote, data| {
        let _ = tx.send((remote, data));
    });
    server.start().await?;
    let server_addr = server.local_addr()?;

    let peer_a = UdpSocket::bind(loopback()).await?;
    let peer_b = UdpSocket::bind(loopback()).await?;
    peer_a.send_to(b"from a", server_addr).await?;
    let (from, data) = rx.recv().await.unwrap();
    assert_eq!(from, peer_a.local_addr()?);
    assert_eq!(&data[..], b"from a");
    let session_a = server.session(from).await?;

    // the only slot belongs to a, b waits for it
    peer_b.send_to(b"from b", server_addr).await?;
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
        .await
        .is_err());

    let (from, data) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("datagram from b never delivered")
        .unwrap();
    assert_eq!(from, peer_b.local_addr()?);
    assert_eq!(&data[..], b"from b");
    // a was stopped by its idle timer on the server side
    assert!(!session_a.is_running());
    assert_eq!(server.session_count().await?, 1);
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_drops_oversized_datagram(_setup: ()) -> AppResult<()> {
    let server = UdpServer::new(UdpServerCfg {
        session: UdpSessionCfg {
            max_package_size: 64,
            max_no_data_duration_ms: 60_000,
        },
        ..server_cfg()
    });
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_msg_handle_func(move |_, data: Bytes| {
        let _ = tx.send(data);
    });
    server.start().await?;
    let server_addr = server.local_addr()?;

    let peer = UdpSocket::bind(loopback()).await?;
    peer.send_to(&[1u8; 65], server_addr).await?;
    peer.send_to(&[2u8; 64], server_addr).await?;

    // the oversized one is neither truncated nor delivered
    let data = rx.recv().await.unwrap();
    assert_eq!(&data[..], &[2u8; 64][..]);
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());
    server.stop().await;
    Ok(())
}

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

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use ytnet::network::{FrameHeader, HEADER_LEN};
use ytnet::service::{setup_local_tracing, TcpPoolCfg};
use ytnet::{AppResult, Package, TcpConnPool};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn pool_cfg(max_conn_num: usize) -> TcpPoolCfg {
    TcpPoolCfg {
        listen_ep: SocketAddr::from(([127, 0, 0, 1], 0)),
        max_conn_num,
        max_body_size: 64 * 1024,
        mgr_timer_dt_ms: 50,
        write_block_size: 64,
        ..Default::default()
    }
}

async fn wait_for_count(pool: &TcpConnPool, expected: usize) -> AppResult<usize> {
    let mut count = pool.conn_count().await?;
    for _ in 0..200 {
        if count == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        count = pool.conn_count().await?;
    }
    Ok(count)
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_packages_in_order_between_pools(_setup: ()) -> AppResult<()> {
    let server = TcpConnPool::new(pool_cfg(8));
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_msg_handle_func(move |remote, package| {
        let _ = tx.send((remote, package));
    });
    server.start().await?;
    let server_addr = server.local_addr()?;

    let client = TcpConnPool::new(pool_cfg(8));
    let packages = vec![
        Package::ClassObject(Bytes::from(vec![1u8; 300])),
        Package::Quick(Bytes::from_static(b"quick")),
        Package::DataItem {
            tip: "tick".into(),
            data: Bytes::from_static(b"42"),
        },
        Package::File {
            name: "a/b.bin".into(),
            data: Bytes::from(vec![9u8; 1000]),
        },
        Package::End,
    ];
    for package in &packages {
        client.send(server_addr, package).await?;
    }

    let mut received = Vec::new();
    let mut peer = None;
    for _ in 0..packages.len() {
        let (remote, package) = rx.recv().await.unwrap();
        peer = Some(remote);
        received.push(package);
    }
    assert_eq!(received, packages);
    assert_eq!(client.conn_count().await?, 1);

    // replies go back over the accepted connection
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    client.register_msg_handle_func(move |_, package| {
        let _ = reply_tx.send(package);
    });
    let reply = Package::Quick(Bytes::from_static(b"ack"));
    server.send(peer.unwrap(), &reply).await?;
    assert_eq!(reply_rx.recv().await, Some(reply));
    assert_eq!(server.conn_count().await?, 1);

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_magic_invokes_error_callback(_setup: ()) -> AppResult<()> {
    let server = TcpConnPool::new(pool_cfg(8));
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    server.register_err_handle_func(move |remote, err| {
        let _ = err_tx.send((remote, err.to_string()));
    });
    server.start().await?;

    let mut raw = TcpStream::connect(server.local_addr()?).await?;
    assert_eq!(wait_for_count(&server, 1).await?, 1);
    raw.write_all(&[b'Y', b'X', b'Q', b'D', 0, 0, 0, 0]).await?;

    let (remote, message) = err_rx.recv().await.unwrap();
    assert_eq!(remote, raw.local_addr()?);
    assert!(message.contains("magic"), "{}", message);

    // the pool closed its side and dropped the entry
    let mut rest = Vec::new();
    raw.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    assert_eq!(wait_for_count(&server, 0).await?, 0);
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_frame_is_decoded(_setup: ()) -> AppResult<()> {
    let server = TcpConnPool::new(pool_cfg(8));
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.register_msg_handle_func(move |_, package| {
        let _ = tx.send(package);
    });
    server.start().await?;

    let mut raw = TcpStream::connect(server.local_addr()?).await?;
    let wire = Package::Quick(Bytes::from_static(b"split across writes")).to_bytes()?;
    // header and body arrive in separate segments
    raw.write_all(&wire[..HEADER_LEN - 3]).await?;
    raw.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.write_all(&wire[HEADER_LEN - 3..HEADER_LEN + 4]).await?;
    raw.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    raw.write_all(&wire[HEADER_LEN + 4..]).await?;

    assert_eq!(
        rx.recv().await,
        Some(Package::Quick(Bytes::from_static(b"split across writes")))
    );
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&wire[..HEADER_LEN]);
    assert_eq!(FrameHeader::decode(&header, 1024)?.body_len, 19);
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_accept_refused_when_full(_setup: ()) -> AppResult<()> {
    let server = TcpConnPool::new(pool_cfg(1));
    server.start().await?;
    let addr = server.local_addr()?;

    let _first = TcpStream::connect(addr).await?;
    assert_eq!(wait_for_count(&server, 1).await?, 1);

    let mut second = TcpStream::connect(addr).await?;
    let mut buf = [0u8; 1];
    // the refused stream is dropped by the pool, the peer sees EOF
    let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("refused connection left open");
    assert!(matches!(read, Ok(0)) || read.is_err());
    assert_eq!(server.conn_count().await?, 1);
    server.stop().await;
    Ok(())
}

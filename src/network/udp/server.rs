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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HandlerSlot, MsgHandleFunc, UdpSession};
use crate::service::{UdpServerCfg, MAX_UDP_PAYLOAD};
use crate::utils::{SessionPool, Strand};
use crate::{AppError, AppResult};

/// UDP listener that demultiplexes datagrams from one shared socket into
/// per-peer [`UdpSession`]s.
///
/// Cloning gives another handle to the same server.
#[derive(Debug, Clone)]
pub struct UdpServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cfg: UdpServerCfg,
    socket: OnceCell<Arc<UdpSocket>>,
    mgr_strand: Strand<SessionPool<UdpSession>>,
    directory: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    handler: Arc<HandlerSlot>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl UdpServer {
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: UdpServerCfg) -> Self {
        let cfg = cfg.verify();
        let pool = SessionPool::new("udp server", cfg.max_session_num);
        let directory = pool.directory();
        UdpServer {
            inner: Arc::new(Inner {
                cfg,
                socket: OnceCell::new(),
                mgr_strand: Strand::new("udp-server-mgr", pool),
                directory,
                handler: Arc::new(HandlerSlot::default()),
                running: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn register_msg_handle_func<F>(&self, func: F)
    where
        F: Fn(SocketAddr, Bytes) + Send + Sync + 'static,
    {
        let func: MsgHandleFunc = Arc::new(func);
        self.inner.handler.set(func);
    }

    /// Binds the listening socket and spawns the receive and reaper loops.
    pub async fn start(&self) -> AppResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError("udp server started twice".into()));
        }
        let listen_ep = self.inner.cfg.listen_ep;
        let socket = match UdpSocket::bind(listen_ep).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind udp server to address: {} - Error: {}",
                    listen_ep, err
                );
                error!("{}", error_msg);
                self.inner.running.store(false, Ordering::Release);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local = socket.local_addr()?;
        if self.inner.socket.set(socket.clone()).is_err() {
            return Err(AppError::IllegalStateError(
                "udp server socket already bound".into(),
            ));
        }

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.recv_loop(socket).await {
                error!("udp server receive loop failed: {}", err);
                server.stop().await;
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.reaper_loop().await {
                error!("udp server reaper loop failed: {}", err);
                server.stop().await;
            }
        });

        info!(
            "udp server listening on {}, max session num {}",
            local, self.inner.cfg.max_session_num
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        let socket = self
            .inner
            .socket
            .get()
            .ok_or_else(|| AppError::IllegalStateError("udp server is not bound".into()))?;
        Ok(socket.local_addr()?)
    }

    /// Live session for `remote`, created on the manager strand when absent.
    pub async fn session(&self, remote: SocketAddr) -> AppResult<Arc<UdpSession>> {
        if let Some(session) = self.inner.directory.get(&remote) {
            if session.is_running() {
                return Ok(session.clone());
            }
        }
        match self.get_or_create(remote).await? {
            Some(session) => Ok(session),
            None => Err(AppError::CapacityExceeded(format!(
                "udp server reached max session num {}",
                self.inner.cfg.max_session_num
            ))),
        }
    }

    /// Sends one datagram to `remote` through its session.
    pub async fn send_msg(&self, remote: SocketAddr, data: Bytes) -> AppResult<()> {
        self.session(remote).await?.send_msg(data).await
    }

    pub async fn session_count(&self) -> AppResult<usize> {
        self.inner
            .mgr_strand
            .call(|pool: &mut SessionPool<UdpSession>| pool.len())
            .await
    }

    /// `None` when the pool is full of live sessions.
    async fn get_or_create(&self, remote: SocketAddr) -> AppResult<Option<Arc<UdpSession>>> {
        if !self.is_running() {
            return Err(AppError::IllegalStateError("udp server is not running".into()));
        }
        let socket = self
            .inner
            .socket
            .get()
            .cloned()
            .ok_or_else(|| AppError::IllegalStateError("udp server is not bound".into()))?;
        let session_cfg = self.inner.cfg.session.clone();
        let handler = self.inner.handler.clone();
        self.inner
            .mgr_strand
            .call(move |pool: &mut SessionPool<UdpSession>| {
                let created = pool.get_or_insert_with(remote, |id| {
                    let session =
                        UdpSession::new(id, remote, socket, false, session_cfg, handler)?;
                    session.start()?;
                    Ok(session)
                });
                match created {
                    Ok(session) => Ok(Some(session)),
                    Err(AppError::CapacityExceeded(_)) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await?
    }

    async fn recv_loop(&self, socket: Arc<UdpSocket>) -> AppResult<()> {
        let dt = self.inner.cfg.mgr_timer_dt();
        let max_package_size = self.inner.cfg.session.max_package_size;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        loop {
            let (n, from) = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => received?,
            };
            if n > max_package_size {
                warn!(
                    "udp server dropped {} byte datagram from {}, max package size {}",
                    n, from, max_package_size
                );
                continue;
            }
            let data = Bytes::copy_from_slice(&buf[..n]);

            // at capacity: back off and retry the same datagram, nothing is queued
            loop {
                match self.get_or_create(from).await? {
                    Some(session) => {
                        session.post_recv(data);
                        break;
                    }
                    None => {
                        warn!(
                            "udp server is full ({} sessions), datagram from {} waits {:?}",
                            self.inner.cfg.max_session_num, from, dt
                        );
                        tokio::select! {
                            _ = self.inner.cancel.cancelled() => return Ok(()),
                            _ = time::sleep(dt) => {}
                        }
                    }
                }
            }
        }
    }

    async fn reaper_loop(&self) -> AppResult<()> {
        let dt = self.inner.cfg.mgr_timer_dt();
        let mut ticker = time::interval_at(Instant::now() + dt, dt);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.inner
                .mgr_strand
                .call(|pool: &mut SessionPool<UdpSession>| pool.sweep())
                .await?;
        }
    }

    /// Stops the loops and every session. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        match self
            .inner
            .mgr_strand
            .call(|pool: &mut SessionPool<UdpSession>| pool.drain())
            .await
        {
            Ok(sessions) => {
                for session in sessions {
                    session.stop();
                }
            }
            Err(err) => {
                error!("udp server failed to drain sessions: {}", err);
                for entry in self.inner.directory.iter() {
                    entry.value().stop();
                }
            }
        }
        self.inner.mgr_strand.close();
        info!("udp server stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for entry in self.directory.iter() {
            entry.value().stop();
        }
        debug!("udp server dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::UdpSessionCfg;
    use std::time::Duration;

    fn cfg() -> UdpServerCfg {
        UdpServerCfg {
            listen_ep: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_session_num: 4,
            mgr_timer_dt_ms: 20,
            session: UdpSessionCfg::default(),
        }
    }

    #[tokio::test]
    async fn test_failed_reaper_stops_server() -> AppResult<()> {
        let server = UdpServer::new(cfg());
        server.start().await?;
        let peer = UdpSocket::bind("127.0.0.1:0").await?;
        let session = server.session(peer.local_addr()?).await?;

        // the reaper's next sweep can no longer reach the session pool
        server.inner.mgr_strand.close();
        // sessions are the last thing the fail-fast stop tears down
        for _ in 0..100 {
            if !session.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!session.is_running());
        assert!(!server.is_running());
        assert!(server.inner.cancel.is_cancelled());
        assert!(matches!(
            server.send_msg(peer.local_addr()?, Bytes::from_static(b"late")).await,
            Err(AppError::IllegalStateError(_))
        ));
        Ok(())
    }
}

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
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{HandlerSlot, MsgHandleFunc, UdpSession};
use crate::service::UdpClientCfg;
use crate::utils::{SessionPool, Strand};
use crate::{AppError, AppResult};

/// Client side session manager: one socket and one [`UdpSession`] per remote endpoint.
#[derive(Debug)]
pub struct UdpClientPool {
    cfg: UdpClientCfg,
    mgr_strand: Strand<SessionPool<UdpSession>>,
    directory: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    handler: Arc<HandlerSlot>,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl UdpClientPool {
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: UdpClientCfg) -> Self {
        let cfg = cfg.verify();
        let pool = SessionPool::new("udp client pool", cfg.max_client_num);
        let directory = pool.directory();
        Self {
            cfg,
            mgr_strand: Strand::new("udp-client-pool-mgr", pool),
            directory,
            handler: Arc::new(HandlerSlot::default()),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn register_msg_handle_func<F>(&self, func: F)
    where
        F: Fn(SocketAddr, Bytes) + Send + Sync + 'static,
    {
        let func: MsgHandleFunc = Arc::new(func);
        self.handler.set(func);
    }

    /// Starts the reaper loop that erases dead sessions every `mgr_timer_dt`.
    pub fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError(
                "udp client pool started twice".into(),
            ));
        }
        let strand = self.mgr_strand.clone();
        let cancel = self.cancel.clone();
        let dt = self.cfg.mgr_timer_dt();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + dt, dt);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = strand.call(|pool: &mut SessionPool<UdpSession>| pool.sweep()).await {
                    error!("udp client pool reaper failed: {}", err);
                    break;
                }
            }
            debug!("udp client pool reaper exited");
        });
        info!("udp client pool started, max client num {}", self.cfg.max_client_num);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the live session to `remote`, creating it when there is none.
    ///
    /// The lookup first goes through the lock-free directory; creation happens on
    /// the manager strand, which checks again so a session is built exactly once.
    /// Fails with `CapacityExceeded` when `max_client_num` live sessions exist.
    pub async fn get_client(&self, remote: SocketAddr) -> AppResult<Arc<UdpSession>> {
        if !self.is_running() {
            return Err(AppError::IllegalStateError(
                "udp client pool is not running".into(),
            ));
        }
        if let Some(session) = self.directory.get(&remote) {
            if session.is_running() {
                return Ok(session.clone());
            }
        }

        let local_ep = self.cfg.local_ep;
        let session_cfg = self.cfg.session.clone();
        let handler = self.handler.clone();
        self.mgr_strand
            .call(move |pool: &mut SessionPool<UdpSession>| {
                pool.get_or_insert_with(remote, |id| {
                    let std_socket = std::net::UdpSocket::bind(local_ep)?;
                    std_socket.set_nonblocking(true)?;
                    let socket = Arc::new(UdpSocket::from_std(std_socket)?);
                    let session =
                        UdpSession::new(id, remote, socket, true, session_cfg, handler)?;
                    session.start()?;
                    Ok(session)
                })
            })
            .await?
    }

    /// Sends `data` as one datagram to `remote`, creating the session on demand.
    pub async fn send_msg(&self, remote: SocketAddr, data: Bytes) -> AppResult<()> {
        self.get_client(remote).await?.send_msg(data).await
    }

    pub async fn session_count(&self) -> AppResult<usize> {
        self.mgr_strand
            .call(|pool: &mut SessionPool<UdpSession>| pool.len())
            .await
    }

    /// Stops every session and the reaper. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        match self
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
                error!("udp client pool failed to drain sessions: {}", err);
                for entry in self.directory.iter() {
                    entry.value().stop();
                }
            }
        }
        self.mgr_strand.close();
        info!("udp client pool stopped");
    }
}

impl Drop for UdpClientPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        for entry in self.directory.iter() {
            entry.value().stop();
        }
        debug!("udp client pool dropped");
    }
}

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
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future;
use once_cell::sync::OnceCell;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::connection::{ConnContext, TcpConnection};
use super::{ConnHandlers, ErrorHandleFunc, PackageHandleFunc};
use crate::network::frame::Package;
use crate::service::TcpPoolCfg;
use crate::utils::{SessionId, SessionPool, Strand};
use crate::{AppError, AppResult};

type ConnPool = SessionPool<TcpConnection>;

/// Accepting and connecting side of the framed TCP protocol.
///
/// Connections are keyed by peer endpoint. The map is only mutated on the
/// manager strand; `connect` and `send` read the lock-free directory first.
/// Cloning gives another handle to the same pool.
#[derive(Debug, Clone)]
pub struct TcpConnPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cfg: TcpPoolCfg,
    local_addr: OnceCell<SocketAddr>,
    mgr_strand: Strand<ConnPool>,
    directory: Arc<DashMap<SocketAddr, Arc<TcpConnection>>>,
    handlers: Arc<ConnHandlers>,
    started: AtomicBool,
    // set once at the start of `stop`, checked before every map access
    shutting_down: AtomicBool,
    cancel: CancellationToken,
}

impl TcpConnPool {
    /// Must be called from within a tokio runtime. Outbound `connect`/`send`
    /// work without `start`, which is only needed to accept connections.
    pub fn new(cfg: TcpPoolCfg) -> Self {
        let cfg = cfg.verify();
        let pool = SessionPool::new("tcp pool", cfg.max_conn_num);
        let directory = pool.directory();
        TcpConnPool {
            inner: Arc::new(Inner {
                cfg,
                local_addr: OnceCell::new(),
                mgr_strand: Strand::new("tcp-pool-mgr", pool),
                directory,
                handlers: Arc::new(ConnHandlers::default()),
                started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn register_msg_handle_func<F>(&self, func: F)
    where
        F: Fn(SocketAddr, Package) + Send + Sync + 'static,
    {
        let func: PackageHandleFunc = Arc::new(func);
        self.inner.handlers.set_msg_func(func);
    }

    pub fn register_err_handle_func<F>(&self, func: F)
    where
        F: Fn(SocketAddr, &AppError) + Send + Sync + 'static,
    {
        let func: ErrorHandleFunc = Arc::new(func);
        self.inner.handlers.set_err_func(func);
    }

    /// Binds the listener and spawns the accept and reaper loops.
    pub async fn start(&self) -> AppResult<()> {
        if self.is_shutting_down() {
            return Err(AppError::IllegalStateError("tcp pool is stopped".into()));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(AppError::IllegalStateError("tcp pool started twice".into()));
        }
        let listen_ep = self.inner.cfg.listen_ep;
        let listener = match TcpListener::bind(listen_ep).await {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind tcp pool to address: {} - Error: {}",
                    listen_ep, err
                );
                error!("{}", error_msg);
                self.inner.started.store(false, Ordering::Release);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local = listener.local_addr()?;
        let _ = self.inner.local_addr.set(local);

        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.accept_loop(listener).await {
                error!("tcp pool accept loop failed: {}", err);
                pool.stop().await;
            }
        });

        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.reaper_loop().await {
                if !pool.is_shutting_down() {
                    error!("tcp pool reaper loop failed: {}", err);
                }
            }
        });

        info!(
            "tcp pool listening on {}, max conn num {}",
            local, self.inner.cfg.max_conn_num
        );
        Ok(())
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        self.inner
            .local_addr
            .get()
            .copied()
            .ok_or_else(|| AppError::IllegalStateError("tcp pool is not listening".into()))
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn conn_context(&self) -> ConnContext {
        let strand = self.inner.mgr_strand.clone();
        ConnContext {
            max_body_size: self.inner.cfg.max_body_size,
            write_block_size: self.inner.cfg.write_block_size,
            handlers: self.inner.handlers.clone(),
            on_closed: Arc::new(move |id: SessionId| {
                let removed = strand.post(move |pool: &mut ConnPool| {
                    pool.remove(id);
                    Box::pin(future::ready(()))
                });
                if removed.is_err() {
                    trace!("tcp pool closed, connection {} already released", id);
                }
            }),
        }
    }

    /// Registers `stream` under `remote`. If a live connection to that endpoint
    /// already exists it wins and `stream` is dropped.
    async fn insert_stream(
        &self,
        remote: SocketAddr,
        stream: TcpStream,
    ) -> AppResult<Arc<TcpConnection>> {
        if self.is_shutting_down() {
            return Err(AppError::IllegalStateError("tcp pool is stopping".into()));
        }
        let ctx = self.conn_context();
        self.inner
            .mgr_strand
            .call(move |pool: &mut ConnPool| {
                pool.get_or_insert_with(remote, move |id| TcpConnection::spawn(id, stream, ctx))
            })
            .await?
    }

    /// Live connection to `remote`, connecting when there is none.
    ///
    /// The connect itself runs outside the manager strand. When it fails the map
    /// is checked again, since an inbound connection from the same endpoint may
    /// have been accepted meanwhile.
    pub async fn connect(&self, remote: SocketAddr) -> AppResult<Arc<TcpConnection>> {
        if self.is_shutting_down() {
            return Err(AppError::IllegalStateError("tcp pool is stopping".into()));
        }
        if let Some(connection) = self.inner.directory.get(&remote) {
            if connection.is_running() {
                return Ok(connection.clone());
            }
        }

        let timeout = self.inner.cfg.connect_timeout();
        let connect_err = match time::timeout(timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => return self.insert_stream(remote, stream).await,
            Ok(Err(err)) => AppError::from(err),
            Err(_) => AppError::DetailedIoError(format!(
                "connect to {} timed out after {:?}",
                remote, timeout
            )),
        };

        if self.is_shutting_down() {
            return Err(connect_err);
        }
        let raced = self
            .inner
            .mgr_strand
            .call(move |pool: &mut ConnPool| pool.get_live(&remote))
            .await?;
        match raced {
            Some(connection) => {
                debug!(
                    "tcp pool connect to {} failed ({}), using raced inbound connection",
                    remote, connect_err
                );
                Ok(connection)
            }
            None => {
                warn!("tcp pool connect to {} failed: {}", remote, connect_err);
                Err(connect_err)
            }
        }
    }

    /// Sends one package to `remote`, connecting first if needed.
    pub async fn send(&self, remote: SocketAddr, package: &Package) -> AppResult<()> {
        self.connect(remote).await?.send_package(package).await
    }

    pub async fn conn_count(&self) -> AppResult<usize> {
        self.inner
            .mgr_strand
            .call(|pool: &mut ConnPool| pool.len())
            .await
    }

    /// Accepts until cancelled. Transient accept errors are retried with an
    /// exponential backoff; giving up fails the loop.
    async fn accept_loop(&self, listener: TcpListener) -> AppResult<()> {
        loop {
            let (stream, remote) = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                accepted = Self::accept(&listener) => accepted?,
            };
            if self.is_shutting_down() {
                return Ok(());
            }
            match self.insert_stream(remote, stream).await {
                Ok(connection) => {
                    debug!("tcp pool accepted connection {} from {}", connection.id(), remote)
                }
                Err(AppError::CapacityExceeded(msg)) => {
                    warn!("tcp pool refused connection from {}: {}", remote, msg)
                }
                Err(err) => warn!("tcp pool failed to register {}: {}", remote, err),
            }
        }
    }

    async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp connection error: {}",
                            err
                        )));
                    }
                    warn!("tcp pool accept error, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
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
                .call(|pool: &mut ConnPool| pool.sweep())
                .await?;
        }
    }

    /// Stops accepting, closes every connection and waits for their read loops.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        let connections = match self
            .inner
            .mgr_strand
            .call(|pool: &mut ConnPool| pool.drain())
            .await
        {
            Ok(connections) => connections,
            Err(err) => {
                error!("tcp pool failed to drain connections: {}", err);
                Vec::new()
            }
        };
        self.inner.mgr_strand.close();

        for connection in &connections {
            connection.stop();
        }
        // the map is already empty, joining cannot race with a removal
        let wait = self.inner.cfg.mgr_timer_dt();
        for connection in connections {
            if time::timeout(wait, connection.join()).await.is_err() {
                warn!(
                    "tcp connection {} read loop did not exit within {:?}",
                    connection.id(),
                    wait
                );
            }
        }
        info!("tcp pool stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        self.cancel.cancel();
        for entry in self.directory.iter() {
            entry.value().stop();
        }
        debug!("tcp pool dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn local_cfg() -> TcpPoolCfg {
        TcpPoolCfg {
            listen_ep: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_conn_num: 2,
            mgr_timer_dt_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_reuses_live_connection() -> AppResult<()> {
        let server = TcpConnPool::new(local_cfg());
        server.start().await?;
        let client = TcpConnPool::new(local_cfg());

        let first = client.connect(server.local_addr()?).await?;
        let second = client.connect(server.local_addr()?).await?;
        assert_eq!(first.id(), second.id());
        assert_eq!(client.conn_count().await?, 1);

        client.stop().await;
        server.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() -> AppResult<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let closed = listener.local_addr()?;
        drop(listener);

        let client = TcpConnPool::new(local_cfg());
        assert!(client.connect(closed).await.is_err());
        assert_eq!(client.conn_count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_stopped_pool_refuses_work() -> AppResult<()> {
        let pool = TcpConnPool::new(local_cfg());
        pool.start().await?;
        let addr = pool.local_addr()?;
        pool.stop().await;
        pool.stop().await;
        assert!(matches!(
            pool.send(addr, &Package::End).await,
            Err(AppError::IllegalStateError(_))
        ));
        assert!(pool.start().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_close_removes_connection() -> AppResult<()> {
        let server = TcpConnPool::new(local_cfg());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.register_msg_handle_func(move |remote, package| {
            let _ = tx.send((remote, package));
        });
        server.start().await?;

        let client = TcpConnPool::new(local_cfg());
        let quick = Package::Quick(Bytes::from_static(b"ping"));
        client.send(server.local_addr()?, &quick).await?;
        let (_, received) = rx.recv().await.unwrap();
        assert_eq!(received, quick);
        assert_eq!(server.conn_count().await?, 1);

        client.stop().await;
        // the server side read loop sees EOF and drops its entry
        let mut remaining = server.conn_count().await?;
        for _ in 0..100 {
            if remaining == 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
            remaining = server.conn_count().await?;
        }
        assert_eq!(remaining, 0);
        server.stop().await;
        Ok(())
    }
}

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

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::HandlerSlot;
use crate::buffer::BufferVec;
use crate::service::{UdpSessionCfg, MAX_UDP_PAYLOAD};
use crate::utils::{log_step, panic_message, PooledSession, SessionId, SessionState, Strand};
use crate::{AppError, AppResult};

/// Socket side of a session, only touched from the session's I/O strand.
#[derive(Debug)]
struct SessionIo {
    socket: Option<Arc<UdpSocket>>,
}

/// One UDP peer.
///
/// Sends are funnelled through the session's I/O strand, so concurrent
/// `send_msg` calls go out one datagram at a time. Received payloads are handed
/// to the registered handler on the session's lifecycle strand, which also runs
/// the idle check. A session never holds a reference to the pool that owns it.
///
/// The socket is held by the I/O strand and, for sessions owning their socket,
/// by the receive loop. Both let go of it during `stop`, so the port is released
/// even while callers still hold the session.
pub struct UdpSession {
    id: SessionId,
    remote: SocketAddr,
    local_addr: SocketAddr,
    cfg: UdpSessionCfg,
    owns_socket: bool,
    recv_socket: Mutex<Option<Arc<UdpSocket>>>,
    state: Arc<AtomicU8>,
    has_traffic: Arc<AtomicBool>,
    io_strand: Strand<SessionIo>,
    lifecycle_strand: Strand<()>,
    cancel: CancellationToken,
    handler: Arc<HandlerSlot>,
}

impl UdpSession {
    /// Builds a session in the `Created` state. `owns_socket` sessions run their
    /// own receive loop on `socket`; the others are fed by their server.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(
        id: SessionId,
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        owns_socket: bool,
        cfg: UdpSessionCfg,
        handler: Arc<HandlerSlot>,
    ) -> AppResult<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        let recv_socket = owns_socket.then(|| socket.clone());
        let io_strand = Strand::new(
            format!("udp-session-{}-io", id),
            SessionIo {
                socket: Some(socket),
            },
        );
        let lifecycle_strand = Strand::new(format!("udp-session-{}-lifecycle", id), ());
        Ok(Arc::new(UdpSession {
            id,
            remote,
            local_addr,
            cfg,
            owns_socket,
            recv_socket: Mutex::new(recv_socket),
            state: Arc::new(AtomicU8::new(SessionState::Created as u8)),
            has_traffic: Arc::new(AtomicBool::new(false)),
            io_strand,
            lifecycle_strand,
            cancel: CancellationToken::new(),
            handler,
        }))
    }

    /// `Created -> Running`: spawns the idle timer and, for sessions owning their
    /// socket, the receive loop.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        if self
            .state
            .compare_exchange(
                SessionState::Created as u8,
                SessionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(AppError::IllegalStateError(format!(
                "udp session {} to {} started twice",
                self.id, self.remote
            )));
        }
        debug!("udp session {} to {} started", self.id, self.remote);
        self.spawn_idle_timer();
        if let Some(socket) = self.recv_socket.lock().take() {
            self.spawn_recv_loop(socket);
        }
        Ok(())
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one datagram. On an I/O error the session stops itself.
    pub async fn send_msg(&self, data: Bytes) -> AppResult<()> {
        if data.len() > self.cfg.max_package_size {
            return Err(AppError::MessageTooLarge(format!(
                "{} bytes exceeds max package size {}",
                data.len(),
                self.cfg.max_package_size
            )));
        }
        if !self.is_running() {
            return Err(AppError::SessionStopped(self.remote));
        }

        let remote = self.remote;
        let result = self
            .io_strand
            .run(move |io: &mut SessionIo| {
                Box::pin(async move {
                    let socket = io.socket.as_ref().ok_or(AppError::SessionStopped(remote))?;
                    let sent = socket.send_to(&data, remote).await?;
                    if sent != data.len() {
                        return Err(AppError::DetailedIoError(format!(
                            "sent {} of {} bytes to {}",
                            sent,
                            data.len(),
                            remote
                        )));
                    }
                    Ok::<(), AppError>(())
                })
            })
            .await
            .and_then(|sent| sent);

        match result {
            Ok(()) => {
                self.has_traffic.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                if err.is_session_fatal() {
                    if self.is_running() {
                        error!("udp session {} send to {} failed: {}", self.id, remote, err);
                    }
                    self.stop();
                }
                Err(err)
            }
        }
    }

    /// Sends the committed contents of a block buffer as one datagram.
    pub async fn send_buffer(&self, buffer: BufferVec) -> AppResult<()> {
        self.send_msg(buffer.into_bytes()).await
    }

    /// Marks traffic and hands the payload to the handler on the lifecycle strand.
    pub(crate) fn post_recv(&self, data: Bytes) {
        self.has_traffic.store(true, Ordering::Release);
        let handler = self.handler.clone();
        let remote = self.remote;
        let id = self.id;
        let posted = self.lifecycle_strand.post(move |_: &mut ()| {
            if let Some(func) = handler.get() {
                let len = data.len();
                if let Err(payload) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| func(remote, data)))
                {
                    error!(
                        "udp session {} handler panicked on {} bytes: {}",
                        id,
                        len,
                        panic_message(payload.as_ref())
                    );
                }
            } else {
                trace!("udp session {} dropped datagram, no handler registered", id);
            }
            Box::pin(future::ready(()))
        });
        if posted.is_err() {
            trace!("udp session {} closed, datagram from {} dropped", id, remote);
        }
    }

    fn spawn_idle_timer(self: &Arc<Self>) {
        let period = self.cfg.max_no_data_duration();
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // check and clear: an idle session lives between one and two periods
                let has_traffic = session.has_traffic.clone();
                let idle = session
                    .lifecycle_strand
                    .call(move |_: &mut ()| !has_traffic.swap(false, Ordering::AcqRel))
                    .await;
                match idle {
                    Ok(false) => continue,
                    Ok(true) => {
                        info!(
                            "udp session {} to {} idle for over {:?}, stopping",
                            session.id, session.remote, period
                        );
                        session.stop();
                        break;
                    }
                    Err(_) => break,
                }
            }
            trace!("udp session {} idle timer exited", session.id);
        });
    }

    fn spawn_recv_loop(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        let session = self.clone();
        tokio::spawn(async move {
            let max_package_size = session.cfg.max_package_size;
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
            loop {
                let received = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((n, from)) if from == session.remote && n > max_package_size => {
                        warn!(
                            "udp session {} dropped {} byte datagram, max package size {}",
                            session.id, n, max_package_size
                        );
                    }
                    Ok((n, from)) if from == session.remote => {
                        session.post_recv(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Ok((_, from)) => {
                        warn!(
                            "udp session {} ignored datagram from unexpected peer {}",
                            session.id, from
                        );
                    }
                    Err(err) => {
                        if session.is_running() {
                            error!("udp session {} receive failed: {}", session.id, err);
                        }
                        session.stop();
                        break;
                    }
                }
            }
            trace!("udp session {} receive loop exited", session.id);
        });
    }

    /// `Running -> Stopping -> Stopped`. Idempotent; only the first caller runs the
    /// teardown, every step is attempted even if an earlier one failed.
    pub fn stop(&self) {
        let from_running = self.state.compare_exchange(
            SessionState::Running as u8,
            SessionState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if from_running.is_err()
            && self
                .state
                .compare_exchange(
                    SessionState::Created as u8,
                    SessionState::Stopping as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return;
        }

        let owner = format!("udp session {} to {}", self.id, self.remote);
        // wakes the receive loop and the idle timer, both exit without rescheduling
        self.cancel.cancel();
        trace!("{} cancelled", owner);
        // never started, the receive loop did not take its socket
        drop(self.recv_socket.lock().take());

        let state = self.state.clone();
        let posted = self.io_strand.post(move |io: &mut SessionIo| {
            log_step(
                &owner,
                "close",
                io.socket.take().map(drop).ok_or_else(|| {
                    AppError::IllegalStateError("socket already released".into())
                }),
            );
            state.store(SessionState::Stopped as u8, Ordering::Release);
            debug!("{} stopped", owner);
            Box::pin(future::ready(()))
        });
        if posted.is_err() {
            self.state
                .store(SessionState::Stopped as u8, Ordering::Release);
        }
        self.io_strand.close();
        self.lifecycle_strand.close();
    }
}

impl PooledSession for UdpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn is_running(&self) -> bool {
        UdpSession::is_running(self)
    }

    fn stop(&self) {
        UdpSession::stop(self)
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("owns_socket", &self.owns_socket)
            .finish()
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        trace!("udp session {} dropped", self.id);
    }
}

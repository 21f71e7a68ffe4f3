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
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::ConnHandlers;
use crate::buffer::BufferVec;
use crate::network::frame::{FrameHeader, Package};
use crate::utils::{log_step, panic_message, PooledSession, SessionId, SessionState, Strand};
use crate::{AppError, AppResult};

/// Called once the read loop of a connection has exited, for whatever reason.
pub(crate) type ClosedFunc = Arc<dyn Fn(SessionId) + Send + Sync>;

/// What a connection needs from the pool that created it.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub max_body_size: usize,
    pub write_block_size: usize,
    pub handlers: Arc<ConnHandlers>,
    pub on_closed: ClosedFunc,
}

/// Write side of a connection, only touched from the connection's I/O strand.
#[derive(Debug)]
struct ConnIo {
    writer: Option<BufWriter<OwnedWriteHalf>>,
}

/// Read side of a connection, owned by its read loop task.
///
/// Bytes are accumulated in `buffer` until a whole frame is present, header
/// first and then the body the header announced.
#[derive(Debug)]
struct PackageReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    max_body_size: usize,
}

impl PackageReader {
    fn new(reader: OwnedReadHalf, max_body_size: usize) -> Self {
        PackageReader {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_body_size,
        }
    }

    /// Reads the next package.
    ///
    /// A malformed header or an oversized body is returned as an error and the
    /// connection should be closed. `None` means the peer closed the connection
    /// on a frame boundary; closing in the middle of a frame is an error.
    async fn read_package(&mut self) -> AppResult<Option<Package>> {
        loop {
            if let Some(package) = FrameHeader::parse(&mut self.buffer, self.max_body_size)? {
                return Ok(Some(package));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// One framed TCP connection, accepted or actively connected.
///
/// Writes go through the I/O strand, so packages sent from many tasks never
/// interleave on the wire. Reads happen on a dedicated task that hands every
/// package to the pool's message callback. A connection never holds a reference
/// to its pool; the read loop reports its exit through `on_closed`.
pub struct TcpConnection {
    id: SessionId,
    remote: SocketAddr,
    write_block_size: usize,
    state: Arc<AtomicU8>,
    io_strand: Strand<ConnIo>,
    cancel: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    /// Splits `stream`, starts the read loop and returns the running connection.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        id: SessionId,
        stream: TcpStream,
        ctx: ConnContext,
    ) -> AppResult<Arc<TcpConnection>> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let connection = Arc::new(TcpConnection {
            id,
            remote,
            write_block_size: ctx.write_block_size,
            state: Arc::new(AtomicU8::new(SessionState::Running as u8)),
            io_strand: Strand::new(
                format!("tcp-conn-{}-io", id),
                ConnIo {
                    writer: Some(BufWriter::new(writer)),
                },
            ),
            cancel: CancellationToken::new(),
            read_task: Mutex::new(None),
        });

        let reader = PackageReader::new(reader, ctx.max_body_size);
        let handle = tokio::spawn(connection.clone().read_loop(reader, ctx));
        *connection.read_task.lock() = Some(handle);
        debug!("tcp connection {} to {} started", id, remote);
        Ok(connection)
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

    async fn read_loop(self: Arc<Self>, mut reader: PackageReader, ctx: ConnContext) {
        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => {
                    trace!("tcp connection {} read loop cancelled", self.id);
                    break;
                }
                read = reader.read_package() => read,
            };
            match read {
                Ok(Some(package)) => self.dispatch(&ctx, package),
                Ok(None) => {
                    debug!("tcp connection {} closed by peer {}", self.id, self.remote);
                    break;
                }
                Err(err) => {
                    if self.is_running() {
                        error!(
                            "tcp connection {} to {} read failed: {}",
                            self.id, self.remote, err
                        );
                        ctx.handlers.notify_error(self.remote, &err);
                    }
                    break;
                }
            }
        }
        self.stop();
        (ctx.on_closed)(self.id);
    }

    fn dispatch(&self, ctx: &ConnContext, package: Package) {
        let Some(func) = ctx.handlers.msg_func() else {
            trace!(
                "tcp connection {} dropped {:?} package, no handler registered",
                self.id,
                package.tag()
            );
            return;
        };
        let remote = self.remote;
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| func(remote, package)))
        {
            error!(
                "tcp connection {} message handler panicked: {}",
                self.id,
                panic_message(payload.as_ref())
            );
        }
    }

    /// Encodes and sends one package. On an I/O error the connection stops itself.
    ///
    /// A send still in progress when the connection is stopped fails with
    /// `SessionStopped`.
    pub async fn send_package(&self, package: &Package) -> AppResult<()> {
        let mut buffer = BufferVec::new();
        package.encode_into(&mut buffer, self.write_block_size)?;
        self.send_buffer(buffer).await
    }

    /// Writes every block of `buffer` in order, then flushes.
    pub async fn send_buffer(&self, buffer: BufferVec) -> AppResult<()> {
        if !self.is_running() {
            return Err(AppError::SessionStopped(self.remote));
        }
        let remote = self.remote;
        let cancel = self.cancel.clone();
        let result = self
            .io_strand
            .run(move |io: &mut ConnIo| {
                Box::pin(async move {
                    let writer = io.writer.as_mut().ok_or(AppError::SessionStopped(remote))?;
                    // a peer that stops reading must not keep stop() waiting behind this job
                    tokio::select! {
                        _ = cancel.cancelled() => Err(AppError::SessionStopped(remote)),
                        written = write_blocks(writer, &buffer) => written,
                    }
                })
            })
            .await
            .and_then(|written| written);

        if let Err(err) = &result {
            if err.is_session_fatal() {
                if self.is_running() {
                    error!(
                        "tcp connection {} write to {} failed: {}",
                        self.id, remote, err
                    );
                }
                self.stop();
            }
        }
        result
    }

    /// `Running -> Stopping -> Stopped`. Idempotent; every teardown step is
    /// attempted even if an earlier one failed.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(
                SessionState::Running as u8,
                SessionState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let owner = format!("tcp connection {} to {}", self.id, self.remote);
        self.cancel.cancel();
        trace!("{} cancelled", owner);

        let state = self.state.clone();
        let posted = self.io_strand.post(move |io: &mut ConnIo| {
            Box::pin(async move {
                // bytes left in the write buffer belong to a cancelled send, skip the flush
                let shutdown = match io.writer.as_mut() {
                    Some(writer) => writer.get_mut().shutdown().await.map_err(AppError::from),
                    None => Err(AppError::IllegalStateError("writer already released".into())),
                };
                log_step(&owner, "shutdown", shutdown);
                log_step(
                    &owner,
                    "close",
                    io.writer.take().map(drop).ok_or_else(|| {
                        AppError::IllegalStateError("writer already released".into())
                    }),
                );
                state.store(SessionState::Stopped as u8, Ordering::Release);
                debug!("{} stopped", owner);
            })
        });
        if posted.is_err() {
            self.state
                .store(SessionState::Stopped as u8, Ordering::Release);
        }
        self.io_strand.close();
    }

    /// Waits for the read loop to exit. Only the first caller waits.
    pub async fn join(&self) {
        let handle = self.read_task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("tcp connection {} read task failed: {}", self.id, err);
            }
        }
    }
}

async fn write_blocks(
    writer: &mut BufWriter<OwnedWriteHalf>,
    buffer: &BufferVec,
) -> AppResult<()> {
    for block in buffer.blocks() {
        writer.write_all(block).await?;
    }
    writer.flush().await?;
    Ok(())
}

impl PooledSession for TcpConnection {
    fn id(&self) -> SessionId {
        self.id
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn is_running(&self) -> bool {
        TcpConnection::is_running(self)
    }

    fn stop(&self) {
        TcpConnection::stop(self)
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!("tcp connection {} dropped", self.id);
    }
}

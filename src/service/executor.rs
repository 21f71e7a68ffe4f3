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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::{self, Handle, Runtime};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use super::{AppError, AppResult, ExecutorCfg, Shutdown};

type StartFunc = Box<dyn FnOnce() -> BoxFuture<'static, AppResult<()>> + Send>;
type StopFunc = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Service {
    start: StartFunc,
    stop: StopFunc,
}

/// Requests an executor stop from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify_shutdown: broadcast::Sender<()>,
}

impl StopHandle {
    /// Idempotent, only the first call sends the shutdown signal.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("executor stop requested");
        // no receiver left means join already returned
        let _ = self.notify_shutdown.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Owns the tokio runtime and the start/stop hooks of the services running on it.
///
/// ```text
/// register_svr_func* -> start -> join (blocks until stop or ctrl-c)
/// ```
///
/// Start hooks run in registration order. On shutdown the stop hooks of the
/// services that started run in reverse order, then the runtime is shut down.
pub struct Executor {
    cfg: ExecutorCfg,
    runtime: Option<Runtime>,
    services: Vec<Service>,
    started_stops: Vec<StopFunc>,
    stop_handle: StopHandle,
    shutdown: Shutdown,
}

impl Executor {
    pub fn new(cfg: ExecutorCfg) -> AppResult<Self> {
        let cfg = cfg.verify();
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(cfg.threads_num)
            .thread_name(cfg.thread_name.clone())
            .enable_all()
            .build()?;
        let (notify_shutdown, shutdown_rx) = broadcast::channel(1);
        info!("executor started with {} worker threads", cfg.threads_num);
        Ok(Executor {
            cfg,
            runtime: Some(runtime),
            services: Vec::new(),
            started_stops: Vec::new(),
            stop_handle: StopHandle {
                stopped: Arc::new(AtomicBool::new(false)),
                notify_shutdown,
            },
            shutdown: Shutdown::new(shutdown_rx),
        })
    }

    /// Registers one service. Both hooks run on the executor's runtime.
    pub fn register_svr_func<S, T>(&mut self, start: S, stop: T)
    where
        S: FnOnce() -> BoxFuture<'static, AppResult<()>> + Send + 'static,
        T: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.services.push(Service {
            start: Box::new(start),
            stop: Box::new(stop),
        });
    }

    pub fn handle(&self) -> AppResult<Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or_else(|| AppError::IllegalStateError("executor runtime already shut down".into()))
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Same as [`StopHandle::stop`].
    pub fn stop(&self) {
        self.stop_handle.stop();
    }

    /// Runs the start hooks of every registered service, in order.
    ///
    /// When a hook fails, the services started before it are stopped again and
    /// the error is returned. Blocks the calling thread, so it fails with
    /// `IllegalStateError` when called from within a tokio runtime.
    pub fn start(&mut self) -> AppResult<()> {
        ensure_outside_runtime("start")?;
        let handle = self.handle()?;
        let services = std::mem::take(&mut self.services);
        for (index, service) in services.into_iter().enumerate() {
            trace!("executor starting service {}", index);
            match handle.block_on((service.start)()) {
                Ok(()) => self.started_stops.push(service.stop),
                Err(err) => {
                    error!("executor failed to start service {}: {}", index, err);
                    let stops = std::mem::take(&mut self.started_stops);
                    handle.block_on(run_stop_funcs(stops));
                    return Err(err);
                }
            }
        }
        info!("executor started {} services", self.started_stops.len());
        Ok(())
    }

    /// Blocks until [`stop`](Self::stop) is called or ctrl-c arrives, then runs the
    /// stop hooks and shuts the runtime down. Like [`start`](Self::start) it must
    /// not be called from within a tokio runtime.
    pub fn join(mut self) -> AppResult<()> {
        ensure_outside_runtime("join")?;
        let runtime = self
            .runtime
            .take()
            .ok_or_else(|| AppError::IllegalStateError("executor joined twice".into()))?;
        let stops = std::mem::take(&mut self.started_stops);
        let stop_handle = self.stop_handle.clone();
        let shutdown = &mut self.shutdown;

        runtime.block_on(async move {
            if !stop_handle.is_stopped() {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("executor received stop request");
                    }
                    res = signal::ctrl_c() => {
                        match res {
                            Ok(()) => info!("get shutdown signal"),
                            Err(err) => {
                                error!("unable to listen for ctrl-c: {}", err);
                                shutdown.recv().await;
                            }
                        }
                    }
                }
            }
            stop_handle.stop();
            run_stop_funcs(stops).await;
        });

        runtime.shutdown_timeout(self.cfg.shutdown_timeout());
        info!("executor shutdown complete");
        Ok(())
    }
}

fn ensure_outside_runtime(op: &str) -> AppResult<()> {
    if Handle::try_current().is_ok() {
        return Err(AppError::IllegalStateError(format!(
            "executor {} would block a tokio runtime thread",
            op
        )));
    }
    Ok(())
}

async fn run_stop_funcs(mut stops: Vec<StopFunc>) {
    while let Some(stop) = stops.pop() {
        stop().await;
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("cfg", &self.cfg)
            .field("pending_services", &self.services.len())
            .field("started_services", &self.started_stops.len())
            .field("stopped", &self.stop_handle.is_stopped())
            .finish()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("executor dropped");
    }
}

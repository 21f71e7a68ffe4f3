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

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::{AppError, AppResult};

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

/// A serialization domain that owns a piece of state.
///
/// Jobs posted to a strand run one at a time, in the order they were posted,
/// on a single worker task that holds `&mut S`. Every mutation of the state goes
/// through a job, so no lock is needed around it. Handles are cheap to clone;
/// the worker exits (and drops the state) once every handle is gone or
/// [`Strand::close`] is called and the queue is drained.
pub struct Strand<S> {
    name: Arc<str>,
    tx: async_channel::Sender<Job<S>>,
}

impl<S> Clone for Strand<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for Strand<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strand")
            .field("name", &self.name)
            .field("pending", &self.tx.len())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> Strand<S> {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(name: impl Into<String>, state: S) -> Self {
        let (tx, rx) = async_channel::unbounded::<Job<S>>();
        let name: Arc<str> = Arc::from(name.into());
        let worker_name = name.clone();

        tokio::spawn(async move {
            let mut state = state;
            trace!("strand {} started", worker_name);
            while let Ok(job) = rx.recv().await {
                // a panicking job must not take the strand, or the runtime thread, down with it
                if let Err(payload) = AssertUnwindSafe(job(&mut state)).catch_unwind().await {
                    error!(
                        "strand {} job panicked: {}",
                        worker_name,
                        panic_message(payload.as_ref())
                    );
                }
            }
            trace!("strand {} exited", worker_name);
        });

        Strand { name, tx }
    }

    /// Queues an async job without waiting for it.
    pub fn post<F>(&self, f: F) -> AppResult<()>
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.tx
            .try_send(Box::new(f))
            .map_err(|_| AppError::ChannelSendError(format!("strand {} is closed", self.name)))
    }

    /// Queues an async job and waits for its result.
    pub async fn run<R, F>(&self, f: F) -> AppResult<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.post(move |state: &mut S| {
            Box::pin(async move {
                let result = f(state).await;
                let _ = result_tx.send(result);
            })
        })?;
        result_rx.await.map_err(|_| {
            AppError::ChannelRecvError(format!("strand {} dropped the job", self.name))
        })
    }

    /// Runs a synchronous closure on the strand and waits for its result.
    pub async fn call<R, F>(&self, f: F) -> AppResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        self.run(move |state: &mut S| Box::pin(future::ready(f(state))))
            .await
    }

    /// Stops accepting jobs; already queued jobs still run.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

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

//! Framed TCP connections
//!
//! Every package on the wire is an 8 byte [`FrameHeader`](super::frame::FrameHeader)
//! followed by its body. [`TcpConnPool`] owns all connections of one endpoint:
//! the ones it accepted and the ones it opened itself, indexed by peer endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::network::frame::Package;
use crate::AppError;

pub use connection::TcpConnection;
pub use pool::TcpConnPool;

mod connection;
mod pool;

/// Callback invoked with the peer endpoint of every received package.
pub type PackageHandleFunc = Arc<dyn Fn(SocketAddr, Package) + Send + Sync>;
/// Callback invoked when a connection fails, right before it is closed.
pub type ErrorHandleFunc = Arc<dyn Fn(SocketAddr, &AppError) + Send + Sync>;

/// Callbacks shared between a pool and its connections.
#[derive(Default)]
pub(crate) struct ConnHandlers {
    on_msg: RwLock<Option<PackageHandleFunc>>,
    on_err: RwLock<Option<ErrorHandleFunc>>,
}

impl ConnHandlers {
    pub(crate) fn set_msg_func(&self, func: PackageHandleFunc) {
        *self.on_msg.write() = Some(func);
    }

    pub(crate) fn set_err_func(&self, func: ErrorHandleFunc) {
        *self.on_err.write() = Some(func);
    }

    pub(crate) fn msg_func(&self) -> Option<PackageHandleFunc> {
        self.on_msg.read().clone()
    }

    pub(crate) fn notify_error(&self, remote: SocketAddr, err: &AppError) {
        let func = self.on_err.read().clone();
        if let Some(func) = func {
            func(remote, err);
        }
    }
}

impl fmt::Debug for ConnHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandlers")
            .field("msg", &self.on_msg.read().is_some())
            .field("err", &self.on_err.read().is_some())
            .finish()
    }
}

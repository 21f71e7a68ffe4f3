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

//! UDP sessions
//!
//! Every datagram is one message, there is no transport framing. A peer is
//! identified by its endpoint and gets one [`UdpSession`], created lazily on the
//! first send or receive and torn down on `stop` or after an idle timeout.
//!
//! - [`UdpClientPool`]: one socket per remote endpoint, created on demand
//! - [`UdpServer`]: one listening socket shared by every peer session

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

pub use client::UdpClientPool;
pub use server::UdpServer;
pub use session::UdpSession;

mod client;
mod server;
mod session;

/// Callback invoked with the peer endpoint and payload of every received datagram.
pub type MsgHandleFunc = Arc<dyn Fn(SocketAddr, Bytes) + Send + Sync>;

/// Handler shared between a pool and the sessions it creates, so a handler
/// registered later still reaches sessions that already exist.
#[derive(Default)]
pub(crate) struct HandlerSlot {
    func: RwLock<Option<MsgHandleFunc>>,
}

impl HandlerSlot {
    pub(crate) fn set(&self, func: MsgHandleFunc) {
        *self.func.write() = Some(func);
    }

    pub(crate) fn get(&self) -> Option<MsgHandleFunc> {
        self.func.read().clone()
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("registered", &self.func.read().is_some())
            .finish()
    }
}

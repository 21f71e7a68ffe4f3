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

//! Network Module Implementation
//!
//! Session framework for UDP peers and framed TCP connections, built on tokio's
//! async I/O primitives.
//!
//! # Architecture
//!
//! - Every session owns its socket side and serializes all I/O on it through a
//!   [`Strand`](crate::utils::Strand), so concurrent senders never interleave.
//! - Every pool owns its sessions in a [`SessionPool`](crate::utils::SessionPool)
//!   that is only mutated from the pool's manager strand.
//! - Sessions never reference their pool. A dead session is erased lazily, on the
//!   next lookup or by the periodic reaper.
//!
//! # Components
//!
//! - [`udp`]: `UdpClientPool`, `UdpServer` and their `UdpSession`s
//! - [`tcp`]: `TcpConnPool` and its `TcpConnection`s
//! - [`frame`]: the 8 byte header framing used on TCP connections

pub use frame::{FrameHeader, FrameTag, Package, HEADER_LEN, MAGIC};
pub use tcp::{TcpConnPool, TcpConnection};
pub use udp::{UdpClientPool, UdpServer, UdpSession};

pub mod frame;
pub mod tcp;
pub mod udp;

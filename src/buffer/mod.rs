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

//! Zero-copy message buffers
//!
//! A message is built in a [`BufferVec`], an owning list of heap blocks, through a
//! writer that hands raw blocks straight to the serializer, and parsed back with a
//! reader that hands out the committed blocks in order. No payload byte moves
//! between `next` and `back_up` calls.
//!
//! - [`BufferVecOutputStream`]: grows a buffer vec in fixed size blocks, with a
//!   reserved head for length prefixes
//! - [`BufferVecInputStream`]: block by block reader with `back_up` and `skip`
//! - [`StreamBuf`] / [`StreamBufOutputStream`]: prepare/commit byte queue used to
//!   assemble datagrams

pub use buffer_vec::{BlockRange, BufferVec};
pub use input_stream::BufferVecInputStream;
pub use output_stream::BufferVecOutputStream;
pub use stream_buf::{StreamBuf, StreamBufOutputStream};

mod buffer_vec;
mod input_stream;
mod output_stream;
mod stream_buf;

use crate::AppResult;

/// Sequential writer that lends its own memory to the caller.
pub trait ZeroCopyOutputStream {
    /// Grants the next writable region; the whole region counts as written
    /// until [`back_up`](Self::back_up) says otherwise.
    fn next(&mut self) -> &mut [u8];

    /// Returns the last `count` bytes of the most recent grant. Only valid once,
    /// directly after [`next`](Self::next).
    fn back_up(&mut self, count: usize) -> AppResult<()>;

    fn byte_count(&self) -> i64;
}

/// Sequential reader that lends the caller views of its memory.
pub trait ZeroCopyInputStream {
    /// The next unread region, `None` at end of data.
    fn next(&mut self) -> Option<&[u8]>;

    /// Un-reads the last `count` bytes returned by [`next`](Self::next).
    fn back_up(&mut self, count: usize) -> AppResult<()>;

    /// Moves forward `count` bytes. Returns false when fewer bytes remained; the
    /// stream is then at its end.
    fn skip(&mut self, count: usize) -> bool;

    fn byte_count(&self) -> i64;
}

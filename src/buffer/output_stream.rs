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

use std::io;

use super::{BlockRange, BufferVec, ZeroCopyOutputStream};
use crate::{AppError, AppResult};

/// Writer that grows a [`BufferVec`] in `block_size` chunks.
///
/// Blocks already present in the buffer vec are left alone; the stream only
/// hands out memory from blocks it allocated itself. When the serializer is done,
/// call [`finish`](Self::finish) (or commit [`last_buf_size`](Self::last_buf_size)
/// by hand) so the tail block is truncated to what was actually written.
#[derive(Debug)]
pub struct BufferVecOutputStream<'a> {
    buffer: &'a mut BufferVec,
    block_size: usize,
    owns_tail: bool,
    last_used: usize,
    last_grant: Option<usize>,
    byte_count: i64,
}

impl<'a> BufferVecOutputStream<'a> {
    pub fn new(buffer: &'a mut BufferVec, block_size: usize) -> Self {
        Self {
            buffer,
            block_size: block_size.max(1),
            owns_tail: false,
            last_used: 0,
            last_grant: None,
            byte_count: 0,
        }
    }

    /// Reserves `head_size` bytes at the front of the stream for a header that is
    /// written once the body size is known. Must be the first call on the stream.
    pub fn init_head(&mut self, head_size: usize) -> AppResult<BlockRange> {
        if self.owns_tail || self.byte_count != 0 {
            return Err(AppError::InvalidOperation(
                "init_head must be called before any next".into(),
            ));
        }
        if head_size >= self.block_size {
            return Err(AppError::InvalidOperation(format!(
                "head size {} must be smaller than block size {}",
                head_size, self.block_size
            )));
        }
        self.buffer.new_buffer(self.block_size);
        self.owns_tail = true;
        self.last_used = head_size;
        self.byte_count = head_size as i64;
        Ok(BlockRange {
            block: self.buffer.block_count() - 1,
            offset: 0,
            len: head_size,
        })
    }

    /// Bytes of the final block that hold data.
    pub fn last_buf_size(&self) -> usize {
        self.last_used
    }

    /// Truncates the tail block to its used size and returns the byte count.
    pub fn finish(self) -> AppResult<i64> {
        if self.owns_tail {
            self.buffer.commit_last_buf(self.last_used)?;
        }
        Ok(self.byte_count)
    }
}

impl ZeroCopyOutputStream for BufferVecOutputStream<'_> {
    fn next(&mut self) -> &mut [u8] {
        let tail_full = self
            .buffer
            .last_capacity()
            .map_or(true, |capacity| self.last_used >= capacity);
        if !self.owns_tail || tail_full {
            self.buffer.new_buffer(self.block_size);
            self.owns_tail = true;
            self.last_used = 0;
        }
        let start = self.last_used;
        let tail = self.buffer.last_block_full_mut().unwrap_or_default();
        let grant = tail.len() - start;
        self.last_used = tail.len();
        self.last_grant = Some(grant);
        self.byte_count += grant as i64;
        &mut tail[start..]
    }

    fn back_up(&mut self, count: usize) -> AppResult<()> {
        let grant = self.last_grant.take().ok_or_else(|| {
            AppError::InvalidOperation("back_up must directly follow next".into())
        })?;
        if count > grant {
            self.last_grant = Some(grant);
            return Err(AppError::InvalidOperation(format!(
                "back_up {} bytes of a {} byte grant",
                count, grant
            )));
        }
        self.last_used -= count;
        self.byte_count -= count as i64;
        Ok(())
    }

    fn byte_count(&self) -> i64 {
        self.byte_count
    }
}

impl io::Write for BufferVecOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let dst = self.next();
        let granted = dst.len();
        let n = granted.min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
        self.back_up(granted - n).map_err(io::Error::other)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

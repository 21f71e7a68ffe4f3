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

use super::{BufferVec, ZeroCopyInputStream};
use crate::{AppError, AppResult};

/// Reader over the committed bytes of a [`BufferVec`].
///
/// The cursor is a `(block, offset)` pair; it never moves before the first byte
/// or past the last committed byte.
#[derive(Debug)]
pub struct BufferVecInputStream<'a> {
    buffer: &'a BufferVec,
    block: usize,
    offset: usize,
    last_returned: usize,
    byte_count: i64,
}

impl<'a> BufferVecInputStream<'a> {
    pub fn new(buffer: &'a BufferVec) -> Self {
        Self {
            buffer,
            block: 0,
            offset: 0,
            last_returned: 0,
            byte_count: 0,
        }
    }

    /// Same as [`ZeroCopyInputStream::next`] but the slice borrows the buffer, not the stream.
    pub fn next_block(&mut self) -> Option<&'a [u8]> {
        let buffer = self.buffer;
        while let Some(data) = buffer.block(self.block) {
            if self.offset < data.len() {
                let chunk = &data[self.offset..];
                self.offset = data.len();
                self.last_returned = chunk.len();
                self.byte_count += chunk.len() as i64;
                return Some(chunk);
            }
            self.block += 1;
            self.offset = 0;
        }
        self.last_returned = 0;
        None
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.byte_count as usize
    }
}

impl ZeroCopyInputStream for BufferVecInputStream<'_> {
    fn next(&mut self) -> Option<&[u8]> {
        self.next_block()
    }

    fn back_up(&mut self, count: usize) -> AppResult<()> {
        if count > self.last_returned {
            return Err(AppError::InvalidOperation(format!(
                "back_up {} bytes after a next of {} bytes",
                count, self.last_returned
            )));
        }
        // the last chunk always lies inside the current block
        self.offset -= count;
        self.byte_count -= count as i64;
        self.last_returned = 0;
        Ok(())
    }

    fn skip(&mut self, count: usize) -> bool {
        self.last_returned = 0;
        let mut remaining = count;
        while remaining > 0 {
            let Some(data) = self.buffer.block(self.block) else {
                // partial skip stays applied, the cursor now sits at the end
                self.byte_count += (count - remaining) as i64;
                return false;
            };
            let available = data.len() - self.offset;
            if available == 0 {
                self.block += 1;
                self.offset = 0;
                continue;
            }
            let step = available.min(remaining);
            self.offset += step;
            remaining -= step;
        }
        self.byte_count += count as i64;
        true
    }

    fn byte_count(&self) -> i64 {
        self.byte_count
    }
}

impl io::Read for BufferVecInputStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(chunk) = self.next_block() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.back_up(chunk.len() - n).map_err(io::Error::other)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn three_blocks() -> AppResult<BufferVec> {
        let mut buffer = BufferVec::new();
        buffer.new_buffer(4).copy_from_slice(b"abcd");
        buffer.new_buffer(8)[..3].copy_from_slice(b"efg");
        buffer.commit_last_buf(3)?;
        buffer.new_buffer(0);
        buffer.new_buffer(2).copy_from_slice(b"hi");
        Ok(buffer)
    }

    #[test]
    fn test_drain_yields_committed_bytes() -> AppResult<()> {
        let buffer = three_blocks()?;
        let mut stream = BufferVecInputStream::new(&buffer);
        let mut seen = Vec::new();
        while let Some(chunk) = stream.next() {
            seen.extend_from_slice(chunk);
        }
        assert_eq!(seen, b"abcdefghi");
        assert_eq!(stream.byte_count(), buffer.len() as i64);
        Ok(())
    }

    #[test]
    fn test_back_up_rereads_tail_of_chunk() -> AppResult<()> {
        let buffer = three_blocks()?;
        let mut stream = BufferVecInputStream::new(&buffer);
        assert_eq!(stream.next(), Some(&b"abcd"[..]));
        stream.back_up(2)?;
        assert_eq!(stream.byte_count(), 2);
        assert_eq!(stream.next(), Some(&b"cd"[..]));
        assert!(stream.back_up(3).is_err());
        Ok(())
    }

    #[test]
    fn test_skip_across_blocks() -> AppResult<()> {
        let buffer = three_blocks()?;
        let mut stream = BufferVecInputStream::new(&buffer);
        assert!(stream.skip(6));
        assert_eq!(stream.byte_count(), 6);
        assert_eq!(stream.next(), Some(&b"g"[..]));
        assert_eq!(stream.next(), Some(&b"hi"[..]));
        assert_eq!(stream.next(), None);
        Ok(())
    }

    #[test]
    fn test_skip_past_end_is_end_of_stream() -> AppResult<()> {
        let buffer = three_blocks()?;
        let mut stream = BufferVecInputStream::new(&buffer);
        stream.next();
        assert!(!stream.skip(100));
        assert_eq!(stream.byte_count(), 9);
        assert_eq!(stream.next(), None);
        assert!(!stream.skip(1));
        assert!(stream.skip(0));
        assert_eq!(stream.remaining(), 0);
        Ok(())
    }

    #[test]
    fn test_read_trait() -> AppResult<()> {
        let buffer = three_blocks()?;
        let mut stream = BufferVecInputStream::new(&buffer);
        let mut first = [0u8; 5];
        stream.read_exact(&mut first)?;
        assert_eq!(&first, b"abcde");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest)?;
        assert_eq!(rest, b"fghi");
        Ok(())
    }
}

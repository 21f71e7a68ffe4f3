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

use bytes::{Buf, Bytes, BytesMut};

use super::ZeroCopyOutputStream;
use crate::{AppError, AppResult};

/// A growable byte queue with a committed input area and a prepared output area.
///
/// `prepare(n)` exposes `n` writable bytes after the committed data, `commit(m)`
/// moves the first `m` of them into the committed area and discards the rest.
/// Preparing again drops any bytes that were prepared but never committed.
#[derive(Debug, Default)]
pub struct StreamBuf {
    data: BytesMut,
    prepared: usize,
}

impl StreamBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            prepared: 0,
        }
    }

    fn committed(&self) -> usize {
        self.data.len() - self.prepared
    }

    pub fn prepare(&mut self, n: usize) -> &mut [u8] {
        let committed = self.committed();
        self.data.resize(committed + n, 0);
        self.prepared = n;
        &mut self.data[committed..]
    }

    pub fn commit(&mut self, n: usize) {
        let n = n.min(self.prepared);
        let committed = self.committed();
        self.data.truncate(committed + n);
        self.prepared = 0;
    }

    /// Committed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.committed()]
    }

    pub fn len(&self) -> usize {
        self.committed()
    }

    pub fn is_empty(&self) -> bool {
        self.committed() == 0
    }

    /// Drops `n` committed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.committed());
        self.data.advance(n);
    }

    /// Takes every committed byte out, leaving the buffer empty.
    pub fn split(&mut self) -> Bytes {
        let committed = self.committed();
        self.prepared = 0;
        let out = self.data.split_to(committed);
        self.data.clear();
        out.freeze()
    }

    /// Drops the last `n` committed bytes.
    fn uncommit(&mut self, n: usize) {
        let committed = self.committed();
        self.data.truncate(committed - n.min(committed));
        self.prepared = 0;
    }
}

/// Zero-copy writer over a [`StreamBuf`]: every `next` prepares and commits a
/// full block, `back_up` uncommits the unused tail.
#[derive(Debug)]
pub struct StreamBufOutputStream<'a> {
    buf: &'a mut StreamBuf,
    block_size: usize,
    last_grant: Option<usize>,
    byte_count: i64,
}

impl<'a> StreamBufOutputStream<'a> {
    pub fn new(buf: &'a mut StreamBuf, block_size: usize) -> Self {
        Self {
            buf,
            block_size: block_size.max(1),
            last_grant: None,
            byte_count: 0,
        }
    }
}

impl ZeroCopyOutputStream for StreamBufOutputStream<'_> {
    fn next(&mut self) -> &mut [u8] {
        let block_size = self.block_size;
        self.buf.prepare(block_size);
        self.buf.commit(block_size);
        self.last_grant = Some(block_size);
        self.byte_count += block_size as i64;
        let len = self.buf.len();
        &mut self.buf.data[len - block_size..len]
    }

    fn back_up(&mut self, count: usize) -> AppResult<()> {
        match self.last_grant.take() {
            Some(grant) if count <= grant => {
                self.buf.uncommit(count);
                self.byte_count -= count as i64;
                Ok(())
            }
            Some(grant) => {
                self.last_grant = Some(grant);
                Err(AppError::InvalidOperation(format!(
                    "back_up {} bytes of a {} byte grant",
                    count, grant
                )))
            }
            None => Err(AppError::InvalidOperation(
                "back_up must directly follow next".into(),
            )),
        }
    }

    fn byte_count(&self) -> i64 {
        self.byte_count
    }
}

impl io::Write for StreamBufOutputStream<'_> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_prepare_commit_appends() {
        let mut sb = StreamBuf::new();
        sb.prepare(8).copy_from_slice(b"12345678");
        sb.commit(8);
        let out = sb.prepare(16);
        out[..8].copy_from_slice(b"abcdefgh");
        sb.commit(8);
        assert_eq!(sb.data(), b"12345678abcdefgh");
        assert_eq!(&sb.split()[..], b"12345678abcdefgh");
        assert!(sb.is_empty());
    }

    #[test]
    fn test_uncommitted_prepare_is_discarded() {
        let mut sb = StreamBuf::new();
        sb.prepare(4).copy_from_slice(b"lost");
        sb.prepare(4).copy_from_slice(b"kept");
        sb.commit(10);
        assert_eq!(sb.data(), b"kept");
        sb.consume(2);
        assert_eq!(sb.data(), b"pt");
    }

    #[test]
    fn test_output_stream_over_stream_buf() -> AppResult<()> {
        let mut sb = StreamBuf::new();
        let mut stream = StreamBufOutputStream::new(&mut sb, 4);
        stream.write_all(b"hello world")?;
        assert_eq!(stream.byte_count(), 11);
        let grant = stream.next().len();
        stream.back_up(grant)?;
        assert_eq!(stream.byte_count(), 11);
        assert_eq!(sb.data(), b"hello world");
        Ok(())
    }
}

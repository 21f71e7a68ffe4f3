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

use bytes::{Bytes, BytesMut};

use crate::{AppError, AppResult};

#[derive(Debug)]
struct Block {
    data: Box<[u8]>,
    /// declared length, `<= data.len()`
    len: usize,
}

/// A byte range inside a [`BufferVec`], addressed by block index and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub block: usize,
    pub offset: usize,
    pub len: usize,
}

/// An owning sequence of heap blocks holding one message.
///
/// Blocks are appended with [`new_buffer`](Self::new_buffer) and only the last
/// block's declared length may be changed afterwards, through
/// [`commit_last_buf`](Self::commit_last_buf). The type is move-only; ownership of
/// blocks moves between instances with [`merge`](Self::merge) and
/// [`swap`](Self::swap), never by copying payload bytes.
#[derive(Debug, Default)]
pub struct BufferVec {
    blocks: Vec<Block>,
}

impl BufferVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zeroed block of `size` bytes, appends it and returns it.
    pub fn new_buffer(&mut self, size: usize) -> &mut [u8] {
        self.blocks.push(Block {
            data: vec![0u8; size].into_boxed_slice(),
            len: size,
        });
        let last = self.blocks.len() - 1;
        &mut self.blocks[last].data[..]
    }

    /// The declared part of the most recently appended block.
    pub fn cur_buffer(&self) -> Option<&[u8]> {
        self.blocks.last().map(|b| &b.data[..b.len])
    }

    pub fn cur_buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.blocks.last_mut().map(|b| &mut b.data[..b.len])
    }

    /// Sets the declared length of the last block, up to its allocated size.
    pub fn commit_last_buf(&mut self, actual_size: usize) -> AppResult<()> {
        let last = self.blocks.last_mut().ok_or_else(|| {
            AppError::InvalidOperation("commit_last_buf on an empty buffer vec".into())
        })?;
        if actual_size > last.data.len() {
            return Err(AppError::InvalidOperation(format!(
                "commit {} bytes into a block of {} bytes",
                actual_size,
                last.data.len()
            )));
        }
        last.len = actual_size;
        Ok(())
    }

    /// Moves every block of `other` to the end of `self`, leaving `other` empty.
    pub fn merge(&mut self, other: &mut BufferVec) {
        self.blocks.append(&mut other.blocks);
    }

    pub fn swap(&mut self, other: &mut BufferVec) {
        std::mem::swap(&mut self.blocks, &mut other.blocks);
    }

    /// Sum of the declared block lengths.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Declared contents of every block, in order.
    pub fn blocks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.blocks.iter().map(|b| &b.data[..b.len])
    }

    pub fn block(&self, index: usize) -> Option<&[u8]> {
        self.blocks.get(index).map(|b| &b.data[..b.len])
    }

    pub fn range_mut(&mut self, range: BlockRange) -> AppResult<&mut [u8]> {
        let block = self.blocks.get_mut(range.block).ok_or_else(|| {
            AppError::InvalidOperation(format!("no block at index {}", range.block))
        })?;
        let end = range.offset + range.len;
        if end > block.len {
            return Err(AppError::InvalidOperation(format!(
                "range {}..{} outside block of {} bytes",
                range.offset, end, block.len
            )));
        }
        Ok(&mut block.data[range.offset..end])
    }

    pub(crate) fn last_capacity(&self) -> Option<usize> {
        self.blocks.last().map(|b| b.data.len())
    }

    /// The whole allocation of the last block, ignoring its declared length.
    pub(crate) fn last_block_full_mut(&mut self) -> Option<&mut [u8]> {
        self.blocks.last_mut().map(|b| &mut b.data[..])
    }

    /// Contiguous copy of the declared contents. A single block is handed over
    /// without copying.
    pub fn into_bytes(mut self) -> Bytes {
        if self.blocks.len() == 1 {
            if let Some(block) = self.blocks.pop() {
                let mut data = Vec::from(block.data);
                data.truncate(block.len);
                return Bytes::from(data);
            }
        }
        let mut out = BytesMut::with_capacity(self.len());
        for block in self.blocks() {
            out.extend_from_slice(block);
        }
        out.freeze()
    }
}

impl From<&[u8]> for BufferVec {
    fn from(value: &[u8]) -> Self {
        let mut buffer = BufferVec::new();
        buffer.new_buffer(value.len()).copy_from_slice(value);
        buffer
    }
}

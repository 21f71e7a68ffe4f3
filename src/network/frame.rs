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

use std::io::Write;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::{BufferVec, BufferVecOutputStream};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const MAGIC: [u8; 2] = [b'Y', b'T'];
pub const HEADER_LEN: usize = 8;

/// Payload kind carried in the tag / sub-tag bytes of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    ClassObject,
    Quick,
    DataItem,
    File,
    End,
}

impl FrameTag {
    pub fn to_bytes(self) -> (u8, u8) {
        match self {
            FrameTag::ClassObject => (b'C', b'O'),
            FrameTag::Quick => (b'Q', b'D'),
            FrameTag::DataItem => (b'D', b'A'),
            FrameTag::File => (b'F', b'L'),
            FrameTag::End => (b'O', b'V'),
        }
    }

    pub fn from_bytes(tag: u8, sub_tag: u8) -> AppResult<Self> {
        let parsed = match tag {
            b'C' => FrameTag::ClassObject,
            b'Q' => FrameTag::Quick,
            b'D' => FrameTag::DataItem,
            b'F' => FrameTag::File,
            b'O' => FrameTag::End,
            _ => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown tag {:#04x}",
                    tag
                )))
            }
        };
        if parsed.to_bytes().1 != sub_tag {
            return Err(AppError::MalformedProtocol(format!(
                "unknown sub tag {:#04x} for tag {:?}",
                sub_tag, parsed
            )));
        }
        Ok(parsed)
    }
}

/// `['Y' 'T'][tag][sub tag][body length, u32 LE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: FrameTag,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let (tag, sub_tag) = self.tag.to_bytes();
        let len = self.body_len.to_le_bytes();
        [
            MAGIC[0], MAGIC[1], tag, sub_tag, len[0], len[1], len[2], len[3],
        ]
    }

    /// Validates an 8 byte header against the magic, tag table and body limit.
    pub fn decode(raw: &[u8; HEADER_LEN], max_body_size: usize) -> AppResult<Self> {
        if raw[..2] != MAGIC {
            return Err(AppError::MalformedProtocol(format!(
                "bad magic {:#04x} {:#04x}",
                raw[0], raw[1]
            )));
        }
        let tag = FrameTag::from_bytes(raw[2], raw[3])?;
        let body_len = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if body_len as usize > max_body_size {
            return Err(AppError::MalformedProtocol(format!(
                "Frame of length {} is too large.",
                body_len
            )));
        }
        if tag == FrameTag::End && body_len != 0 {
            return Err(AppError::MalformedProtocol(format!(
                "end of package marker with {} body bytes",
                body_len
            )));
        }
        Ok(FrameHeader { tag, body_len })
    }

    /// Checks whether `buffer` holds a complete frame.
    pub fn check(buffer: &mut BytesMut, max_body_size: usize) -> AppResult<FrameHeader> {
        if buffer.remaining() < HEADER_LEN {
            return Err(Incomplete);
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buffer[..HEADER_LEN]);
        let header = FrameHeader::decode(&raw, max_body_size)?;
        let frame_len = HEADER_LEN + header.body_len as usize;
        if buffer.remaining() < frame_len {
            buffer.reserve(frame_len - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(header)
    }

    /// Splits one package off the front of `buffer`, `None` when more bytes are needed.
    pub fn parse(buffer: &mut BytesMut, max_body_size: usize) -> AppResult<Option<Package>> {
        match FrameHeader::check(buffer, max_body_size) {
            Ok(header) => {
                buffer.advance(HEADER_LEN);
                let body = buffer.split_to(header.body_len as usize).freeze();
                Ok(Some(Package::decode(header.tag, body)?))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One framed unit on the legacy TCP protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    ClassObject(Bytes),
    Quick(Bytes),
    /// data with a short tip string in front
    DataItem { tip: String, data: Bytes },
    File { name: String, data: Bytes },
    End,
}

impl Package {
    pub fn tag(&self) -> FrameTag {
        match self {
            Package::ClassObject(_) => FrameTag::ClassObject,
            Package::Quick(_) => FrameTag::Quick,
            Package::DataItem { .. } => FrameTag::DataItem,
            Package::File { .. } => FrameTag::File,
            Package::End => FrameTag::End,
        }
    }

    pub fn body_len(&self) -> usize {
        match self {
            Package::ClassObject(data) | Package::Quick(data) => data.len(),
            Package::DataItem { tip: name, data } | Package::File { name, data } => {
                2 + name.len() + data.len()
            }
            Package::End => 0,
        }
    }

    fn write_body<W: Write>(&self, out: &mut W) -> AppResult<()> {
        match self {
            Package::ClassObject(data) | Package::Quick(data) => out.write_all(data)?,
            Package::DataItem { tip: name, data } | Package::File { name, data } => {
                let name_len = u16::try_from(name.len()).map_err(|_| {
                    AppError::InvalidValue(format!("name of {} bytes is too long", name.len()))
                })?;
                out.write_all(&name_len.to_le_bytes())?;
                out.write_all(name.as_bytes())?;
                out.write_all(data)?;
            }
            Package::End => {}
        }
        Ok(())
    }

    /// Serializes header and body into `buffer`, growing it `block_size` bytes at
    /// a time. The header is reserved up front and filled in after the body.
    pub fn encode_into(&self, buffer: &mut BufferVec, block_size: usize) -> AppResult<i64> {
        let mut stream = BufferVecOutputStream::new(buffer, block_size.max(HEADER_LEN + 1));
        let head = stream.init_head(HEADER_LEN)?;
        self.write_body(&mut stream)?;
        let total = stream.finish()?;

        let body_len = u32::try_from(total as usize - HEADER_LEN).map_err(|_| {
            AppError::MessageTooLarge(format!("package body of {} bytes", total))
        })?;
        let header = FrameHeader {
            tag: self.tag(),
            body_len,
        };
        buffer.range_mut(head)?.copy_from_slice(&header.encode());
        Ok(total)
    }

    pub fn decode(tag: FrameTag, mut body: Bytes) -> AppResult<Package> {
        match tag {
            FrameTag::ClassObject => Ok(Package::ClassObject(body)),
            FrameTag::Quick => Ok(Package::Quick(body)),
            FrameTag::DataItem | FrameTag::File => {
                if body.remaining() < 2 {
                    return Err(AppError::MalformedProtocol(
                        "missing name prefix block".into(),
                    ));
                }
                let name_len = body.get_u16_le() as usize;
                if body.remaining() < name_len {
                    return Err(AppError::MalformedProtocol(format!(
                        "name prefix of {} bytes exceeds body",
                        name_len
                    )));
                }
                let name = String::from_utf8(body.split_to(name_len).to_vec()).map_err(|e| {
                    AppError::MalformedProtocol(format!("name prefix is not utf-8: {}", e))
                })?;
                if tag == FrameTag::DataItem {
                    Ok(Package::DataItem { tip: name, data: body })
                } else {
                    Ok(Package::File { name, data: body })
                }
            }
            FrameTag::End => Ok(Package::End),
        }
    }

    /// Plain contiguous encoding, for callers that do not need block buffers.
    pub fn to_bytes(&self) -> AppResult<Bytes> {
        let body_len = u32::try_from(self.body_len())
            .map_err(|_| AppError::MessageTooLarge(format!("package body of {} bytes", self.body_len())))?;
        let mut out = BytesMut::with_capacity(HEADER_LEN + body_len as usize).writer();
        out.write_all(
            &FrameHeader {
                tag: self.tag(),
                body_len,
            }
            .encode(),
        )?;
        self.write_body(&mut out)?;
        Ok(out.into_inner().freeze())
    }
}

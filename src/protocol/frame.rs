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

//! Wire format of one frame.
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//! offset 0:  version        (1 byte)
//! offset 1:  type           (1 byte)  1=DATA 2=ACK 3=HEARTBEAT 4=CONTROL
//! offset 2:  flags          (2 bytes)
//! offset 4:  sequence       (4 bytes)
//! offset 8:  timestamp      (4 bytes)
//! offset 12: payload_length (2 bytes)
//! offset 14: checksum       (2 bytes)
//! offset 16: payload        (payload_length bytes)
//! ```
//!
//! The checksum is the internet one's-complement sum over the whole frame,
//! computed with the checksum field taken as zero.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::{self, Incomplete};
use crate::AppResult;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

const OFF_VERSION: usize = 0;
const OFF_TYPE: usize = 1;
const OFF_FLAGS: usize = 2;
const OFF_SEQUENCE: usize = 4;
const OFF_TIMESTAMP: usize = 8;
const OFF_PAYLOAD_LEN: usize = 12;
const OFF_CHECKSUM: usize = 14;

/// Bits of the `flags` field, meaningful on CONTROL frames.
pub mod flags {
    pub const SYN: u16 = 0x0001;
    pub const ACK: u16 = 0x0002;
    pub const FIN: u16 = 0x0004;
    pub const RST: u16 = 0x0008;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data = 1,
    Ack = 2,
    Heartbeat = 3,
    Control = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::Ack),
            3 => Ok(MessageType::Heartbeat),
            4 => Ok(MessageType::Control),
            other => Err(AppError::MalformedProtocol(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub flags: u16,
    pub sequence: u32,
    pub timestamp: u32,
    pub payload_length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a complete frame. The checksum is computed last over the
    /// finished buffer.
    pub fn encode(
        message_type: MessageType,
        flags: u16,
        sequence: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> AppResult<Bytes> {
        let payload_length = u16::try_from(payload.len()).map_err(|_| {
            AppError::InvalidValue(format!(
                "payload of {} bytes does not fit a frame",
                payload.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(message_type as u8);
        buf.put_u16(flags);
        buf.put_u32(sequence);
        buf.put_u32(timestamp);
        buf.put_u16(payload_length);
        buf.put_u16(0);
        buf.put_slice(payload);

        let checksum = frame_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Validates and splits one frame.
    ///
    /// The length checks run before anything past the header is touched, so a
    /// lying length field is reported as `Truncated` rather than read past the
    /// buffer.
    pub fn decode(frame: Bytes) -> AppResult<Frame> {
        if frame.len() < HEADER_LEN {
            return Err(AppError::Truncated {
                needed: HEADER_LEN,
                available: frame.len(),
            });
        }
        let payload_length = read_u16(&frame, OFF_PAYLOAD_LEN);
        let needed = HEADER_LEN + payload_length as usize;
        if frame.len() < needed {
            return Err(AppError::Truncated {
                needed,
                available: frame.len(),
            });
        }

        let received = read_u16(&frame, OFF_CHECKSUM);
        let computed = frame_checksum(&frame);
        if received != computed {
            return Err(AppError::ChecksumMismatch { received, computed });
        }

        if frame.len() > needed {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after a payload of {}",
                frame.len() - needed,
                payload_length
            )));
        }
        let version = frame[OFF_VERSION];
        if version != PROTOCOL_VERSION {
            return Err(AppError::MalformedProtocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let message_type = MessageType::try_from(frame[OFF_TYPE])?;

        let header = FrameHeader {
            version,
            message_type,
            flags: read_u16(&frame, OFF_FLAGS),
            sequence: read_u32(&frame, OFF_SEQUENCE),
            timestamp: read_u32(&frame, OFF_TIMESTAMP),
            payload_length,
            checksum: received,
        };
        let payload = frame.slice(HEADER_LEN..needed);
        Ok(Frame { header, payload })
    }

    /// Returns the length of the first complete frame in `buffer`, or
    /// `Incomplete` when more bytes are needed.
    pub fn check(buffer: &mut BytesMut, max_payload: usize) -> AppResult<usize> {
        if buffer.remaining() < HEADER_LEN {
            return Err(Incomplete);
        }
        let payload_length = read_u16(buffer, OFF_PAYLOAD_LEN) as usize;
        if payload_length > max_payload {
            return Err(AppError::MalformedProtocol(format!(
                "Frame payload of length {} is too large.",
                payload_length
            )));
        }
        let frame_len = HEADER_LEN + payload_length;
        if buffer.remaining() < frame_len {
            buffer.reserve(frame_len - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(frame_len)
    }

    /// Splits the first complete raw frame off a stream buffer.
    ///
    /// The frame is not validated here, [`Frame::decode`] does that later in
    /// the pipeline.
    pub fn parse(buffer: &mut BytesMut, max_payload: usize) -> AppResult<Option<Bytes>> {
        match Frame::check(buffer, max_payload) {
            Ok(frame_len) => Ok(Some(buffer.split_to(frame_len).freeze())),
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.header.flags & flag == flag
    }

    /// Receive window advertised by ACK and SYN frames, in packets.
    pub fn advertised_window(&self) -> Option<u16> {
        if self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[flags={:#06x} seq={} ts={} len={}]",
            self.header.message_type,
            self.header.flags,
            self.header.sequence,
            self.header.timestamp,
            self.header.payload_length
        )
    }
}

pub fn window_payload(window: u16) -> [u8; 2] {
    window.to_be_bytes()
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Internet checksum of a frame with its checksum field read as zero.
fn frame_checksum(frame: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = frame.chunks_exact(2);
    for (index, word) in chunks.by_ref().enumerate() {
        if index * 2 == OFF_CHECKSUM {
            continue;
        }
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // odd trailing byte is padded with zero on the right
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

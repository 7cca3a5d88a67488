// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wire frame codec: common header (format A) plus an extended header for
// attached shared-memory handle transfer (format B). Every integrity-
// critical field carries its bitwise complement alongside it, so a single
// bit flip is detectable rather than silently accepted — the same care
// the teacher's `condition.rs`/`mutex.rs` take around torn shared-memory
// state, applied here to the framing layer.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{IpcError, Result};

pub const FORMAT_A: u8 = 1;
pub const FORMAT_B: u8 = 2;

/// Bytes consumed by the common header that precede every frame's
/// payload (format A has no extended header; format B adds one after
/// this).
pub const COMMON_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    A,
    B,
}

impl MessageFormat {
    fn as_byte(self) -> u8 {
        match self {
            MessageFormat::A => FORMAT_A,
            MessageFormat::B => FORMAT_B,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            FORMAT_A => Some(MessageFormat::A),
            FORMAT_B => Some(MessageFormat::B),
            _ => None,
        }
    }
}

/// The attached shared-memory handle descriptor carried by format B's
/// extended header. Per the resolved "exchangeable handle" question
/// (see DESIGN.md), a handle is a deterministic region name plus its
/// negotiated size — both sides independently derive the same name and
/// `shm_open` the same kernel object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedHandle {
    pub region_name: String,
    pub region_size: u64,
}

impl AttachedHandle {
    fn encoded_len(&self) -> usize {
        2 + self.region_name.len() + 8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let name_bytes = self.region_name.as_bytes();
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(&self.region_size.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(IpcError::ProtocolError("truncated extended header"));
        }
        let name_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let needed = 2 + name_len + 8;
        if buf.len() < needed {
            return Err(IpcError::ProtocolError("truncated extended header"));
        }
        let region_name = std::str::from_utf8(&buf[2..2 + name_len])
            .map_err(|_| IpcError::ProtocolError("non-utf8 region name"))?
            .to_owned();
        let size_bytes: [u8; 8] = buf[2 + name_len..needed].try_into().unwrap();
        let region_size = u64::from_le_bytes(size_bytes);
        Ok((
            AttachedHandle {
                region_name,
                region_size,
            },
            needed,
        ))
    }
}

/// A single framed message as it appears on the ring: header, optional
/// attached handle, and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u16,
    pub handle: Option<AttachedHandle>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total on-wire length of this frame once encoded.
    pub fn encoded_len(&self) -> usize {
        let ext = self.handle.as_ref().map(|h| h.encoded_len()).unwrap_or(0);
        COMMON_HEADER_LEN + ext + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let format = if self.handle.is_some() {
            MessageFormat::B
        } else {
            MessageFormat::A
        };
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(format.as_byte());
        out.push(!format.as_byte());
        let size = self.payload.len() as u32;
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&(!size).to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        if let Some(handle) = &self.handle {
            handle.encode(&mut out);
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete frame out of `buf`. The caller is responsible for
    /// first peeking [`COMMON_HEADER_LEN`] bytes to learn `message_size`
    /// (and, for format B, the extended header) so it knows how many
    /// total bytes to peek before calling this.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < COMMON_HEADER_LEN {
            return Err(IpcError::ProtocolError("truncated common header"));
        }
        let format_byte = buf[0];
        let format_check = buf[1];
        if format_byte != !format_check {
            return Err(IpcError::ProtocolError("message_format corruption check failed"));
        }
        let format = MessageFormat::from_byte(format_byte)
            .ok_or(IpcError::ProtocolError("unknown message_format"))?;

        let size = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        let size_check = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        if size != !size_check {
            return Err(IpcError::ProtocolError("message_size corruption check failed"));
        }

        let seq = u16::from_le_bytes(buf[10..12].try_into().unwrap());

        let mut cursor = COMMON_HEADER_LEN;
        let handle = match format {
            MessageFormat::A => None,
            MessageFormat::B => {
                let (h, used) = AttachedHandle::decode(&buf[cursor..])?;
                cursor += used;
                Some(h)
            }
        };

        let size = size as usize;
        if buf.len() < cursor + size {
            return Err(IpcError::ProtocolError("truncated payload"));
        }
        let payload = buf[cursor..cursor + size].to_vec();

        Ok(Frame {
            seq,
            handle,
            payload,
        })
    }

    /// Peek just enough of the common (+ extended, for format B) header
    /// to learn the total on-wire length of the next frame, given the
    /// first [`COMMON_HEADER_LEN`] bytes already peeked from the ring.
    pub fn peeked_total_len(common: &[u8; COMMON_HEADER_LEN], extended_tail: &[u8]) -> Result<usize> {
        let format_byte = common[0];
        let format_check = common[1];
        if format_byte != !format_check {
            return Err(IpcError::ProtocolError("message_format corruption check failed"));
        }
        let format = MessageFormat::from_byte(format_byte)
            .ok_or(IpcError::ProtocolError("unknown message_format"))?;
        let size = u32::from_le_bytes(common[2..6].try_into().unwrap()) as usize;

        match format {
            MessageFormat::A => Ok(COMMON_HEADER_LEN + size),
            MessageFormat::B => {
                if extended_tail.len() < 2 {
                    return Err(IpcError::ProtocolError("truncated extended header"));
                }
                let name_len = u16::from_le_bytes([extended_tail[0], extended_tail[1]]) as usize;
                Ok(COMMON_HEADER_LEN + 2 + name_len + 8 + size)
            }
        }
    }
}

/// Per-direction sequence number generator. Starts at 1 and skips 0 on
/// wraparound (`u16::MAX -> 1`, never `0`).
pub struct SeqCounter(AtomicU16);

impl SeqCounter {
    pub const fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    /// Produce the next sequence number in the series.
    pub fn next(&self) -> u16 {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let mut nxt = cur.wrapping_add(1);
            if nxt == 0 {
                nxt = 1;
            }
            match self
                .0
                .compare_exchange_weak(cur, nxt, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return nxt,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Tracks the expected next sequence number on the receive side and
/// validates an observed value against it.
pub struct SeqValidator(AtomicU16);

impl SeqValidator {
    pub const fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    /// Validate `observed` as the next frame's sequence number, advancing
    /// the expectation on success.
    pub fn validate(&self, observed: u16) -> Result<()> {
        let cur = self.0.load(Ordering::Relaxed);
        let mut expected = cur.wrapping_add(1);
        if expected == 0 {
            expected = 1;
        }
        if observed != expected {
            return Err(IpcError::ProtocolError("sequence number out of order"));
        }
        self.0.store(expected, Ordering::Relaxed);
        Ok(())
    }
}

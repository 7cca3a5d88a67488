// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SOME/IP header layout and validation (integration boundary, spec.md
// §4.10). The transport treats a Connection's payload bytes as opaque —
// this module exists only so a host application sitting on top of the
// wire can parse/validate the envelope header without writing its own
// byte-offset table. No teacher or pack file implements SOME/IP, so the
// layout follows the field list directly; the explicit `#[repr(C)]` +
// manual encode/decode idiom mirrors `channel.rs`'s `RingHeader`.

use crate::error::{IpcError, Result};

/// Fixed length of a SOME/IP header, preceding the method payload.
pub const HEADER_LEN: usize = 16;

/// `message_type` field values (AUTOSAR SOME/IP protocol specification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
    TpRequest = 0x20,
    TpRequestNoReturn = 0x21,
    TpNotification = 0x22,
    TpResponse = 0xa0,
    TpError = 0xa1,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Self::Request,
            0x01 => Self::RequestNoReturn,
            0x02 => Self::Notification,
            0x80 => Self::Response,
            0x81 => Self::Error,
            0x20 => Self::TpRequest,
            0x21 => Self::TpRequestNoReturn,
            0x22 => Self::TpNotification,
            0xa0 => Self::TpResponse,
            0xa1 => Self::TpError,
            _ => return None,
        })
    }
}

/// `return_code` field values worth naming; anything else is carried as
/// `Unknown` rather than rejected, since the transport's job is layout
/// validation, not enforcing which codes a given service may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    NotOk,
    UnknownService,
    UnknownMethod,
    NotReady,
    NotReachable,
    Timeout,
    WrongProtocolVersion,
    WrongInterfaceVersion,
    MalformedMessage,
    WrongMessageType,
    Unknown(u8),
}

impl ReturnCode {
    fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Ok,
            0x01 => Self::NotOk,
            0x02 => Self::UnknownService,
            0x03 => Self::UnknownMethod,
            0x04 => Self::NotReady,
            0x05 => Self::NotReachable,
            0x06 => Self::Timeout,
            0x07 => Self::WrongProtocolVersion,
            0x08 => Self::WrongInterfaceVersion,
            0x09 => Self::MalformedMessage,
            0x0a => Self::WrongMessageType,
            other => Self::Unknown(other),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::NotOk => 0x01,
            Self::UnknownService => 0x02,
            Self::UnknownMethod => 0x03,
            Self::NotReady => 0x04,
            Self::NotReachable => 0x05,
            Self::Timeout => 0x06,
            Self::WrongProtocolVersion => 0x07,
            Self::WrongInterfaceVersion => 0x08,
            Self::MalformedMessage => 0x09,
            Self::WrongMessageType => 0x0a,
            Self::Unknown(other) => other,
        }
    }
}

/// A parsed (and validated) SOME/IP header.
///
/// Field order and sizes per the SOME/IP wire format: all multi-byte
/// integers are big-endian ("network byte order"), unlike the
/// little-endian framing `frame.rs` uses for the transport's own header —
/// this module does not inherit that choice, since SOME/IP defines its
/// own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service_id: u16,
    pub method_id: u16,
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl SomeIpHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.method_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out[8..10].copy_from_slice(&self.client_id.to_be_bytes());
        out[10..12].copy_from_slice(&self.session_id.to_be_bytes());
        out[12] = self.protocol_version;
        out[13] = self.interface_version;
        out[14] = self.message_type as u8;
        out[15] = self.return_code.as_byte();
        out
    }

    /// Parse and validate a header from the start of a payload buffer.
    ///
    /// Validation here is deliberately narrow: it checks the fields the
    /// transport can actually reason about (length consistency, a
    /// recognized message type) and nothing service-specific — the
    /// transport never interprets service/method semantics.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(IpcError::ProtocolError("truncated SOME/IP header"));
        }
        let service_id = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let method_id = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let client_id = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let session_id = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let protocol_version = buf[12];
        let interface_version = buf[13];
        let message_type = MessageType::from_byte(buf[14])
            .ok_or(IpcError::ProtocolError("unknown SOME/IP message_type"))?;
        let return_code = ReturnCode::from_byte(buf[15]);

        // `length` covers everything after itself: client_id, session_id,
        // protocol_version, interface_version, message_type, return_code,
        // and the method payload (8 fixed bytes plus the payload).
        let payload_len = buf.len() - HEADER_LEN;
        if (length as usize) != 8 + payload_len {
            return Err(IpcError::ProtocolError(
                "SOME/IP length field does not match envelope size",
            ));
        }

        Ok(Self {
            service_id,
            method_id,
            length,
            client_id,
            session_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    /// The envelope's total on-wire size this header describes (header
    /// plus the method payload that follows it) — the one fact the
    /// transport actually needs to report, per spec.md §4.10.
    pub fn envelope_len(&self) -> usize {
        HEADER_LEN + (self.length as usize).saturating_sub(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload_len: usize) -> SomeIpHeader {
        SomeIpHeader {
            service_id: 0x1234,
            method_id: 0x5678,
            length: 8 + payload_len as u32,
            client_id: 0x0001,
            session_id: 0x0002,
            protocol_version: 1,
            interface_version: 1,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let header = sample(10);
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(&[0u8; 10]);
        let decoded = SomeIpHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.envelope_len(), HEADER_LEN + 10);
    }

    #[test]
    fn mismatched_length_field_rejected() {
        let header = sample(10);
        let mut buf = header.encode().to_vec();
        buf.extend_from_slice(&[0u8; 4]); // payload shorter than length claims
        assert!(matches!(
            SomeIpHeader::decode(&buf),
            Err(IpcError::ProtocolError(_))
        ));
    }

    #[test]
    fn unknown_message_type_rejected() {
        let header = sample(0);
        let mut buf = header.encode().to_vec();
        buf[14] = 0xff;
        assert!(matches!(
            SomeIpHeader::decode(&buf),
            Err(IpcError::ProtocolError(_))
        ));
    }

    #[test]
    fn unrecognized_return_code_preserved_not_rejected() {
        let header = sample(0);
        let mut buf = header.encode().to_vec();
        buf[15] = 0x42;
        let decoded = SomeIpHeader::decode(&buf).unwrap();
        assert_eq!(decoded.return_code, ReturnCode::Unknown(0x42));
    }
}

use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Maximum payload of a single DATA packet. A shorter payload marks the end of a transfer.
pub const MAX_DATA_LEN: usize = 512;
/// opcode (2) + block number (2) + payload
pub const MAX_PACKET_LEN: usize = 4 + MAX_DATA_LEN;
/// Block numbers are unsigned 16 bit values on the wire, but a value with the top bit set is
///  rejected as 'negative'. This is the highest block number a transfer can reach.
pub const MAX_BLOCK_NUMBER: u16 = 0x7fff;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketFormatError {
    #[error("packet is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    #[error("ACK packet must have exactly 4 bytes, was {0}")]
    AckLength(usize),
    #[error("error code {0} is out of range")]
    ErrorCodeOutOfRange(u16),
    #[error("negative block number {0:#06x}")]
    NegativeBlockNumber(u16),
    #[error("DATA payload has {0} bytes, maximum is {MAX_DATA_LEN}")]
    PayloadTooLong(usize),
    #[error("malformed ERROR packet: {0}")]
    MalformedError(&'static str),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("string field contains a NUL byte")]
    EmbeddedNul,
}

/// A TFTP packet. Each variant carries exactly the fields that are legal for its opcode, and a
///  value returned by [Packet::decode] has passed all format checks.
#[derive(Clone, Eq, PartialEq)]
pub enum Packet {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::ReadRequest { filename, mode } => write!(f, "RRQ({}:{})", filename, mode),
            Packet::WriteRequest { filename, mode } => write!(f, "WRQ({}:{})", filename, mode),
            Packet::Data { block, payload } => write!(f, "DATA({}:{}b)", block, payload.len()),
            Packet::Ack { block } => write!(f, "ACK({})", block),
            Packet::Error { code, message } => write!(f, "ERROR({}:{})", u16::from(*code), message),
        }
    }
}

impl Packet {
    pub fn ack(block: u16) -> Packet {
        Packet::Ack { block }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error { code, message: message.into() }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::ReadRequest,
            Packet::WriteRequest { .. } => Opcode::WriteRequest,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// block number for DATA and ACK packets
    pub fn block(&self) -> Option<u16> {
        match self {
            Packet::Data { block, .. } | Packet::Ack { block } => Some(*block),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Packet::ReadRequest { .. } | Packet::WriteRequest { .. })
    }

    /// Checks everything [Packet::decode] would check, so that `decode(encode(p)) == p` holds
    ///  for every packet that passes.
    pub fn validate(&self) -> Result<(), PacketFormatError> {
        match self {
            Packet::ReadRequest { filename, mode } | Packet::WriteRequest { filename, mode } => {
                if filename.is_empty() {
                    return Err(PacketFormatError::MalformedRequest("empty file name"));
                }
                if mode.is_empty() {
                    return Err(PacketFormatError::MalformedRequest("empty mode"));
                }
                check_no_nul(filename)?;
                check_no_nul(mode)
            }
            Packet::Data { block, payload } => {
                check_block(*block)?;
                if payload.len() > MAX_DATA_LEN {
                    return Err(PacketFormatError::PayloadTooLong(payload.len()));
                }
                Ok(())
            }
            Packet::Ack { block } => check_block(*block).map(|_| ()),
            Packet::Error { message, .. } => check_no_nul(message),
        }
    }

    pub fn encode(&self) -> Result<Bytes, PacketFormatError> {
        self.validate()?;

        let mut buf = BytesMut::with_capacity(MAX_PACKET_LEN);
        buf.put_u16(self.opcode().into());
        match self {
            Packet::ReadRequest { filename, mode } | Packet::WriteRequest { filename, mode } => {
                put_terminated(&mut buf, filename);
                put_terminated(&mut buf, mode);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16((*code).into());
                put_terminated(&mut buf, message);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Packet, PacketFormatError> {
        let total_len = raw.len();
        let mut buf = raw;

        if buf.remaining() < 2 {
            return Err(PacketFormatError::Truncated(total_len));
        }
        let raw_opcode = buf.get_u16();
        let opcode = Opcode::try_from_primitive(raw_opcode)
            .map_err(|_| PacketFormatError::UnknownOpcode(raw_opcode))?;

        match opcode {
            Opcode::ReadRequest => {
                let (filename, mode) = decode_request_fields(buf)?;
                Ok(Packet::ReadRequest { filename, mode })
            }
            Opcode::WriteRequest => {
                let (filename, mode) = decode_request_fields(buf)?;
                Ok(Packet::WriteRequest { filename, mode })
            }
            Opcode::Data => {
                if buf.remaining() < 2 {
                    return Err(PacketFormatError::Truncated(total_len));
                }
                let block = check_block(buf.get_u16())?;
                if buf.remaining() > MAX_DATA_LEN {
                    return Err(PacketFormatError::PayloadTooLong(buf.remaining()));
                }
                Ok(Packet::Data { block, payload: Bytes::copy_from_slice(buf) })
            }
            Opcode::Ack => {
                if total_len != 4 {
                    return Err(PacketFormatError::AckLength(total_len));
                }
                let block = check_block(buf.get_u16())?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(PacketFormatError::Truncated(total_len));
                }
                let raw_code = buf.get_u16();
                let code = ErrorCode::try_from_primitive(raw_code)
                    .map_err(|_| PacketFormatError::ErrorCodeOutOfRange(raw_code))?;

                let message = match buf.split_last() {
                    Some((0, message)) => message,
                    _ => return Err(PacketFormatError::MalformedError("missing terminator")),
                };
                if message.contains(&0) {
                    return Err(PacketFormatError::MalformedError("data after terminator"));
                }
                Ok(Packet::Error { code, message: to_string(message)? })
            }
        }
    }
}

/// RRQ / WRQ body: `filename 0x00 mode 0x00`, nothing before, between or after
fn decode_request_fields(body: &[u8]) -> Result<(String, String), PacketFormatError> {
    let fields = match body.split_last() {
        Some((0, fields)) => fields,
        _ => return Err(PacketFormatError::MalformedRequest("missing terminator")),
    };

    let mut parts = fields.split(|&b| b == 0);
    let (filename, mode) = match (parts.next(), parts.next(), parts.next()) {
        (Some(filename), Some(mode), None) => (filename, mode),
        _ => return Err(PacketFormatError::MalformedRequest("expected exactly two fields")),
    };

    if filename.is_empty() {
        return Err(PacketFormatError::MalformedRequest("empty file name"));
    }
    if mode.is_empty() {
        return Err(PacketFormatError::MalformedRequest("empty mode"));
    }
    Ok((to_string(filename)?, to_string(mode)?))
}

fn check_block(block: u16) -> Result<u16, PacketFormatError> {
    if block > MAX_BLOCK_NUMBER {
        return Err(PacketFormatError::NegativeBlockNumber(block));
    }
    Ok(block)
}

fn check_no_nul(s: &str) -> Result<(), PacketFormatError> {
    if s.as_bytes().contains(&0) {
        return Err(PacketFormatError::EmbeddedNul);
    }
    Ok(())
}

fn to_string(raw: &[u8]) -> Result<String, PacketFormatError> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| PacketFormatError::InvalidUtf8)
}

fn put_terminated(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

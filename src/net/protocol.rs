//! Wire protocol framing.
//!
//! A frame is a 4-byte big-endian payload length, a 1-byte message type,
//! then the payload. Frames above `MESSAGE_SIZE_LIMIT` are a protocol
//! violation and earn a ban.

use std::io::{Read, Write};

use crate::core::constants::MESSAGE_SIZE_LIMIT;
use crate::core::errors::{DecodeError, MontanaError, MontanaResult};

/// Service bits advertised during the handshake.
pub mod services {
    /// Serves full blocks.
    pub const NODE_NETWORK: u64 = 1 << 0;
    /// Participates in the VDF and serves heartbeats.
    pub const NODE_VDF: u64 = 1 << 1;
}

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Version = 1,
    Verack = 2,
    Ping = 3,
    Pong = 4,
    Inv = 5,
    GetData = 6,
    Block = 7,
    Tx = 8,
    GetHeaders = 9,
    Headers = 10,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageType::Version),
            2 => Some(MessageType::Verack),
            3 => Some(MessageType::Ping),
            4 => Some(MessageType::Pong),
            5 => Some(MessageType::Inv),
            6 => Some(MessageType::GetData),
            7 => Some(MessageType::Block),
            8 => Some(MessageType::Tx),
            9 => Some(MessageType::GetHeaders),
            10 => Some(MessageType::Headers),
            _ => None,
        }
    }
}

/// Inventory item types for inv/getdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InvType {
    Transaction = 1,
    Block = 2,
}

impl InvType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(InvType::Transaction),
            2 => Some(InvType::Block),
            _ => None,
        }
    }
}

/// Write one frame to the stream.
pub fn write_frame(stream: &mut impl Write, ty: MessageType, payload: &[u8]) -> MontanaResult<()> {
    if payload.len() > MESSAGE_SIZE_LIMIT {
        return Err(MontanaError::ProtocolViolation("outbound frame oversized"));
    }
    // Length covers the type byte plus the payload.
    let length = (payload.len() + 1) as u32;
    stream.write_all(&length.to_be_bytes())?;
    stream.write_all(&[ty as u8])?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame from the stream. I/O timeouts surface as `Io` errors
/// configured on the underlying socket.
pub fn read_frame(stream: &mut impl Read) -> MontanaResult<(MessageType, Vec<u8>)> {
    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes)?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length == 0 {
        return Err(MontanaError::ProtocolViolation("empty frame"));
    }
    if length > MESSAGE_SIZE_LIMIT + 1 {
        return Err(MontanaError::ProtocolViolation("oversized frame"));
    }

    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte)?;
    let ty = MessageType::from_u8(type_byte[0]).ok_or(MontanaError::Decode(
        DecodeError::InvalidVariant {
            kind: "message type",
            tag: type_byte[0],
        },
    ))?;

    let mut payload = vec![0u8; length - 1];
    stream.read_exact(&mut payload)?;
    Ok((ty, payload))
}

//! Peer protocol message payloads.

use crate::core::block::{Block, BlockHeader, Transaction};
use crate::core::codec::{Decodable, Encodable, Reader, Writer};
use crate::core::constants::{MAX_HEADERS_PER_MSG, MAX_INV_ITEMS, MAX_LOCATOR_HASHES};
use crate::core::errors::DecodeError;
use crate::core::types::Hash;
use crate::net::protocol::{InvType, MessageType};

/// Handshake payload. The nonce detects self-connection; the reported
/// best height seeds sync targeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMsg {
    pub version: u32,
    pub services: u64,
    pub timestamp_ms: u64,
    pub nonce: u64,
    pub user_agent: String,
    pub best_height: u64,
}

impl Encodable for VersionMsg {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u32(self.version);
        w.put_u64(self.services);
        w.put_u64(self.timestamp_ms);
        w.put_u64(self.nonce);
        w.put_bytes(self.user_agent.as_bytes());
        w.put_u64(self.best_height);
    }
}

impl Decodable for VersionMsg {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(VersionMsg {
            version: r.u32()?,
            services: r.u64()?,
            timestamp_ms: r.u64()?,
            nonce: r.u64()?,
            user_agent: String::from_utf8_lossy(&r.bytes_max(256)?).into_owned(),
            best_height: r.u64()?,
        })
    }
}

/// One (type, hash) pair in an inv or getdata listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvType,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        InvItem {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn transaction(hash: Hash) -> Self {
        InvItem {
            kind: InvType::Transaction,
            hash,
        }
    }
}

/// Shared shape of `inv` and `getdata`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InventoryMsg {
    pub items: Vec<InvItem>,
}

impl Encodable for InventoryMsg {
    fn encode_into(&self, w: &mut Writer) {
        w.put_count(self.items.len());
        for item in &self.items {
            w.put_u8(item.kind as u8);
            w.put_hash(&item.hash);
        }
    }
}

impl Decodable for InventoryMsg {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.count(MAX_INV_ITEMS)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = r.u8()?;
            let kind = InvType::from_u8(tag).ok_or(DecodeError::InvalidVariant {
                kind: "inventory type",
                tag,
            })?;
            items.push(InvItem {
                kind,
                hash: r.hash()?,
            });
        }
        Ok(InventoryMsg { items })
    }
}

/// Header-chain locator: newest-first known hashes plus a stop hash
/// (zero for "as many as allowed").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMsg {
    pub locators: Vec<Hash>,
    pub stop: Hash,
}

impl Encodable for GetHeadersMsg {
    fn encode_into(&self, w: &mut Writer) {
        w.put_count(self.locators.len());
        for locator in &self.locators {
            w.put_hash(locator);
        }
        w.put_hash(&self.stop);
    }
}

impl Decodable for GetHeadersMsg {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.count(MAX_LOCATOR_HASHES)?;
        let mut locators = Vec::with_capacity(count);
        for _ in 0..count {
            locators.push(r.hash()?);
        }
        Ok(GetHeadersMsg {
            locators,
            stop: r.hash()?,
        })
    }
}

/// Ordered header list, capped per message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadersMsg {
    pub headers: Vec<BlockHeader>,
}

impl Encodable for HeadersMsg {
    fn encode_into(&self, w: &mut Writer) {
        w.put_count(self.headers.len());
        for header in &self.headers {
            header.encode_into(w);
        }
    }
}

impl Decodable for HeadersMsg {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.count(MAX_HEADERS_PER_MSG)?;
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            headers.push(BlockHeader::decode_from(r)?);
        }
        Ok(HeadersMsg { headers })
    }
}

/// A fully decoded inbound or outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMessage {
    Version(VersionMsg),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(InventoryMsg),
    GetData(InventoryMsg),
    Block(Block),
    Tx(Transaction),
    GetHeaders(GetHeadersMsg),
    Headers(HeadersMsg),
}

impl NetMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            NetMessage::Version(_) => MessageType::Version,
            NetMessage::Verack => MessageType::Verack,
            NetMessage::Ping(_) => MessageType::Ping,
            NetMessage::Pong(_) => MessageType::Pong,
            NetMessage::Inv(_) => MessageType::Inv,
            NetMessage::GetData(_) => MessageType::GetData,
            NetMessage::Block(_) => MessageType::Block,
            NetMessage::Tx(_) => MessageType::Tx,
            NetMessage::GetHeaders(_) => MessageType::GetHeaders,
            NetMessage::Headers(_) => MessageType::Headers,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            NetMessage::Version(msg) => msg.encode(),
            NetMessage::Verack => Vec::new(),
            NetMessage::Ping(nonce) | NetMessage::Pong(nonce) => nonce.to_be_bytes().to_vec(),
            NetMessage::Inv(msg) | NetMessage::GetData(msg) => msg.encode(),
            NetMessage::Block(block) => block.encode(),
            NetMessage::Tx(tx) => tx.encode(),
            NetMessage::GetHeaders(msg) => msg.encode(),
            NetMessage::Headers(msg) => msg.encode(),
        }
    }

    /// Strict payload decode for a framed message type.
    pub fn decode(ty: MessageType, payload: &[u8]) -> Result<Self, DecodeError> {
        let decode_nonce = |payload: &[u8]| -> Result<u64, DecodeError> {
            let mut r = Reader::new(payload);
            let nonce = r.u64()?;
            r.finish()?;
            Ok(nonce)
        };

        match ty {
            MessageType::Version => Ok(NetMessage::Version(VersionMsg::decode(payload)?)),
            MessageType::Verack => {
                if payload.is_empty() {
                    Ok(NetMessage::Verack)
                } else {
                    Err(DecodeError::TrailingBytes(payload.len()))
                }
            }
            MessageType::Ping => Ok(NetMessage::Ping(decode_nonce(payload)?)),
            MessageType::Pong => Ok(NetMessage::Pong(decode_nonce(payload)?)),
            MessageType::Inv => Ok(NetMessage::Inv(InventoryMsg::decode(payload)?)),
            MessageType::GetData => Ok(NetMessage::GetData(InventoryMsg::decode(payload)?)),
            MessageType::Block => Ok(NetMessage::Block(Block::decode(payload)?)),
            MessageType::Tx => Ok(NetMessage::Tx(Transaction::decode(payload)?)),
            MessageType::GetHeaders => Ok(NetMessage::GetHeaders(GetHeadersMsg::decode(payload)?)),
            MessageType::Headers => Ok(NetMessage::Headers(HeadersMsg::decode(payload)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::PROTOCOL_VERSION;
    use crate::net::protocol::services;

    fn round_trip(msg: NetMessage) {
        let ty = msg.message_type();
        let payload = msg.payload();
        let parsed = NetMessage::decode(ty, &payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_version_round_trip() {
        round_trip(NetMessage::Version(VersionMsg {
            version: PROTOCOL_VERSION,
            services: services::NODE_NETWORK | services::NODE_VDF,
            timestamp_ms: 123_456_789,
            nonce: 0xdead_beef,
            user_agent: "montana-timechain/0.1.0".into(),
            best_height: 42,
        }));
    }

    #[test]
    fn test_ping_pong_round_trip() {
        round_trip(NetMessage::Ping(7));
        round_trip(NetMessage::Pong(7));
    }

    #[test]
    fn test_verack_rejects_payload() {
        assert!(NetMessage::decode(MessageType::Verack, &[1]).is_err());
        round_trip(NetMessage::Verack);
    }

    #[test]
    fn test_inventory_round_trip() {
        round_trip(NetMessage::Inv(InventoryMsg {
            items: vec![
                InvItem::block(Hash([1u8; 32])),
                InvItem::transaction(Hash([2u8; 32])),
            ],
        }));
        round_trip(NetMessage::GetData(InventoryMsg {
            items: vec![InvItem::block(Hash([3u8; 32]))],
        }));
    }

    #[test]
    fn test_inventory_bad_type_rejected() {
        let mut w = Writer::new();
        w.put_count(1);
        w.put_u8(9);
        w.put_hash(&Hash([1u8; 32]));
        assert!(matches!(
            InventoryMsg::decode(&w.into_bytes()),
            Err(DecodeError::InvalidVariant { .. })
        ));
    }

    #[test]
    fn test_getheaders_round_trip() {
        round_trip(NetMessage::GetHeaders(GetHeadersMsg {
            locators: vec![Hash([4u8; 32]), Hash([5u8; 32])],
            stop: Hash::ZERO,
        }));
    }

    #[test]
    fn test_headers_round_trip() {
        round_trip(NetMessage::Headers(HeadersMsg {
            headers: vec![Block::genesis().header],
        }));
    }

    #[test]
    fn test_block_message_round_trip() {
        round_trip(NetMessage::Block(Block::genesis()));
    }
}

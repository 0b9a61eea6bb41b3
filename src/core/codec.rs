//! Canonical byte encoding.
//!
//! Every hashable object has exactly one encoding: fixed-width integers
//! are big-endian, byte strings carry a 4-byte big-endian length, and
//! sequences carry a 4-byte big-endian count followed by the element
//! encodings. Decoding is strict: trailing bytes are an error.

use crate::core::errors::DecodeError;
use crate::core::types::{Hash, HASH_SIZE};

/// Append-only canonical encoder.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Fixed-width field; the caller guarantees the width.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Variable-length byte string: 4-byte big-endian length + bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_hash(&mut self, h: &Hash) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    /// Sequence count prefix.
    pub fn put_count(&mut self, n: usize) {
        self.put_u32(n as u32);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Strict canonical decoder over a borrowed buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    /// Length-prefixed byte string. The length may not exceed what the
    /// buffer can still supply, so hostile lengths fail fast.
    pub fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(DecodeError::InvalidLength {
                length: len,
                limit: self.remaining(),
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed byte string with an explicit upper bound.
    pub fn bytes_max(&mut self, max: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(DecodeError::InvalidLength {
                length: len,
                limit: max,
            });
        }
        if len > self.remaining() {
            return Err(DecodeError::InvalidLength {
                length: len,
                limit: self.remaining(),
            });
        }
        Ok(self.take(len)?.to_vec())
    }

    pub fn hash(&mut self) -> Result<Hash, DecodeError> {
        let bytes = self.take(HASH_SIZE)?;
        Ok(Hash::from_slice(bytes).expect("fixed width"))
    }

    /// Sequence count prefix, bounded by `max` elements.
    pub fn count(&mut self, max: usize) -> Result<usize, DecodeError> {
        let n = self.u32()? as usize;
        if n > max {
            return Err(DecodeError::InvalidLength {
                length: n,
                limit: max,
            });
        }
        Ok(n)
    }

    /// Strict finish: any unread byte is an error.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

/// Objects with a canonical byte encoding.
pub trait Encodable {
    fn encode_into(&self, w: &mut Writer);

    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_into(&mut w);
        w.into_bytes()
    }
}

/// Objects decodable from their canonical encoding.
pub trait Decodable: Sized {
    fn decode_from(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Strict whole-buffer decode; trailing bytes are rejected.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let out = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(out)
    }
}

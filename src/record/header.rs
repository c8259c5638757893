//! Allocation header codec.
//!
//! Every block that belongs to a record starts with this header. The key is
//! repeated in every block of a chain so a scan can tell who owns any block
//! without following pointers.
//!
//! Layout (little-endian):
//! ```text
//! [sequence: u32]      // position of this block within its chain, from 0
//! [next: u32]          // next block of the chain, 0 = last block
//! [flags: u8]          // bit0 compressed, bit1 serialized, bit2 tombstone
//! [payload_len: u32]   // decoded length of the whole record
//! [key_len: u8]        // 1..=255
//! [key_type: u8]       // 1 = string
//! [key: key_len bytes]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the header without the embedded key.
pub const FIXED_HEADER_SIZE: usize = 15;

/// The only key type tag currently written and accepted.
pub const KEY_TYPE_STRING: u8 = 1;

/// Size of a header carrying a key of `key_len` bytes.
pub fn header_size(key_len: usize) -> usize {
    FIXED_HEADER_SIZE + key_len
}

/// Flag byte of an allocation header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// Payload is compressed.
    pub const COMPRESSED: u8 = 0x01;
    /// Payload is a serialized object rather than raw bytes.
    pub const SERIALIZED: u8 = 0x02;
    /// The record marks a deleted key.
    pub const TOMBSTONE: u8 = 0x04;

    /// Wrap a raw flag byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw flag byte.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Flags of a tombstone record.
    pub fn tombstone() -> Self {
        Self(Self::TOMBSTONE)
    }

    /// Returns a copy with `bit` set.
    pub fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    /// Whether the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Whether the payload is a serialized object.
    pub fn is_serialized(&self) -> bool {
        self.0 & Self::SERIALIZED != 0
    }

    /// Whether the record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.0 & Self::TOMBSTONE != 0
    }
}

impl fmt::Debug for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordFlags")
            .field("compressed", &self.is_compressed())
            .field("serialized", &self.is_serialized())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

/// Why a block failed to decode as the expected part of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderMismatch {
    /// The block sits at a different position than the walk expected.
    #[error("block sequence mismatch: expected {expected}, found {found}")]
    Sequence {
        /// Sequence number the walk was looking for.
        expected: u32,
        /// Sequence number stored in the block.
        found: u32,
    },

    /// The key type tag is not a supported value.
    #[error("unsupported key type tag {0}")]
    KeyType(u8),

    /// The key length is zero or runs past the bytes read.
    #[error("invalid embedded key length {0}")]
    KeyLength(u8),

    /// A string key is not valid UTF-8.
    #[error("embedded key is not valid UTF-8")]
    KeyEncoding,

    /// Fewer bytes than a fixed header.
    #[error("header truncated to {0} bytes")]
    Truncated(usize),
}

/// A decoded allocation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position of the block within its chain.
    pub sequence: u32,
    /// Next block of the chain, 0 when this is the last one.
    pub next: u32,
    /// Record flags.
    pub flags: RecordFlags,
    /// Length of the whole record payload.
    pub payload_len: u32,
    /// The record's key.
    pub key: String,
}

impl BlockHeader {
    /// Header for the first block of a record. `sequence` and `next` are
    /// filled in per block by the writer.
    pub fn new(key: impl Into<String>, flags: RecordFlags, payload_len: u32) -> Self {
        Self { sequence: 0, next: 0, flags, payload_len, key: key.into() }
    }

    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        header_size(self.key.len())
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(!self.key.is_empty() && self.key.len() <= u8::MAX as usize);

        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.next);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.payload_len);
        buf.put_u8(self.key.len() as u8);
        buf.put_u8(KEY_TYPE_STRING);
        buf.put_slice(self.key.as_bytes());
    }

    /// Encode the header into a new buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Decode a header, checking that it sits at `expected_sequence`.
    ///
    /// `raw` may be longer than the header; the rest is ignored.
    pub fn decode(raw: &[u8], expected_sequence: u32) -> Result<Self, HeaderMismatch> {
        if raw.len() < FIXED_HEADER_SIZE {
            return Err(HeaderMismatch::Truncated(raw.len()));
        }

        let mut cursor = raw;
        let sequence = cursor.get_u32_le();
        if sequence != expected_sequence {
            return Err(HeaderMismatch::Sequence { expected: expected_sequence, found: sequence });
        }

        let next = cursor.get_u32_le();
        let flags = RecordFlags::from_bits(cursor.get_u8());
        let payload_len = cursor.get_u32_le();
        let key_len = cursor.get_u8();
        let key_type = cursor.get_u8();

        if key_type != KEY_TYPE_STRING {
            return Err(HeaderMismatch::KeyType(key_type));
        }
        if key_len == 0 || cursor.len() < key_len as usize {
            return Err(HeaderMismatch::KeyLength(key_len));
        }

        let key = std::str::from_utf8(&cursor[..key_len as usize])
            .map_err(|_| HeaderMismatch::KeyEncoding)?
            .to_string();

        Ok(Self { sequence, next, flags, payload_len, key })
    }
}

/// True if the fixed part of a raw header is all zeros, i.e. the block was
/// never written or has been scrubbed.
pub fn is_blank(raw: &[u8]) -> bool {
    raw.iter().take(FIXED_HEADER_SIZE).all(|b| *b == 0)
}

//! Record chains: writing a payload across blocks and walking it back.

use super::header::{header_size, BlockHeader, HeaderMismatch, RecordFlags, FIXED_HEADER_SIZE};
use crate::config::MAX_KEY_LENGTH;
use crate::device::{BlockDevice, FIRST_DATA_BLOCK};
use crate::error::{Error, Result};
use bytes::BytesMut;
use thiserror::Error;

/// Bytes read when only the header of a block is needed.
pub const HEADER_READ_LEN: usize = FIXED_HEADER_SIZE + MAX_KEY_LENGTH;

/// Why a chain walk stopped before reaching the end of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainFault {
    /// A block header did not decode as the next part of the chain.
    #[error(transparent)]
    Header(#[from] HeaderMismatch),

    /// A continuation block belongs to a different key.
    #[error("block carries key {found:?}, chain belongs to {expected:?}")]
    KeyMismatch {
        /// Key of the chain head.
        expected: String,
        /// Key found in the block.
        found: String,
    },

    /// A next pointer leads outside the data blocks.
    #[error("next pointer {0} is outside the device")]
    Dangling(u32),

    /// The walk visited more blocks than the device holds.
    #[error("chain runs past {0} blocks")]
    Loop(u32),

    /// The chain ended before the recorded payload length was read.
    #[error("chain ended after {read} of {expected} payload bytes")]
    ShortPayload {
        /// Payload bytes found.
        read: usize,
        /// Payload bytes recorded in the head.
        expected: usize,
    },
}

/// One block of a chain, as produced by [`ChainWalker`].
#[derive(Debug, Clone)]
pub struct ChainLink {
    /// Physical block number.
    pub block: u32,
    /// Decoded header of the block.
    pub header: BlockHeader,
    /// Bytes following the header (empty for header-only walks).
    pub data: Vec<u8>,
}

/// Lazily walks a chain from its anchor, one block per step.
///
/// Each block must carry the next sequence number and the head's key. The walk
/// is capped at the device's block count, so a corrupted chain whose pointers
/// loop cannot spin forever. The first fault is yielded as an error and ends
/// the iteration.
pub struct ChainWalker<'a, D: BlockDevice + ?Sized> {
    device: &'a mut D,
    next: Option<u32>,
    sequence: u32,
    read_len: usize,
    key: Option<String>,
    limit: u32,
}

impl<'a, D: BlockDevice + ?Sized> ChainWalker<'a, D> {
    /// Walk reading whole blocks, payload included.
    pub fn new(device: &'a mut D, anchor: u32) -> Self {
        let read_len = device.block_size() as usize;
        Self::with_read_len(device, anchor, read_len)
    }

    /// Walk reading only block headers.
    pub fn headers_only(device: &'a mut D, anchor: u32) -> Self {
        Self::with_read_len(device, anchor, HEADER_READ_LEN)
    }

    fn with_read_len(device: &'a mut D, anchor: u32, read_len: usize) -> Self {
        let limit = device.block_count();
        Self { device, next: Some(anchor), sequence: 0, read_len, key: None, limit }
    }

    fn step(&mut self, block: u32) -> Result<ChainLink> {
        if self.sequence >= self.limit {
            return Err(Error::structural(block, ChainFault::Loop(self.limit)));
        }
        if block < FIRST_DATA_BLOCK || block >= self.device.block_count() {
            return Err(Error::structural(block, ChainFault::Dangling(block)));
        }

        let raw = self.device.read_block(block, self.read_len)?;
        let header =
            BlockHeader::decode(&raw, self.sequence).map_err(|m| Error::structural(block, m))?;

        match &self.key {
            Some(expected) if *expected != header.key => {
                return Err(Error::structural(
                    block,
                    ChainFault::KeyMismatch { expected: expected.clone(), found: header.key },
                ));
            }
            Some(_) => {}
            None => self.key = Some(header.key.clone()),
        }

        let data = raw.get(header.encoded_len()..).map(<[u8]>::to_vec).unwrap_or_default();
        self.sequence += 1;
        self.next = (header.next != 0).then_some(header.next);

        Ok(ChainLink { block, header, data })
    }
}

impl<D: BlockDevice + ?Sized> Iterator for ChainWalker<'_, D> {
    type Item = Result<ChainLink>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        Some(self.step(block))
    }
}

/// Header fields of one logical record, gathered from its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBlock {
    /// The record's key.
    pub key: String,
    /// Flags from the chain head.
    pub flags: RecordFlags,
    /// Length of the whole payload.
    pub payload_len: u32,
    /// Physical blocks in chain order; the first one is the anchor.
    pub blocks: Vec<u32>,
}

impl AllocationBlock {
    fn from_head(block: u32, header: &BlockHeader) -> Self {
        Self {
            key: header.key.clone(),
            flags: header.flags,
            payload_len: header.payload_len,
            blocks: vec![block],
        }
    }

    /// Walk the chain at `anchor`, reading headers only.
    ///
    /// Fails with [`Error::StructuralMismatch`] if any block is out of place.
    pub fn load<D: BlockDevice + ?Sized>(device: &mut D, anchor: u32) -> Result<Self> {
        let trace = trace_chain(device, anchor)?;
        if let Some(fault) = trace.fault {
            return Err(fault);
        }
        let head = trace.head.ok_or_else(|| Error::corruption("chain walk produced no blocks"))?;
        Ok(Self {
            key: head.key,
            flags: head.flags,
            payload_len: head.payload_len,
            blocks: trace.blocks,
        })
    }

    /// The chain head.
    pub fn anchor(&self) -> u32 {
        self.blocks[0]
    }

    /// Encoded length of the key.
    pub fn key_len(&self) -> usize {
        self.key.len()
    }
}

/// Blocks of a chain up to its first fault.
#[derive(Debug)]
pub struct ChainTrace {
    /// Header of the anchor, if it decoded.
    pub head: Option<BlockHeader>,
    /// Blocks that decoded as part of the chain, in order.
    pub blocks: Vec<u32>,
    /// The structural fault that ended the walk early, if any.
    pub fault: Option<Error>,
}

impl ChainTrace {
    /// Whether the whole chain decoded.
    pub fn is_intact(&self) -> bool {
        self.fault.is_none() && self.head.is_some()
    }
}

/// Follow the chain at `anchor` as far as it is structurally sound.
///
/// Structural faults are recorded in the trace; I/O errors are returned.
pub fn trace_chain<D: BlockDevice + ?Sized>(device: &mut D, anchor: u32) -> Result<ChainTrace> {
    let mut trace = ChainTrace { head: None, blocks: Vec::new(), fault: None };

    for link in ChainWalker::headers_only(device, anchor) {
        match link {
            Ok(link) => {
                trace.blocks.push(link.block);
                if trace.head.is_none() {
                    trace.head = Some(link.header);
                }
            }
            Err(e) if e.is_structural() => {
                trace.fault = Some(e);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(trace)
}

/// Read the record anchored at `anchor` and reassemble its payload.
///
/// Reading stops once the recorded payload length has been collected.
pub fn read_record<D: BlockDevice + ?Sized>(
    device: &mut D,
    anchor: u32,
) -> Result<(AllocationBlock, Vec<u8>)> {
    let mut walker = ChainWalker::new(device, anchor);

    let head = walker
        .next()
        .ok_or_else(|| Error::corruption("chain walk produced no blocks"))??;
    let mut record = AllocationBlock::from_head(head.block, &head.header);
    let expected = head.header.payload_len as usize;

    let mut payload = Vec::with_capacity(expected);
    let take = expected.min(head.data.len());
    payload.extend_from_slice(&head.data[..take]);

    let mut last = head.block;
    while payload.len() < expected {
        let link = match walker.next() {
            Some(link) => link?,
            None => {
                return Err(Error::structural(
                    last,
                    ChainFault::ShortPayload { read: payload.len(), expected },
                ));
            }
        };
        let take = (expected - payload.len()).min(link.data.len());
        payload.extend_from_slice(&link.data[..take]);
        record.blocks.push(link.block);
        last = link.block;
    }

    Ok((record, payload))
}

/// Write `payload` as a fresh chain for `key` and return its blocks, anchor
/// first.
///
/// Blocks are allocated one at a time as the write reaches them. A failure
/// partway leaves the blocks written so far on the device; there is no
/// rollback.
pub fn write_chain<D: BlockDevice + ?Sized>(
    device: &mut D,
    key: &str,
    flags: RecordFlags,
    payload: &[u8],
) -> Result<Vec<u32>> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| Error::invalid_argument(format!("payload of {} bytes is too large", payload.len())))?;
    let mut header = BlockHeader::new(key, flags, payload_len);

    let block_size = device.block_size() as usize;
    let capacity = block_size
        .checked_sub(header_size(key.len()))
        .filter(|c| *c > 0)
        .ok_or_else(|| Error::invalid_argument("key leaves no room for data in a block"))?;
    let count = payload.len().div_ceil(capacity).max(1);

    let mut blocks = Vec::with_capacity(count);
    let mut buf = BytesMut::with_capacity(block_size);
    let mut current = device.allocate_free_block()?;

    for i in 0..count {
        let next = if i + 1 < count { device.allocate_free_block()? } else { 0 };
        let start = i * capacity;
        let end = (start + capacity).min(payload.len());

        header.sequence = i as u32;
        header.next = next;
        buf.clear();
        header.encode_into(&mut buf);
        buf.extend_from_slice(&payload[start..end]);

        device.write_block(current, &buf)?;
        blocks.push(current);
        current = next;
    }

    Ok(blocks)
}

/// Write a single tombstone block for `key` and return its number.
pub fn write_tombstone<D: BlockDevice + ?Sized>(device: &mut D, key: &str) -> Result<u32> {
    let header = BlockHeader::new(key, RecordFlags::tombstone(), 0);
    let block = device.allocate_free_block()?;
    device.write_block(block, &header.encode())?;
    Ok(block)
}

/// Zero `blocks` and return them to the free list.
///
/// A zeroed block can never be mistaken for part of a record by a later scan.
pub fn release_blocks<D: BlockDevice + ?Sized>(device: &mut D, blocks: &[u32]) -> Result<()> {
    for &block in blocks {
        device.write_block(block, &[])?;
    }
    device.free_blocks(blocks)
}

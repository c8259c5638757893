//! Record layout on top of the block device.
//!
//! A record is a chain of blocks. Every block starts with an allocation
//! header naming its key and its position in the chain, followed by a slice
//! of the payload:
//!
//! ```text
//! [Block a: header(seq 0, next b) | payload[0..n]]
//! [Block b: header(seq 1, next c) | payload[n..2n]]
//! [Block c: header(seq 2, next 0) | payload[2n..]]
//! ```
//!
//! Because the key travels with every block, the store can rebuild its key
//! index from the data file alone.

mod chain;
mod header;

pub use chain::{
    read_record, release_blocks, trace_chain, write_chain, write_tombstone, AllocationBlock,
    ChainFault, ChainLink, ChainTrace, ChainWalker, HEADER_READ_LEN,
};
pub use header::{
    header_size, is_blank, BlockHeader, HeaderMismatch, RecordFlags, FIXED_HEADER_SIZE,
    KEY_TYPE_STRING,
};

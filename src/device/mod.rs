//! Block device abstraction.
//!
//! A block device hands out fixed-size blocks addressed by a `u32` number,
//! keeps track of which ones are free, and reads and writes them whole.
//!
//! Block 0 is reserved for the device's own metadata and is never returned by
//! [`BlockDevice::allocate_free_block`]. Record chains therefore use 0 as their
//! "no next block" marker without ambiguity.

mod file;
#[cfg(test)]
mod memory;

pub use file::{FileBlockDevice, DATA_FILE, FREE_LIST_FILE};
#[cfg(test)]
pub(crate) use memory::MemoryBlockDevice;

use crate::error::Result;

/// First block number that can hold record data.
pub const FIRST_DATA_BLOCK: u32 = 1;

/// Fixed-size block storage with a free list.
pub trait BlockDevice {
    /// Take a block from the free list, or grow the device by one block.
    fn allocate_free_block(&mut self) -> Result<u32>;

    /// Return a block to the free list. It may be handed out again by the
    /// next allocation.
    fn free_block(&mut self, block: u32) -> Result<()>;

    /// Return several blocks to the free list.
    fn free_blocks(&mut self, blocks: &[u32]) -> Result<()> {
        for &block in blocks {
            self.free_block(block)?;
        }
        Ok(())
    }

    /// Write `data` at the start of `block`, zero padding the rest of it.
    ///
    /// `data` longer than the block size is rejected.
    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()>;

    /// Read the first `len` bytes of `block` (capped at the block size).
    /// Bytes that were never written read as zeros.
    fn read_block(&mut self, block: u32, len: usize) -> Result<Vec<u8>>;

    /// Size of every block in bytes.
    fn block_size(&self) -> u16;

    /// Number of blocks, including the reserved block 0.
    fn block_count(&self) -> u32;

    /// Number of blocks currently on the free list.
    fn free_count(&self) -> usize;

    /// Flush written blocks to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Persist device metadata and release the underlying file.
    fn shutdown(&mut self) -> Result<()>;
}

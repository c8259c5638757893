//! In-memory block device for unit tests.

use super::{BlockDevice, FIRST_DATA_BLOCK};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Block device backed by a vector of blocks.
pub(crate) struct MemoryBlockDevice {
    block_size: u16,
    blocks: Vec<Vec<u8>>,
    free: BTreeSet<u32>,
    /// Allocations left before `allocate_free_block` starts failing.
    pub(crate) allocation_budget: Option<usize>,
}

impl MemoryBlockDevice {
    pub(crate) fn new(block_size: u16) -> Self {
        Self {
            block_size,
            blocks: vec![vec![0u8; block_size as usize]],
            free: BTreeSet::new(),
            allocation_budget: None,
        }
    }

    pub(crate) fn is_free(&self, block: u32) -> bool {
        self.free.contains(&block)
    }

    /// Forget the free list, as a rebuild does.
    pub(crate) fn forget_free_list(&mut self) {
        self.free.clear();
    }

    fn check(&self, block: u32) -> Result<()> {
        if block < FIRST_DATA_BLOCK || block as usize >= self.blocks.len() {
            return Err(Error::invalid_argument(format!("block {} out of range", block)));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn allocate_free_block(&mut self) -> Result<u32> {
        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Io(std::io::Error::other("allocation budget exhausted")));
            }
            *budget -= 1;
        }
        if let Some(block) = self.free.pop_first() {
            return Ok(block);
        }
        self.blocks.push(vec![0u8; self.block_size as usize]);
        Ok(self.blocks.len() as u32 - 1)
    }

    fn free_block(&mut self, block: u32) -> Result<()> {
        self.check(block)?;
        self.free.insert(block);
        Ok(())
    }

    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        self.check(block)?;
        if data.len() > self.block_size as usize {
            return Err(Error::invalid_argument("write larger than a block"));
        }
        let target = &mut self.blocks[block as usize];
        target.fill(0);
        target[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_block(&mut self, block: u32, len: usize) -> Result<Vec<u8>> {
        self.check(block)?;
        let len = len.min(self.block_size as usize);
        Ok(self.blocks[block as usize][..len].to_vec())
    }

    fn block_size(&self) -> u16 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

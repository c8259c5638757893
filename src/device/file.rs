//! File-backed block device.
//!
//! ## File Format
//!
//! ```text
//! data.hfd
//! [Block 0: superblock]   // magic: u32, version: u16, block_size: u16, zero padded
//! [Block 1]
//! ...
//! [Block N-1]
//!
//! data.free
//! [magic: u32][count: u32][block: u32] * count [crc32: u32]
//! ```
//!
//! The free list lives in memory while the device is open and is written out
//! on shutdown. After an unclean shutdown it is stale, so the rebuild opens the
//! device with [`FileBlockDevice::open_for_rebuild`] and recomputes it.

use super::{BlockDevice, FIRST_DATA_BLOCK};
use crate::config::MIN_BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::util::{remove_if_exists, write_atomically};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the data file inside the store directory.
pub const DATA_FILE: &str = "data.hfd";

/// Name of the persisted free list inside the store directory.
pub const FREE_LIST_FILE: &str = "data.free";

const DATA_MAGIC: u32 = 0x4846_4B56; // "HFKV"
const FREE_LIST_MAGIC: u32 = 0x4846_4652; // "HFFR"
const FORMAT_VERSION: u16 = 1;
const SUPERBLOCK_LEN: usize = 8;

/// A block device stored in a single file.
pub struct FileBlockDevice {
    path: PathBuf,
    free_list_path: PathBuf,
    file: Option<File>,
    block_size: u16,
    block_count: u32,
    free: BTreeSet<u32>,
    /// Allocations left before `allocate_free_block` fails.
    #[cfg(test)]
    pub(crate) allocation_budget: Option<usize>,
}

impl FileBlockDevice {
    /// Open or create the data file in `dir`.
    ///
    /// A new file is created with `block_size`; an existing file keeps the
    /// block size stored in its superblock.
    pub fn open<P: AsRef<Path>>(dir: P, block_size: u16) -> Result<Self> {
        Self::open_with(dir.as_ref(), block_size, false)
    }

    /// Open the data file with the persisted free list discarded. Every block
    /// counts as allocated until the caller frees it.
    pub fn open_for_rebuild<P: AsRef<Path>>(dir: P, block_size: u16) -> Result<Self> {
        Self::open_with(dir.as_ref(), block_size, true)
    }

    fn open_with(dir: &Path, requested: u16, discard_free_list: bool) -> Result<Self> {
        let path = dir.join(DATA_FILE);
        let free_list_path = dir.join(FREE_LIST_FILE);

        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let len = file.metadata()?.len();

        let block_size = if len == 0 {
            Self::write_superblock(&mut file, requested)?;
            log::info!("Created data file {:?} with {} byte blocks", path, requested);
            requested
        } else {
            let stored = Self::read_superblock(&mut file, len)?;
            if stored != requested {
                log::warn!(
                    "Data file {:?} uses {} byte blocks, ignoring requested {}",
                    path,
                    stored,
                    requested
                );
            }
            stored
        };

        let file_len = file.metadata()?.len();
        let block_count = file_len.div_ceil(block_size as u64).max(1);
        let block_count = u32::try_from(block_count)
            .map_err(|_| Error::corruption(format!("Data file too large: {} bytes", file_len)))?;

        let free = if discard_free_list {
            if remove_if_exists(&free_list_path)? {
                log::debug!("Discarded free list {:?}", free_list_path);
            }
            BTreeSet::new()
        } else if free_list_path.exists() {
            Self::load_free_list(&free_list_path, block_count)?
        } else {
            BTreeSet::new()
        };

        log::debug!(
            "Opened block device {:?}: {} blocks, {} free",
            path,
            block_count,
            free.len()
        );

        Ok(Self {
            path,
            free_list_path,
            file: Some(file),
            block_size,
            block_count,
            free,
            #[cfg(test)]
            allocation_budget: None,
        })
    }

    fn write_superblock(file: &mut File, block_size: u16) -> Result<()> {
        let mut block = vec![0u8; block_size as usize];
        {
            let mut buf = &mut block[..];
            buf.put_u32_le(DATA_MAGIC);
            buf.put_u16_le(FORMAT_VERSION);
            buf.put_u16_le(block_size);
        }
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&block)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_superblock(file: &mut File, len: u64) -> Result<u16> {
        if len < SUPERBLOCK_LEN as u64 {
            return Err(Error::corruption(format!("Data file too short: {} bytes", len)));
        }

        let mut raw = [0u8; SUPERBLOCK_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;

        let mut cursor = &raw[..];
        let magic = cursor.get_u32_le();
        if magic != DATA_MAGIC {
            return Err(Error::corruption(format!(
                "Invalid data file magic number: expected {:#x}, got {:#x}",
                DATA_MAGIC, magic
            )));
        }
        let version = cursor.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!("Unsupported data file version {}", version)));
        }
        let block_size = cursor.get_u16_le();
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::corruption(format!("Invalid stored block size {}", block_size)));
        }
        Ok(block_size)
    }

    fn load_free_list(path: &Path, block_count: u32) -> Result<BTreeSet<u32>> {
        let data = std::fs::read(path)?;
        if data.len() < 12 {
            return Err(Error::corruption(format!("Free list too short: {} bytes", data.len())));
        }

        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let magic = cursor.get_u32_le();
        if magic != FREE_LIST_MAGIC {
            return Err(Error::corruption(format!("Invalid free list magic number: {:#x}", magic)));
        }
        let count = cursor.get_u32_le() as usize;
        if cursor.remaining() != count * 4 {
            return Err(Error::corruption("Free list length does not match its count"));
        }

        let mut free = BTreeSet::new();
        for _ in 0..count {
            let block = cursor.get_u32_le();
            // The data file may have lost a trailing partial block.
            if block >= FIRST_DATA_BLOCK && block < block_count {
                free.insert(block);
            }
        }
        Ok(free)
    }

    fn save_free_list(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(12 + self.free.len() * 4);
        buf.put_u32_le(FREE_LIST_MAGIC);
        buf.put_u32_le(self.free.len() as u32);
        for &block in &self.free {
            buf.put_u32_le(block);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        write_atomically(&self.free_list_path, &buf)
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `block` is on the free list.
    pub fn is_free(&self, block: u32) -> bool {
        self.free.contains(&block)
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or_else(|| Error::invalid_state("block device is shut down"))
    }

    fn check_data_block(&self, block: u32) -> Result<()> {
        if block < FIRST_DATA_BLOCK || block >= self.block_count {
            return Err(Error::invalid_argument(format!(
                "block {} is outside data blocks {}..{}",
                block, FIRST_DATA_BLOCK, self.block_count
            )));
        }
        Ok(())
    }

    fn offset_of(&self, block: u32) -> u64 {
        block as u64 * self.block_size as u64
    }

    #[cfg(test)]
    fn take_allocation(&mut self) -> Result<()> {
        if let Some(budget) = self.allocation_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Io(io::Error::other("allocation budget exhausted")));
            }
            *budget -= 1;
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn take_allocation(&mut self) -> Result<()> {
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn allocate_free_block(&mut self) -> Result<u32> {
        if self.file.is_none() {
            return Err(Error::invalid_state("block device is shut down"));
        }
        self.take_allocation()?;
        if let Some(block) = self.free.pop_first() {
            return Ok(block);
        }

        let block = self.block_count;
        self.block_count = self
            .block_count
            .checked_add(1)
            .ok_or_else(|| Error::invalid_state("block device is full"))?;
        Ok(block)
    }

    fn free_block(&mut self, block: u32) -> Result<()> {
        self.check_data_block(block)?;
        if !self.free.insert(block) {
            log::warn!("Block {} freed twice", block);
        }
        Ok(())
    }

    fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        let block_size = self.block_size as usize;
        if data.len() > block_size {
            return Err(Error::invalid_argument(format!(
                "{} bytes do not fit in a {} byte block",
                data.len(),
                block_size
            )));
        }
        self.check_data_block(block)?;

        let mut buf = vec![0u8; block_size];
        buf[..data.len()].copy_from_slice(data);

        let offset = self.offset_of(block);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn read_block(&mut self, block: u32, len: usize) -> Result<Vec<u8>> {
        self.check_data_block(block)?;

        let mut buf = vec![0u8; len.min(self.block_size as usize)];
        let offset = self.offset_of(block);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;

        // Short reads past the end of the file leave zeros behind.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn block_size(&self) -> u16 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn sync(&mut self) -> Result<()> {
        self.file_mut()?.sync_data()?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.sync_all()?;
        self.save_free_list()?;
        self.file = None;

        log::debug!("Block device {:?} shut down with {} free blocks", self.path, self.free.len());
        Ok(())
    }
}

//! # hfstore - An Embedded Block-Structured Key-Value Store
//!
//! hfstore keeps variable-size documents in a single data file made of
//! fixed-size blocks. A value longer than one block is spread over a chain of
//! blocks, and every block carries a small header with its key and its place
//! in the chain. That makes the data file self-describing: if the process
//! dies mid-write, the next open scans the file and rebuilds a consistent
//! index from what is physically there.
//!
//! ## Architecture
//!
//! - **Block device** ([`device`]): fixed-size block I/O and the free list
//! - **Key index** ([`index`]): key to first-block mapping
//! - **Records** ([`record`]): block headers and multi-block chains
//! - **Codec** ([`codec`]): bincode serialization and Snappy compression
//! - **Dirty marker** ([`dirty`]): detects unclean shutdowns
//! - **Rebuild** ([`rebuild`]): scan-based recovery at open
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hfstore::{KvStore, Options};
//!
//! # fn main() -> Result<(), hfstore::Error> {
//! let store = KvStore::open("./data", Options::default())?;
//!
//! store.set("user:1", &vec!["alice".to_string(), "admin".to_string()])?;
//! let roles: Option<Vec<String>> = store.get("user:1")?;
//! assert_eq!(roles.map(|r| r.len()), Some(2));
//!
//! store.set_bytes("blob", b"raw bytes")?;
//! assert!(store.delete("blob")?);
//!
//! store.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod codec;
pub mod config;
pub mod device;
pub mod dirty;
pub mod error;
pub mod index;
pub mod rebuild;
pub mod record;
mod util;

// Re-exports
pub use config::{CompressionType, Options, MAX_KEY_LENGTH};
pub use error::{Error, Result};
pub use rebuild::RebuildReport;

use codec::EncodedPayload;
use device::{BlockDevice, FileBlockDevice};
use dirty::DirtyMarker;
use index::{FileKeyIndex, KeyIndex};
use parking_lot::Mutex;
use record::{
    read_record, release_blocks, trace_chain, write_chain, write_tombstone, AllocationBlock,
    RecordFlags,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Point-in-time counters of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of live keys.
    pub keys: usize,
    /// Block size of the data file.
    pub block_size: u16,
    /// Blocks in the data file, including the superblock.
    pub block_count: u32,
    /// Blocks on the free list.
    pub free_blocks: usize,
}

/// The main store handle.
///
/// # Thread Safety
///
/// `KvStore` is `Send + Sync` and can be shared across threads using
/// `Arc<KvStore>`. All operations are serialized by one lock around the
/// block device and the index; encoding and decoding of values happen
/// outside it.
pub struct KvStore {
    /// Store directory path
    path: PathBuf,

    /// Configuration options
    options: Options,

    /// Device, index and session state
    inner: Mutex<Inner>,

    /// Unclean-shutdown marker
    dirty: DirtyMarker,
}

struct Inner {
    device: FileBlockDevice,
    index: FileKeyIndex,
    /// Tombstones written this session, by key.
    tombstones: HashMap<String, u32>,
    /// A mutation failed partway; blocks may be written but unaccounted for.
    needs_rebuild: bool,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state("store is shut down"));
        }
        Ok(())
    }

    /// Remember a failed mutation so that shutdown keeps the dirty marker
    /// and the next open rebuilds.
    fn note_failure<T>(&mut self, result: &Result<T>) {
        if let Err(e) = result {
            if !self.needs_rebuild {
                log::warn!("Mutation failed partway, store will be rebuilt at next open: {}", e);
            }
            self.needs_rebuild = true;
        }
    }

    fn put_record(&mut self, key: &str, payload: &EncodedPayload, sync: bool) -> Result<Vec<u32>> {
        let blocks = write_chain(&mut self.device, key, payload.flags, &payload.bytes)?;
        let previous = self.index.get(key);
        self.index.set(key, blocks[0]);

        if let Some(previous) = previous {
            self.release_chain(key, previous)?;
        }
        self.release_tombstone(key)?;

        if sync {
            self.device.sync()?;
        }
        Ok(blocks)
    }

    fn delete_record(&mut self, key: &str, anchor: u32, sync: bool) -> Result<u32> {
        let tombstone = write_tombstone(&mut self.device, key)?;
        if let Some(stale) = self.tombstones.insert(key.to_string(), tombstone) {
            release_blocks(&mut self.device, &[stale])?;
        }
        self.index.remove(key);
        self.release_chain(key, anchor)?;

        if sync {
            self.device.sync()?;
        }
        Ok(tombstone)
    }

    /// Scrub and free the chain of `key` anchored at `anchor`.
    ///
    /// A damaged chain is released as far as it can be followed; the rest is
    /// left for the next rebuild.
    fn release_chain(&mut self, key: &str, anchor: u32) -> Result<()> {
        let blocks = match AllocationBlock::load(&mut self.device, anchor) {
            Ok(record) if record.key == key => record.blocks,
            Ok(record) => {
                log::warn!(
                    "Block {} holds key {:?} instead of {:?}, not releasing it",
                    anchor,
                    record.key,
                    key
                );
                return Ok(());
            }
            Err(e) if e.is_structural() => {
                let trace = trace_chain(&mut self.device, anchor)?;
                match &trace.head {
                    Some(head) if head.key == key => {}
                    _ => {
                        log::warn!("Block {} no longer holds key {:?}, not releasing it", anchor, key);
                        return Ok(());
                    }
                }
                log::warn!("Releasing damaged chain of key {:?}: {}", key, e);
                trace.blocks
            }
            Err(e) => return Err(e),
        };
        release_blocks(&mut self.device, &blocks)
    }

    fn release_tombstone(&mut self, key: &str) -> Result<()> {
        match self.tombstones.remove(key) {
            Some(block) => release_blocks(&mut self.device, &[block]),
            None => Ok(()),
        }
    }
}

impl KvStore {
    /// Opens a store at the specified directory with the given options.
    ///
    /// If the directory holds a dirty marker, the previous session did not
    /// shut down cleanly and the store is rebuilt from the data file before
    /// this returns. The same happens when the persisted free list or key
    /// index turns out to be corrupt.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are invalid
    /// - The directory is missing and `create_if_missing` is off, or exists
    ///   and `error_if_exists` is on
    /// - The data file is unreadable or a required rebuild fails
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        options.validate()?;

        if !path.exists() {
            if options.create_if_missing {
                std::fs::create_dir_all(&path)?;
            } else {
                return Err(Error::NotFound(format!(
                    "Store directory does not exist: {:?}",
                    path
                )));
            }
        } else if options.error_if_exists {
            return Err(Error::AlreadyExists(format!("Store already exists: {:?}", path)));
        }

        if DirtyMarker::is_present(&path) {
            log::error!(
                "Dirty marker found in {:?}: previous session did not shut down cleanly, rebuilding",
                path
            );
            rebuild::rebuild(&path, &options)?;
        }

        let (device, index) = match Self::open_parts(&path, &options) {
            Ok(parts) => parts,
            Err(e) if e.is_corruption() => {
                log::error!("Store metadata in {:?} is unreadable ({}), rebuilding", path, e);
                DirtyMarker::new(&path).mark()?;
                rebuild::rebuild(&path, &options)?;
                Self::open_parts(&path, &options)?
            }
            Err(e) => return Err(e),
        };

        log::info!(
            "Opened store at {:?}: {} keys, {} blocks of {} bytes",
            path,
            index.count(),
            device.block_count(),
            device.block_size()
        );

        let dirty = DirtyMarker::new(&path);
        Ok(Self {
            path,
            options,
            inner: Mutex::new(Inner {
                device,
                index,
                tombstones: HashMap::new(),
                needs_rebuild: false,
                closed: false,
            }),
            dirty,
        })
    }

    fn open_parts(path: &Path, options: &Options) -> Result<(FileBlockDevice, FileKeyIndex)> {
        let device = FileBlockDevice::open(path, options.block_size)?;
        let index = FileKeyIndex::open(path)?;
        Ok((device, index))
    }

    /// Reads and deserializes the value stored under `key`.
    ///
    /// Returns `None` if the key is absent, or if its record is damaged (the
    /// damage is logged and left for the next rebuild).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the record does not decode as `T`,
    /// including records written with [`KvStore::set_bytes`].
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read(key)? {
            Some((flags, payload)) => Ok(Some(codec::decode_value(flags, payload)?)),
            None => Ok(None),
        }
    }

    /// Reads the stored bytes under `key`, decompressed.
    ///
    /// For a value written with [`KvStore::set`] these are its serialized
    /// form.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(key)? {
            Some((flags, payload)) => Ok(Some(codec::decode_payload(flags, payload)?)),
            None => Ok(None),
        }
    }

    fn read(&self, key: &str) -> Result<Option<(RecordFlags, Vec<u8>)>> {
        check_key(key)?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.check_open()?;

        let Some(anchor) = inner.index.get(key) else {
            return Ok(None);
        };

        match read_record(&mut inner.device, anchor) {
            Ok((record, _)) if record.flags.is_tombstone() => Ok(None),
            Ok((record, _)) if record.key != key => {
                log::error!(
                    "Index entry of key {:?} points at block {} owned by {:?}",
                    key,
                    anchor,
                    record.key
                );
                Ok(None)
            }
            Ok((record, payload)) => Ok(Some((record.flags, payload))),
            Err(e) if e.is_structural() => {
                log::error!("Record of key {:?} at block {} is unreadable: {}", key, anchor, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Serializes `value` and stores it under `key`, replacing any previous
    /// value.
    ///
    /// The new value is written to fresh blocks; the previous value's blocks
    /// are freed only after the index points at the new ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLong`] or [`Error::InvalidArgument`] for a key
    /// outside 1..=255 bytes, without touching the store.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        check_key(key)?;
        let payload = codec::encode_value(value, &self.options)?;
        self.write(key, payload)
    }

    /// Stores raw bytes under `key`, replacing any previous value.
    pub fn set_bytes(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let payload = codec::encode_bytes(value, &self.options)?;
        self.write(key, payload)
    }

    fn write(&self, key: &str, payload: EncodedPayload) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.check_open()?;

        self.dirty.mark()?;

        let result = inner.put_record(key, &payload, self.options.sync_writes);
        inner.note_failure(&result);
        let blocks = result?;

        log::debug!(
            "Set key {:?}: {} bytes in {} blocks from block {}",
            key,
            payload.bytes.len(),
            blocks.len(),
            blocks[0]
        );
        Ok(())
    }

    /// Deletes `key`. Returns `false` if it was not present.
    ///
    /// A tombstone block is written before the index entry goes away, so a
    /// crash at any point cannot bring the value back. The tombstone keeps its
    /// block until the key is set again or the store shuts down, so a session
    /// that deletes many keys grows the data file by one block per key.
    pub fn delete(&self, key: &str) -> Result<bool> {
        check_key(key)?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.check_open()?;

        let Some(anchor) = inner.index.get(key) else {
            return Ok(false);
        };

        self.dirty.mark()?;

        let result = inner.delete_record(key, anchor, self.options.sync_writes);
        inner.note_failure(&result);
        let tombstone = result?;

        log::debug!("Deleted key {:?} (tombstone at block {})", key, tombstone);
        Ok(true)
    }

    /// Whether `key` has an index entry. The record itself is not read.
    pub fn contains(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.index.get(key).is_some())
    }

    /// Number of live keys.
    pub fn count(&self) -> Result<usize> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.index.count())
    }

    /// All live keys in ascending order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.index.list_keys())
    }

    /// Current key and block counters.
    pub fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(StoreStats {
            keys: inner.index.count(),
            block_size: inner.device.block_size(),
            block_count: inner.device.block_count(),
            free_blocks: inner.device.free_count(),
        })
    }

    /// Shuts the store down cleanly.
    ///
    /// Releases this session's tombstones, persists the free list and the
    /// index, and removes the dirty marker. If a mutation failed partway
    /// during the session the marker is kept, so the next open rebuilds and
    /// reclaims whatever the failed write left behind. Calling it again is a
    /// no-op;
    /// every other operation fails with [`Error::InvalidState`] afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.closed {
            return Ok(());
        }

        let tombstones: Vec<u32> = inner.tombstones.drain().map(|(_, block)| block).collect();
        release_blocks(&mut inner.device, &tombstones)?;

        inner.device.shutdown()?;
        inner.index.shutdown()?;
        inner.closed = true;

        if inner.needs_rebuild {
            log::warn!("Keeping dirty marker of {:?} after a failed mutation", self.path);
        } else if self.dirty.is_dirty() {
            self.dirty.clear()?;
        }

        log::info!("Store at {:?} shut down", self.path);
        Ok(())
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Error shutting down store at {:?} during drop: {}", self.path, e);
        }
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::KeyTooLong { len: key.len(), max: MAX_KEY_LENGTH });
    }
    Ok(())
}

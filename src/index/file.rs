//! Key index persisted as a checksummed snapshot.
//!
//! ## File Format
//!
//! ```text
//! keys.idx
//! [bincode(IndexSnapshot { version, entries })][crc32: u32]
//! ```
//!
//! The whole map is rewritten on save, through a temp file and a rename.

use super::KeyIndex;
use crate::error::{Error, Result};
use crate::util::{remove_if_exists, write_atomically};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the index file inside the store directory.
pub const INDEX_FILE: &str = "keys.idx";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    entries: &'a BTreeMap<String, u32>,
}

#[derive(Deserialize)]
struct IndexSnapshot {
    version: u32,
    entries: BTreeMap<String, u32>,
}

/// A `BTreeMap` key index saved to `keys.idx`.
#[derive(Debug)]
pub struct FileKeyIndex {
    path: PathBuf,
    entries: BTreeMap<String, u32>,
    modified: bool,
}

impl FileKeyIndex {
    /// Load the index in `dir`, or start an empty one if there is no file.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(INDEX_FILE);
        let entries = if path.exists() { Self::load(&path)? } else { BTreeMap::new() };

        log::debug!("Opened key index {:?} with {} keys", path, entries.len());
        Ok(Self { path, entries, modified: false })
    }

    /// Start an empty index in `dir`, discarding any existing file.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(INDEX_FILE);
        if remove_if_exists(&path)? {
            log::debug!("Discarded key index {:?}", path);
        }
        // Save even when empty so the discarded file is replaced.
        Ok(Self { path, entries: BTreeMap::new(), modified: true })
    }

    fn load(path: &Path) -> Result<BTreeMap<String, u32>> {
        let data = std::fs::read(path)?;
        if data.len() < 4 {
            return Err(Error::corruption(format!("Key index too short: {} bytes", data.len())));
        }

        let (body, trailer) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let snapshot: IndexSnapshot = bincode::deserialize(body)
            .map_err(|e| Error::corruption(format!("Failed to decode key index: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::corruption(format!(
                "Unsupported key index version {}",
                snapshot.version
            )));
        }
        Ok(snapshot.entries)
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyIndex for FileKeyIndex {
    fn get(&self, key: &str) -> Option<u32> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: &str, anchor: u32) {
        self.entries.insert(key.to_string(), anchor);
        self.modified = true;
    }

    fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.modified |= removed;
        removed
    }

    fn count(&self) -> usize {
        self.entries.len()
    }

    fn list_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn save(&mut self) -> Result<()> {
        if !self.modified {
            return Ok(());
        }

        let snapshot = SnapshotRef { version: SNAPSHOT_VERSION, entries: &self.entries };
        let mut data = bincode::serialize(&snapshot)?;
        let crc = crc32fast::hash(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        write_atomically(&self.path, &data)?;
        self.modified = false;

        log::debug!("Saved key index {:?} with {} keys", self.path, self.entries.len());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.save()
    }
}

//! Key index: maps each live key to the anchor block of its record.
//!
//! The engine only relies on the [`KeyIndex`] contract. [`FileKeyIndex`] is
//! the persisted implementation used by [`crate::KvStore`]; a plain
//! `BTreeMap<String, u32>` serves as a volatile one.

mod file;

pub use file::{FileKeyIndex, INDEX_FILE};

use crate::error::Result;
use std::collections::BTreeMap;

/// Ordered mapping from key to anchor block.
pub trait KeyIndex {
    /// Anchor block of `key`, if indexed.
    fn get(&self, key: &str) -> Option<u32>;

    /// Point `key` at `anchor`, replacing any previous entry.
    fn set(&mut self, key: &str, anchor: u32);

    /// Remove `key`. Returns whether it was present.
    fn remove(&mut self, key: &str) -> bool;

    /// Number of indexed keys.
    fn count(&self) -> usize;

    /// All keys in ascending order.
    fn list_keys(&self) -> Vec<String>;

    /// Persist pending changes.
    fn save(&mut self) -> Result<()>;

    /// Persist and release the index.
    fn shutdown(&mut self) -> Result<()>;
}

impl KeyIndex for BTreeMap<String, u32> {
    fn get(&self, key: &str) -> Option<u32> {
        BTreeMap::get(self, key).copied()
    }

    fn set(&mut self, key: &str, anchor: u32) {
        self.insert(key.to_string(), anchor);
    }

    fn remove(&mut self, key: &str) -> bool {
        BTreeMap::remove(self, key).is_some()
    }

    fn count(&self) -> usize {
        self.len()
    }

    fn list_keys(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn save(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Dirty-state tracking.
//!
//! A marker file in the store directory says "the data file may not match
//! the index". It is created right before the first mutation after a clean
//! open and removed only by a clean shutdown. Finding it at open means the
//! previous session ended without one, and the store is rebuilt.

use crate::error::Result;
use crate::util::remove_if_exists;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the marker file inside the store directory.
pub const DIRTY_FILENAME: &str = "DIRTY";

/// The dirty marker of one store directory.
#[derive(Debug)]
pub struct DirtyMarker {
    path: PathBuf,
    dirty: Mutex<bool>,
}

impl DirtyMarker {
    /// Tracker for the marker in `dir`, picking up a marker already on disk.
    pub fn new(dir: &Path) -> Self {
        let path = dir.join(DIRTY_FILENAME);
        let dirty = path.exists();
        Self { path, dirty: Mutex::new(dirty) }
    }

    /// Whether a marker file exists in `dir`.
    pub fn is_present(dir: &Path) -> bool {
        dir.join(DIRTY_FILENAME).exists()
    }

    /// Ensure the marker exists. Only the first call after a clean state
    /// touches the filesystem.
    pub fn mark(&self) -> Result<()> {
        let mut dirty = self.dirty.lock();
        if *dirty {
            return Ok(());
        }

        let mut file = File::create(&self.path)?;
        file.write_all(b"dirty")?;
        file.sync_all()?;
        *dirty = true;

        log::debug!("Created dirty marker {:?}", self.path);
        Ok(())
    }

    /// Remove the marker after a clean shutdown.
    pub fn clear(&self) -> Result<()> {
        let mut dirty = self.dirty.lock();
        remove_if_exists(&self.path)?;
        *dirty = false;
        Ok(())
    }

    /// Whether the store is currently marked dirty.
    pub fn is_dirty(&self) -> bool {
        *self.dirty.lock()
    }

    /// Path of the marker file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

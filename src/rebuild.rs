//! Rebuild after an unclean shutdown.
//!
//! The data file is the only source of truth: the persisted free list and
//! key index are discarded, and both are reconstructed by scanning every
//! block for chain heads and walking their chains.
//!
//! ## Scan
//!
//! 1. Pass 1 visits blocks in order. A block that decodes as a chain head is
//!    walked; a block whose sequence number is not 0 may be the continuation
//!    of a head further on and is put aside; anything else is unusable.
//! 2. Pass 2 releases the put-aside blocks no chain claimed (orphans).
//! 3. Keys with a tombstone lose their recovered chain.
//! 4. Surviving chains go into the index. Every other block is scrubbed, if
//!    not already blank, and freed.
//!
//! A torn chain (one that fails partway) never replaces a complete chain of
//! the same key, so a crash during an overwrite leaves the old value.

use crate::config::Options;
use crate::device::{BlockDevice, FileBlockDevice, FIRST_DATA_BLOCK};
use crate::dirty::DIRTY_FILENAME;
use crate::error::Result;
use crate::index::{FileKeyIndex, KeyIndex};
use crate::record::{is_blank, trace_chain, BlockHeader, HeaderMismatch, HEADER_READ_LEN};
use crate::util::remove_if_exists;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// What a rebuild found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Blocks examined as potential chain heads.
    pub blocks_scanned: u32,
    /// Chains that made it into the index.
    pub chains_recovered: usize,
    /// Complete chains dropped because a later chain had the same key.
    pub superseded: usize,
    /// Chains that failed a structural check partway.
    pub torn: usize,
    /// Tombstone blocks found.
    pub tombstones: usize,
    /// Continuation blocks with no head.
    pub orphans: usize,
    /// Blocks returned to the free list.
    pub freed: usize,
}

/// Rebuild the store in `dir` and remove its dirty marker.
///
/// The index and device are always saved and closed, even if the scan fails.
/// The marker is only removed when every step succeeded, so a failed rebuild
/// is retried at the next open.
pub fn rebuild(dir: &Path, options: &Options) -> Result<RebuildReport> {
    log::info!("Rebuilding store at {:?}", dir);

    let mut device = FileBlockDevice::open_for_rebuild(dir, options.block_size)?;
    let mut index = match FileKeyIndex::create(dir) {
        Ok(index) => index,
        Err(e) => {
            if let Err(close_err) = device.shutdown() {
                log::error!("Failed to close block device after rebuild error: {}", close_err);
            }
            return Err(e);
        }
    };

    let scanned = scan(&mut device, &mut index);
    let index_closed = index.shutdown();
    let device_closed = device.shutdown();

    if let Err(e) = &scanned {
        log::error!("Rebuild scan of {:?} failed: {}", dir, e);
    }
    if let Err(e) = &index_closed {
        log::error!("Failed to save rebuilt key index: {}", e);
    }
    if let Err(e) = &device_closed {
        log::error!("Failed to close block device after rebuild: {}", e);
    }

    let report = scanned?;
    index_closed?;
    device_closed?;

    remove_if_exists(&dir.join(DIRTY_FILENAME))?;

    log::info!(
        "Rebuild complete: {} chains recovered, {} torn, {} superseded, {} tombstones, {} orphans, {} blocks freed",
        report.chains_recovered,
        report.torn,
        report.superseded,
        report.tombstones,
        report.orphans,
        report.freed
    );
    Ok(report)
}

/// Reconstruct `index` and the free list of `device` from the blocks alone.
///
/// `device` must come up with an empty free list and `index` empty.
pub fn scan<D, I>(device: &mut D, index: &mut I) -> Result<RebuildReport>
where
    D: BlockDevice + ?Sized,
    I: KeyIndex + ?Sized,
{
    let block_count = device.block_count();
    let mut report = RebuildReport::default();

    let mut visited = vec![false; block_count as usize];
    let mut blank = vec![false; block_count as usize];
    let mut candidates = Vec::new();
    let mut recovered: HashMap<String, Vec<u32>> = HashMap::new();
    let mut deleted: HashSet<String> = HashSet::new();

    for block in FIRST_DATA_BLOCK..block_count {
        if visited[block as usize] {
            continue;
        }
        report.blocks_scanned += 1;

        let raw = device.read_block(block, HEADER_READ_LEN)?;
        match BlockHeader::decode(&raw, 0) {
            Ok(_) => {}
            Err(HeaderMismatch::Sequence { .. }) => {
                candidates.push(block);
                continue;
            }
            Err(_) => {
                visited[block as usize] = true;
                blank[block as usize] = is_blank(&raw);
                continue;
            }
        }

        let trace = trace_chain(device, block)?;
        for &b in &trace.blocks {
            visited[b as usize] = true;
        }
        let Some(head) = trace.head else {
            continue;
        };

        if let Some(fault) = trace.fault {
            log::warn!("Torn chain for key {:?} at block {}: {}", head.key, block, fault);
            report.torn += 1;
            continue;
        }

        if head.flags.is_tombstone() {
            log::debug!("Tombstone for key {:?} at block {}", head.key, block);
            report.tombstones += 1;
            deleted.insert(head.key);
            continue;
        }

        let anchor = block;
        if let Some(previous) = recovered.insert(head.key.clone(), trace.blocks) {
            log::warn!(
                "Key {:?} has chains at blocks {} and {}, keeping block {}",
                head.key,
                previous[0],
                anchor,
                anchor
            );
            report.superseded += 1;
        }
    }

    for block in candidates {
        if !visited[block as usize] {
            visited[block as usize] = true;
            log::warn!("Orphaned continuation block {}", block);
            report.orphans += 1;
        }
    }

    for key in &deleted {
        if recovered.remove(key).is_some() {
            log::debug!("Dropping recovered chain of deleted key {:?}", key);
        }
    }

    let mut live = vec![false; block_count as usize];
    for (key, blocks) in &recovered {
        for &b in blocks {
            live[b as usize] = true;
        }
        index.set(key, blocks[0]);
    }
    report.chains_recovered = recovered.len();

    let mut free = Vec::new();
    for block in FIRST_DATA_BLOCK..block_count {
        if live[block as usize] {
            continue;
        }
        if !blank[block as usize] {
            device.write_block(block, &[])?;
        }
        free.push(block);
    }
    device.free_blocks(&free)?;
    report.freed = free.len();

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryBlockDevice;
    use crate::record::{read_record, write_chain, write_tombstone, RecordFlags};
    use std::collections::BTreeMap;

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    fn write(device: &mut MemoryBlockDevice, key: &str, data: &[u8]) -> Vec<u32> {
        write_chain(device, key, RecordFlags::default(), data).unwrap()
    }

    #[test]
    fn test_recovers_intact_chains() {
        let mut device = MemoryBlockDevice::new(512);
        let a = write(&mut device, "a", &payload(1200, 1));
        let b = write(&mut device, "b", b"small");
        device.allocate_free_block().unwrap();
        device.forget_free_list();

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.chains_recovered, 2);
        assert_eq!(report.freed, 1);
        assert_eq!(KeyIndex::get(&index, "a"), Some(a[0]));
        assert_eq!(KeyIndex::get(&index, "b"), Some(b[0]));
        assert_eq!(read_record(&mut device, a[0]).unwrap().1, payload(1200, 1));
        assert_eq!(device.free_count(), 1);
    }

    #[test]
    fn test_continuation_before_head() {
        let mut device = MemoryBlockDevice::new(512);
        device.allocate_free_block().unwrap();
        device.allocate_free_block().unwrap();

        // Head in block 2, continuation in block 1.
        let mut head = BlockHeader::new("k", RecordFlags::default(), 600);
        head.next = 1;
        let mut raw = head.encode();
        raw.extend_from_slice(&payload(512 - 16, 0));
        device.write_block(2, &raw).unwrap();

        let mut tail = head.clone();
        tail.sequence = 1;
        tail.next = 0;
        let mut raw = tail.encode();
        raw.extend_from_slice(&payload(600 - 496, 9));
        device.write_block(1, &raw).unwrap();

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.chains_recovered, 1);
        assert_eq!(report.orphans, 0);
        assert_eq!(KeyIndex::get(&index, "k"), Some(2));
        assert_eq!(device.free_count(), 0);
        assert_eq!(read_record(&mut device, 2).unwrap().1.len(), 600);
    }

    #[test]
    fn test_torn_chain_keeps_previous_value() {
        let mut device = MemoryBlockDevice::new(512);
        let old = write(&mut device, "k", b"old value");

        device.allocation_budget = Some(2);
        assert!(write_chain(&mut device, "k", RecordFlags::default(), &payload(1400, 3)).is_err());
        device.allocation_budget = None;

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.torn, 1);
        assert_eq!(report.chains_recovered, 1);
        assert_eq!(KeyIndex::get(&index, "k"), Some(old[0]));
        assert_eq!(read_record(&mut device, old[0]).unwrap().1, b"old value");
        assert!(device.is_free(2) && device.is_free(3));
        assert!(is_blank(&device.read_block(2, 32).unwrap()));
    }

    #[test]
    fn test_tombstone_drops_chain() {
        let mut device = MemoryBlockDevice::new(512);
        let data = write(&mut device, "gone", &payload(900, 5));
        let tombstone = write_tombstone(&mut device, "gone").unwrap();
        write(&mut device, "kept", b"v");

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.tombstones, 1);
        assert_eq!(report.chains_recovered, 1);
        assert_eq!(KeyIndex::get(&index, "gone"), None);
        for block in data.iter().copied().chain(std::iter::once(tombstone)) {
            assert!(device.is_free(block));
            assert!(is_blank(&device.read_block(block, 32).unwrap()));
        }
    }

    #[test]
    fn test_later_complete_chain_wins() {
        let mut device = MemoryBlockDevice::new(512);
        let first = write(&mut device, "k", b"first");
        let second = write(&mut device, "k", b"second");

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.superseded, 1);
        assert_eq!(KeyIndex::get(&index, "k"), Some(second[0]));
        assert!(device.is_free(first[0]));
    }

    #[test]
    fn test_orphans_are_released() {
        let mut device = MemoryBlockDevice::new(512);
        let blocks = write(&mut device, "k", &payload(1400, 7));
        device.write_block(blocks[0], &[]).unwrap();

        let mut index: BTreeMap<String, u32> = BTreeMap::new();
        let report = scan(&mut device, &mut index).unwrap();

        assert_eq!(report.orphans, 2);
        assert_eq!(report.chains_recovered, 0);
        assert_eq!(index.count(), 0);
        assert_eq!(device.free_count(), 3);
        assert!(is_blank(&device.read_block(blocks[2], 32).unwrap()));
    }
}

// Crash Recovery Tests for hfstore
// These tests verify the rebuild that runs after an unclean shutdown

use hfstore::codec::encode_value;
use hfstore::device::{BlockDevice, FileBlockDevice, DATA_FILE};
use hfstore::index::INDEX_FILE;
use hfstore::record::{write_chain, BlockHeader, RecordFlags};
use hfstore::{rebuild, KvStore, Options};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Simulate a crash by leaking the store so no shutdown runs
fn simulate_crash(store: KvStore) {
    std::mem::forget(store);
}

fn mark_dirty(path: &Path) {
    fs::write(path.join("DIRTY"), b"dirty").unwrap();
}

/// Test recovery after a crash following many writes
#[test]
fn test_recovery_after_write_crash() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        for i in 0..100 {
            store.set(&format!("key_{}", i), &format!("value_{}", i).repeat(i % 300 + 1)).unwrap();
        }
        simulate_crash(store);
    }
    assert!(path.join("DIRTY").exists());

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert!(!path.join("DIRTY").exists());
    assert_eq!(store.count().unwrap(), 100);
    for i in 0..100 {
        assert_eq!(
            store.get::<String>(&format!("key_{}", i)).unwrap(),
            Some(format!("value_{}", i).repeat(i % 300 + 1)),
            "key_{} should be recovered",
            i
        );
    }
}

/// Test that a torn overwrite leaves the previous value in place
#[test]
fn test_torn_overwrite_keeps_old_value() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    let old = "old value".repeat(500);
    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("doc", &old).unwrap();
        store.shutdown().unwrap();
    }

    // A new chain whose head made it to disk but whose continuation did not.
    {
        let mut device = FileBlockDevice::open(&path, 2048).unwrap();
        let head = device.allocate_free_block().unwrap();
        let tail = device.allocate_free_block().unwrap();
        let mut header =
            BlockHeader::new("doc", RecordFlags::default().with(RecordFlags::SERIALIZED), 6000);
        header.next = tail;
        device.write_block(head, &header.encode()).unwrap();
        device.shutdown().unwrap();
    }
    mark_dirty(&path);

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.get::<String>("doc").unwrap(), Some(old));

    let stats = store.stats().unwrap();
    let live_blocks = stats.block_count as usize - 1 - stats.free_blocks;
    assert_eq!(live_blocks, 3, "torn blocks should be back on the free list");
}

/// Test that a complete but unindexed new chain yields old or new, never a mix
#[test]
fn test_unindexed_complete_chain() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    let old = vec![1u8; 5000];
    let new = vec![2u8; 5000];
    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("doc", &old).unwrap();
        store.shutdown().unwrap();
    }

    {
        let mut device = FileBlockDevice::open(&path, 2048).unwrap();
        let payload = encode_value(&new, &Options::default()).unwrap();
        write_chain(&mut device, "doc", payload.flags, &payload.bytes).unwrap();
        device.shutdown().unwrap();
    }
    mark_dirty(&path);

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["doc"]);
    let value = store.get::<Vec<u8>>("doc").unwrap().unwrap();
    assert!(value == old || value == new, "value must not be a hybrid");
}

/// Test that deleted keys stay deleted after a crash
#[test]
fn test_tombstone_excluded_after_crash() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("keep", "kept").unwrap();
        store.set_bytes("gone", &vec![5u8; 7000]).unwrap();
        store.shutdown().unwrap();
    }
    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        assert!(store.delete("gone").unwrap());
        simulate_crash(store);
    }

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert!(!store.contains("gone").unwrap());
    assert_eq!(store.get_bytes("gone").unwrap(), None);
    assert_eq!(store.get::<String>("keep").unwrap(), Some("kept".to_string()));

    // Only the block of "keep" is in use: no orphaned data or tombstone blocks.
    let stats = store.stats().unwrap();
    assert_eq!(stats.free_blocks, stats.block_count as usize - 2);
}

/// Test delete followed by set of the same key before a crash
#[test]
fn test_set_after_delete_then_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("k", &1u32).unwrap();
        store.delete("k").unwrap();
        store.set("k", &2u32).unwrap();
        simulate_crash(store);
    }

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert_eq!(store.get::<u32>("k").unwrap(), Some(2));
}

/// Test that repeated crashes and rebuilds converge on the same state
#[test]
fn test_repeated_crashes_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        for i in 0..20 {
            store.set_bytes(&format!("k{:02}", i), &vec![i as u8; 3000]).unwrap();
        }
        for i in (0..20).step_by(3) {
            store.delete(&format!("k{:02}", i)).unwrap();
        }
        simulate_crash(store);
    }

    let mut snapshots = Vec::new();
    for _ in 0..3 {
        let store = KvStore::open(&path, Options::default()).unwrap();
        // Force the marker back so the next open rebuilds again.
        store.set_bytes("k01", &vec![1u8; 3000]).unwrap();
        snapshots.push((store.keys().unwrap(), store.stats().unwrap()));
        simulate_crash(store);
    }

    assert_eq!(snapshots[0].0.len(), 13);
    assert!(snapshots.windows(2).all(|w| w[0].0 == w[1].0));
    assert_eq!(snapshots[1].1.block_count, snapshots[2].1.block_count);
}

/// Test that a corrupted index file is repaired by a rebuild at open
#[test]
fn test_corrupted_index_triggers_rebuild() {
    env_logger::try_init().ok();
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("a", "alpha").unwrap();
        store.set("b", "beta").unwrap();
        store.shutdown().unwrap();
    }

    let index_path = path.join(INDEX_FILE);
    let mut raw = fs::read(&index_path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    fs::write(&index_path, &raw).unwrap();

    let store = KvStore::open(&path, Options::default()).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
    assert_eq!(store.get::<String>("b").unwrap(), Some("beta".to_string()));
    assert!(!path.join("DIRTY").exists());
}

/// Test that a failed rebuild keeps the marker for the next attempt
#[test]
fn test_failed_rebuild_keeps_marker() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set("k", "v").unwrap();
        simulate_crash(store);
    }

    let data_path = path.join(DATA_FILE);
    let mut raw = fs::read(&data_path).unwrap();
    raw[0] ^= 0xFF;
    fs::write(&data_path, &raw).unwrap();

    assert!(KvStore::open(&path, Options::default()).is_err());
    assert!(path.join("DIRTY").exists());
}

/// Test the rebuild report of a direct rebuild
#[test]
fn test_rebuild_report() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().to_path_buf();

    {
        let store = KvStore::open(&path, Options::default()).unwrap();
        store.set_bytes("a", &vec![1u8; 5000]).unwrap();
        store.set_bytes("b", b"b").unwrap();
        store.delete("b").unwrap();
        simulate_crash(store);
    }

    let report = rebuild::rebuild(&path, &Options::default()).unwrap();
    assert_eq!(report.chains_recovered, 1);
    assert_eq!(report.tombstones, 1);
    assert_eq!(report.torn, 0);
    assert_eq!(report.orphans, 0);
    assert!(!path.join("DIRTY").exists());
}

//! Pending I/O: operations on records evicted from memory go through the
//! fetch/complete_pending cycle.

use std::collections::HashMap;

use hybridkv::config::StoreConfig;
use hybridkv::device::{FileDevice, MemoryDevice, StorageDevice};
use hybridkv::status::{OperationType, Status};
use hybridkv::store::{HybridKv, Session, SimpleFunctions};

type SimpleStore<D> = HybridKv<u64, u64, SimpleFunctions<u64, u64>, D>;

/// Two 4 KiB frames: a thousand 24-byte records span six pages, so the
/// oldest pages must be flushed and evicted while inserting.
fn tiny_config() -> StoreConfig {
    StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(12)
        .with_memory_size_bits(13)
}

fn fill<D: StorageDevice>(session: &mut Session<'_, u64, u64, SimpleFunctions<u64, u64>, D>) {
    for key in 1u64..=1000 {
        session.upsert(&key, &(key * 2)).unwrap();
    }
}

#[test]
fn eviction_forces_pending_read() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(tiny_config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    let stats = store.log_stats();
    assert!(stats.head_address > stats.begin_address);

    // Key 500 landed on an evicted page.
    assert_eq!(session.read(&500), Err(Status::Pending));
    assert_eq!(session.pending_count(), 1);

    let completed = session.complete_pending(true);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].op, OperationType::Read);
    assert_eq!(completed[0].status, Status::Ok);
    assert_eq!(completed[0].output, Some(1000));
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn batch_of_pending_reads_resolves() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(tiny_config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    let mut expected: HashMap<u64, u64> = HashMap::new();
    for key in [3u64, 77, 250, 401, 555] {
        match session.read(&key) {
            Ok(value) => assert_eq!(value, key * 2),
            Err(Status::Pending) => {
                expected.insert(session.serial(), key * 2);
            }
            Err(status) => panic!("read({key}) failed: {status}"),
        }
    }
    assert!(!expected.is_empty());

    for op in session.complete_pending(true) {
        assert_eq!(op.status, Status::Ok);
        assert_eq!(op.output, Some(expected[&op.serial]));
    }
}

#[test]
fn resident_keys_read_without_pending() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(tiny_config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    // The most recent keys are still on in-memory pages.
    assert_eq!(session.read(&1000), Ok(2000));
    assert_eq!(session.read(&999), Ok(1998));
}

#[test]
fn delete_of_on_disk_record_appends_tombstone() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(tiny_config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    // Deletes never go pending, even when the record lives on disk.
    session.delete(&10).unwrap();
    // The tombstone at the tail answers the read without a fetch.
    assert_eq!(session.read(&10), Err(Status::NotFound));
}

#[test]
fn rmw_of_on_disk_record_goes_pending() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(tiny_config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    assert_eq!(session.rmw(&10, &7777), Err(Status::Pending));
    let completed = session.complete_pending(true);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].op, OperationType::Rmw);
    assert_eq!(completed[0].status, Status::Ok);

    // The merged record was appended at the tail and reads back directly.
    assert_eq!(session.read(&10), Ok(7777));
}

#[test]
fn pending_read_from_file_device() {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::new(dir.path(), "log", 1 << 20).unwrap();
    let store: SimpleStore<FileDevice> =
        HybridKv::new(tiny_config(), device, SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    fill(&mut session);

    assert_eq!(session.read(&123), Err(Status::Pending));
    let completed = session.complete_pending(true);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, Status::Ok);
    assert_eq!(completed[0].output, Some(246));
}

//! Fold-over checkpoints and explicit flushes.

use std::sync::{Arc, Mutex};

use hybridkv::address::Address;
use hybridkv::config::StoreConfig;
use hybridkv::device::{FileDevice, MemoryDevice};
use hybridkv::store::{HybridKv, SimpleFunctions};

type SimpleStore<D> = HybridKv<u64, u64, SimpleFunctions<u64, u64>, D>;

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(14)
        .with_memory_size_bits(22)
}

#[test]
fn checkpoint_bumps_the_version() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=100 {
        session.upsert(&key, &key).unwrap();
    }

    let first = store.checkpoint().unwrap();
    assert_eq!(first.version, 2);
    // Everything written before the checkpoint is on the device.
    let stats = store.log_stats();
    assert!(stats.flushed_until_address >= stats.read_only_address);

    session.refresh();
    for key in 101u64..=200 {
        session.upsert(&key, &key).unwrap();
    }
    let second = store.checkpoint().unwrap();
    assert_eq!(second.version, 3);
    assert_ne!(first.token, second.token);
}

#[test]
fn operations_continue_across_a_checkpoint() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=50 {
        session.upsert(&key, &key).unwrap();
    }
    store.checkpoint().unwrap();
    session.refresh();

    // Updates after the fold-over produce new-version records; reads see
    // the latest value either way.
    for key in 1u64..=50 {
        session.upsert(&key, &(key + 100)).unwrap();
    }
    for key in 1u64..=50 {
        assert_eq!(session.read(&key), Ok(key + 100));
    }
}

#[test]
fn checkpoint_flushes_to_a_file_device() {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::new(dir.path(), "log", 1 << 20).unwrap();
    let store: SimpleStore<FileDevice> =
        HybridKv::new(config(), device, SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=100 {
        session.upsert(&key, &(key * 7)).unwrap();
    }

    store.checkpoint().unwrap();
    // The sealed pages landed in the first segment file.
    assert!(dir.path().join("log.0").exists());
    drop(session);
}

#[test]
fn flush_is_idempotent() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=100 {
        session.upsert(&key, &key).unwrap();
    }

    let first = store.flush(true).unwrap();
    let flushed = store.log_stats().flushed_until_address;
    let second = store.flush(true).unwrap();
    assert_eq!(first, second);
    assert_eq!(store.log_stats().flushed_until_address, flushed);
    assert_eq!(store.log_stats().tail_address, first);
}

#[test]
fn sealed_ranges_reach_the_subscriber() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let ranges: Arc<Mutex<Vec<(Address, Address)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ranges);
    store.subscribe_read_only(move |old, new| {
        sink.lock().unwrap().push((old, new));
    });

    let mut session = store.start_session();
    for key in 1u64..=200 {
        session.upsert(&key, &key).unwrap();
    }
    let sealed = store.flush(true).unwrap();
    session.refresh();

    let ranges = ranges.lock().unwrap();
    assert!(!ranges.is_empty());
    for (old, new) in ranges.iter() {
        assert!(old < new);
    }
    // The last notification reaches the sealed tail.
    assert_eq!(ranges.last().unwrap().1, sealed);
}

#[test]
fn boundaries_stay_ordered() {
    let store: SimpleStore<MemoryDevice> =
        HybridKv::new(config(), MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=500 {
        session.upsert(&key, &key).unwrap();
        if key % 100 == 0 {
            store.flush(false).unwrap();
            session.refresh();
        }
        let stats = store.log_stats();
        assert!(stats.begin_address <= stats.safe_head_address);
        assert!(stats.safe_head_address <= stats.head_address);
        assert!(stats.head_address <= stats.flushed_until_address);
        assert!(stats.flushed_until_address <= stats.safe_read_only_address);
        assert!(stats.safe_read_only_address <= stats.read_only_address);
        assert!(stats.read_only_address <= stats.tail_address);
    }
}

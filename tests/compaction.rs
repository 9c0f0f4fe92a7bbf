//! Online compaction of the cold log prefix.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hybridkv::address::Address;
use hybridkv::config::StoreConfig;
use hybridkv::device::{IoFuture, MemoryDevice, StorageDevice};
use hybridkv::status::Status;
use hybridkv::store::{HybridKv, Session, SimpleFunctions};

type SimpleStore = HybridKv<u64, u64, SimpleFunctions<u64, u64>, MemoryDevice>;

/// 512-byte pages, two frames: everything but the newest pages is on disk.
fn create_store() -> SimpleStore {
    let config = StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(9)
        .with_memory_size_bits(10);
    HybridKv::new(config, MemoryDevice::new(), SimpleFunctions::new()).unwrap()
}

fn read_resolved<D: StorageDevice>(
    session: &mut Session<'_, u64, u64, SimpleFunctions<u64, u64>, D>,
    key: u64,
) -> Option<u64> {
    match session.read(&key) {
        Ok(value) => Some(value),
        Err(Status::NotFound) => None,
        Err(Status::Pending) => {
            let completed = session.complete_pending(true);
            assert_eq!(completed.len(), 1);
            match completed[0].status {
                Status::Ok => completed[0].output,
                Status::NotFound => None,
                status => panic!("pending read({key}) failed: {status}"),
            }
        }
        Err(status) => panic!("read({key}) failed: {status}"),
    }
}

#[test]
fn compaction_preserves_the_final_state() {
    let store = create_store();
    let mut session = store.start_session();
    for key in 1u64..=300 {
        session.upsert(&key, &key).unwrap();
    }
    for key in 100u64..=150 {
        session.upsert(&key, &(key + 1000)).unwrap();
    }
    for key in 200u64..=250 {
        session.delete(&key).unwrap();
    }
    store.flush(true).unwrap();
    session.refresh();

    // Pages 0..3 hold the records of keys 1..=60, none of them superseded.
    let until = Address::new(3, 0);
    let stats = store.compact(until, &mut session).unwrap();
    assert_eq!(stats.records_scanned, 60);
    assert_eq!(stats.records_copied, 60);
    assert_eq!(stats.new_begin_address, until);
    assert_eq!(store.log_stats().begin_address, until);

    session.refresh();
    for key in 1u64..=300 {
        let expected = match key {
            100..=150 => Some(key + 1000),
            200..=250 => None,
            _ => Some(key),
        };
        assert_eq!(read_resolved(&mut session, key), expected, "key {key}");
    }
}

#[test]
fn compaction_drops_superseded_records() {
    let store = create_store();
    let mut session = store.start_session();
    for key in 1u64..=60 {
        session.upsert(&key, &1).unwrap();
    }
    // Push the first versions well past the mutable region, then overwrite
    // every key; the prefix holds only stale versions.
    for filler in 0u64..400 {
        session.upsert(&(10_000 + filler), &0).unwrap();
    }
    for key in 1u64..=60 {
        session.upsert(&key, &2).unwrap();
    }
    store.flush(true).unwrap();
    session.refresh();

    let until = Address::new(3, 0);
    let tail_before = store.log_stats().tail_address;
    let stats = store.compact(until, &mut session).unwrap();
    // Nothing survived the prefix unsuperseded, so the tail did not grow.
    assert_eq!(stats.records_copied, 0);
    assert_eq!(store.log_stats().tail_address, tail_before);

    session.refresh();
    for key in 1u64..=60 {
        assert_eq!(read_resolved(&mut session, key), Some(2), "key {key}");
    }
}

/// Memory device whose reads fail while the flag is raised.
struct FlakyDevice {
    inner: MemoryDevice,
    fail_reads: Arc<AtomicBool>,
}

impl StorageDevice for FlakyDevice {
    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> IoFuture<'a, usize> {
        self.inner.write(offset, data)
    }

    fn read(&self, offset: u64, length: u32) -> IoFuture<'_, Vec<u8>> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Box::pin(async {
                Err(io::Error::new(io::ErrorKind::Other, "injected device failure"))
            });
        }
        self.inner.read(offset, length)
    }

    fn sync(&self) -> IoFuture<'_, ()> {
        self.inner.sync()
    }

    fn truncate_until(&self, offset: u64) -> IoFuture<'_, ()> {
        self.inner.truncate_until(offset)
    }
}

#[test]
fn compaction_keeps_the_prefix_when_a_fetch_fails() {
    let fail_reads = Arc::new(AtomicBool::new(false));
    let device = FlakyDevice {
        inner: MemoryDevice::new(),
        fail_reads: Arc::clone(&fail_reads),
    };
    let config = StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(9)
        .with_memory_size_bits(10);
    let store: HybridKv<u64, u64, SimpleFunctions<u64, u64>, FlakyDevice> =
        HybridKv::new(config, device, SimpleFunctions::new()).unwrap();
    let mut session = store.start_session();
    for key in 1u64..=300 {
        session.upsert(&key, &key).unwrap();
    }
    store.flush(true).unwrap();
    session.refresh();

    let begin = store.log_stats().begin_address;
    fail_reads.store(true, Ordering::Release);
    let result = store.compact(Address::new(3, 0), &mut session);
    assert_eq!(result.unwrap_err(), Status::IoError);
    // An unreadable prefix is never truncated: every record survives.
    assert_eq!(store.log_stats().begin_address, begin);

    fail_reads.store(false, Ordering::Release);
    session.refresh();
    for key in [1u64, 150, 300] {
        assert_eq!(read_resolved(&mut session, key), Some(key), "key {key}");
    }
}

#[test]
fn compaction_of_an_empty_prefix_is_a_no_op() {
    let store = create_store();
    let mut session = store.start_session();
    session.upsert(&1, &1).unwrap();

    let begin = store.log_stats().begin_address;
    let stats = store.compact(begin, &mut session).unwrap();
    assert_eq!(stats.records_scanned, 0);
    assert_eq!(stats.records_copied, 0);
    assert_eq!(store.log_stats().begin_address, begin);
}

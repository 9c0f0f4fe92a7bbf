//! Online hash-index growth.

use hybridkv::config::StoreConfig;
use hybridkv::device::MemoryDevice;
use hybridkv::status::Status;
use hybridkv::store::{HybridKv, SimpleFunctions};

type SimpleStore = HybridKv<u64, u64, SimpleFunctions<u64, u64>, MemoryDevice>;

fn create_store(table_size: u64, page_bits: u32, memory_bits: u32) -> SimpleStore {
    let config = StoreConfig::default()
        .with_table_size(table_size)
        .with_page_size_bits(page_bits)
        .with_memory_size_bits(memory_bits);
    HybridKv::new(config, MemoryDevice::new(), SimpleFunctions::new()).unwrap()
}

#[test]
fn grow_doubles_the_table() {
    let store = create_store(256, 14, 22);
    let mut session = store.start_session();
    for key in 1u64..=2000 {
        session.upsert(&key, &key).unwrap();
    }

    assert_eq!(store.grow_index().unwrap(), 512);
    assert_eq!(store.stats().index.table_size, 512);

    session.refresh();
    for key in 1u64..=2000 {
        assert_eq!(session.read(&key), Ok(key));
    }
}

#[test]
fn grow_twice() {
    let store = create_store(128, 14, 22);
    let mut session = store.start_session();
    for key in 1u64..=500 {
        session.upsert(&key, &(key + 7)).unwrap();
    }
    assert_eq!(store.grow_index().unwrap(), 256);
    session.refresh();
    assert_eq!(store.grow_index().unwrap(), 512);
    session.refresh();
    for key in 1u64..=500 {
        assert_eq!(session.read(&key), Ok(key + 7));
    }
}

#[test]
fn grow_rehashes_on_disk_chains() {
    // Small ring: most chains point below HeadAddress during migration.
    let store = create_store(256, 12, 13);
    let mut session = store.start_session();
    for key in 1u64..=1000 {
        session.upsert(&key, &(key * 2)).unwrap();
    }

    assert_eq!(store.grow_index().unwrap(), 512);
    session.refresh();

    // Resident keys resolve in memory, evicted keys via fetch.
    assert_eq!(session.read(&1000), Ok(2000));
    match session.read(&5) {
        Ok(value) => assert_eq!(value, 10),
        Err(Status::Pending) => {
            let completed = session.complete_pending(true);
            assert_eq!(completed.len(), 1);
            assert_eq!(completed[0].status, Status::Ok);
            assert_eq!(completed[0].output, Some(10));
        }
        Err(status) => panic!("read(5) failed: {status}"),
    }
}

//! Read-cache promotion and invalidation.

use std::sync::atomic::Ordering;

use hybridkv::config::StoreConfig;
use hybridkv::device::MemoryDevice;
use hybridkv::status::Status;
use hybridkv::store::{HybridKv, SimpleFunctions};

type CachedStore = HybridKv<u64, u64, SimpleFunctions<u64, u64>, MemoryDevice>;

fn create_store() -> CachedStore {
    let config = StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(12)
        .with_memory_size_bits(13)
        .with_read_cache(16);
    HybridKv::new(config, MemoryDevice::new(), SimpleFunctions::new()).unwrap()
}

fn fill(session: &mut hybridkv::store::Session<'_, u64, u64, SimpleFunctions<u64, u64>, MemoryDevice>) {
    for key in 1u64..=1000 {
        session.upsert(&key, &(key * 2)).unwrap();
    }
}

#[test]
fn completed_fetch_promotes_into_the_cache() {
    let store = create_store();
    let mut session = store.start_session();
    fill(&mut session);

    assert_eq!(session.read(&7), Err(Status::Pending));
    let completed = session.complete_pending(true);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].output, Some(14));

    let stats = store.cache_stats().unwrap();
    assert_eq!(stats.promotions.load(Ordering::Relaxed), 1);
    assert!(stats.misses.load(Ordering::Relaxed) >= 1);

    // The second read is served from the cache, without going pending.
    assert_eq!(session.read(&7), Ok(14));
    assert_eq!(stats.hits.load(Ordering::Relaxed), 1);
}

#[test]
fn upsert_invalidates_the_cached_copy() {
    let store = create_store();
    let mut session = store.start_session();
    fill(&mut session);

    assert_eq!(session.read(&7), Err(Status::Pending));
    session.complete_pending(true);
    assert_eq!(session.read(&7), Ok(14));

    // A newer record supersedes the cached copy.
    session.upsert(&7, &99).unwrap();
    assert_eq!(session.read(&7), Ok(99));
}

#[test]
fn rmw_merges_from_the_cached_copy() {
    let store = create_store();
    let mut session = store.start_session();
    fill(&mut session);

    assert_eq!(session.read(&21), Err(Status::Pending));
    session.complete_pending(true);

    // With the value cached, the RMW resolves without another fetch.
    session.rmw(&21, &555).unwrap();
    assert_eq!(session.read(&21), Ok(555));
}

#[test]
fn uncached_store_reports_no_stats() {
    let config = StoreConfig::default()
        .with_table_size(1024)
        .with_page_size_bits(12)
        .with_memory_size_bits(13);
    let store: CachedStore =
        HybridKv::new(config, MemoryDevice::new(), SimpleFunctions::new()).unwrap();
    assert!(store.cache_stats().is_none());
}

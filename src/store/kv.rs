//! The engine: record traversals, CPR coordination, and maintenance drivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::alloc::HybridLog;
use crate::cache::ReadCache;
use crate::config::{ConfigError, StoreConfig};
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::index::{HashBucketEntry, IndexStats, KeyHash, MemHashIndex};
use crate::record::{truncate_version, Key, Record, RecordInfo, Value};
use crate::status::Status;

use super::functions::StoreFunctions;
use super::latches::{CheckpointLock, CheckpointLocks, LatchHold};
use super::pending::PendingIoManager;
use super::session::{PendingContext, Session, ThreadContext};
use super::state::{Action, AtomicSystemState, Phase, SystemState};

/// Outcome of one traversal attempt. Transient variants are resolved by the
/// session's retry loop and never reach callers.
pub(crate) enum OpResult<T> {
    Done(T),
    NotFound,
    /// The chain continues on the device at this address. The entry snapshot
    /// guards a later read-cache promotion against a moved chain.
    OnDisk {
        address: Address,
        entry: HashBucketEntry,
    },
    /// Lost a CAS race or hit a transient boundary condition.
    RetryNow,
    /// The observed CPR version is stale.
    CprShift,
    /// The record sits in the fuzzy region; retry after a refresh.
    RetryLater,
    /// Tail allocation failed; refresh (draining flush work) and retry.
    NoSpace,
}

/// Identifier and version of a completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    pub token: Uuid,
    pub version: u32,
}

/// Combined store statistics snapshot.
#[derive(Debug)]
pub struct StoreStats {
    pub log: crate::alloc::LogStats,
    pub index: IndexStats,
    pub active_sessions: u64,
}

/// Release a checkpoint latch when the traversal attempt ends.
struct LatchGuard<'a> {
    lock: &'a CheckpointLock,
    hold: LatchHold,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        match self.hold {
            LatchHold::None => {}
            LatchHold::Old => self.lock.unlock_old(),
            LatchHold::New => self.lock.unlock_new(),
        }
    }
}

/// The hybrid-log key-value store.
///
/// All record operations go through a [`Session`]; the store itself exposes
/// the maintenance surface (checkpoint, index growth, truncation, scans).
pub struct HybridKv<K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> {
    pub(crate) config: StoreConfig,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) state: AtomicSystemState,
    pub(crate) index: Arc<MemHashIndex>,
    pub(crate) hlog: Arc<HybridLog<D>>,
    pub(crate) read_cache: Option<Arc<ReadCache<K, V>>>,
    pub(crate) funcs: Arc<F>,
    pub(crate) io: PendingIoManager,
    /// Fetched record bytes keyed by address, awaiting their contexts.
    pub(crate) disk_results: Mutex<HashMap<u64, Result<Vec<u8>, Status>>>,
    pub(crate) locks: CheckpointLocks,
    /// Outstanding pending operations per version parity; WAIT_PENDING
    /// drains the old version's slot.
    pub(crate) pending_counts: [AtomicU64; 2],
    num_sessions: AtomicU64,
}

impl<K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> HybridKv<K, V, F, D> {
    pub fn new(config: StoreConfig, device: D, funcs: F) -> Result<Self, ConfigError> {
        Self::with_shared(config, Arc::new(device), Arc::new(funcs))
    }

    /// Build over pre-shared device and functions handles (compaction uses
    /// this to run a scratch instance with the caller's functions object).
    pub fn with_shared(
        config: StoreConfig,
        device: Arc<D>,
        funcs: Arc<F>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if Record::<K, V>::size() > 1 << config.log.page_size_bits {
            return Err(ConfigError::InvalidValue {
                field: "log.page_size_bits",
                reason: "page smaller than one record".to_string(),
            });
        }
        let epoch = Arc::new(LightEpoch::new());
        let hlog = Arc::new(HybridLog::new(
            &config.log,
            Arc::clone(&device),
            Arc::clone(&epoch),
        )?);
        let index = Arc::new(MemHashIndex::new(config.index.table_size));
        let read_cache = match &config.read_cache {
            Some(cache_config) => Some(Arc::new(
                ReadCache::<K, V>::new(cache_config.memory_size_bits)
                    .ok_or(ConfigError::AllocationFailed)?,
            )),
            None => None,
        };

        if let Some(cache) = &read_cache {
            // Main-log eviction unlinks cache records whose chain continuation
            // fell into the vacated range, before readers can chase it.
            let cache = Arc::clone(cache);
            let index = Arc::clone(&index);
            hlog.set_evict_observer(Box::new(move |_old, new| {
                unlink_cache_range(&cache, &index, new);
            }));
        }

        let io = PendingIoManager::new(Arc::clone(&device))?;
        Ok(HybridKv {
            config,
            epoch,
            state: AtomicSystemState::new(SystemState::rest(1)),
            index,
            hlog,
            read_cache,
            funcs,
            io,
            disk_results: Mutex::new(HashMap::new()),
            locks: CheckpointLocks::new(),
            pending_counts: [AtomicU64::new(0), AtomicU64::new(0)],
            num_sessions: AtomicU64::new(0),
        })
    }

    /// Open a session. The session pins this thread in the epoch until it is
    /// dropped; long-idle sessions should call `refresh` so maintenance
    /// operations can make progress.
    pub fn start_session(&self) -> Session<'_, K, V, F, D> {
        self.epoch.protect_and_drain();
        self.num_sessions.fetch_add(1, Ordering::AcqRel);
        let state = self.state.load();
        Session::new(self, state.phase, state.version)
    }

    pub(crate) fn session_closed(&self) {
        self.num_sessions.fetch_sub(1, Ordering::AcqRel);
        self.epoch.unprotect();
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            log: self.hlog.stats(),
            index: self.index.dump_distribution(),
            active_sessions: self.num_sessions.load(Ordering::Acquire),
        }
    }

    pub fn log_stats(&self) -> crate::alloc::LogStats {
        self.hlog.stats()
    }

    /// Read-cache counters, if the cache is enabled.
    pub fn cache_stats(&self) -> Option<&crate::cache::CacheStats> {
        self.read_cache.as_deref().map(|cache| &cache.stats)
    }

    /// Subscribe to newly sealed read-only ranges. At most one subscriber;
    /// a later call replaces the earlier one.
    pub fn subscribe_read_only<O>(&self, observer: O)
    where
        O: Fn(Address, Address) + Send + Sync + 'static,
    {
        self.hlog.set_sealed_observer(Box::new(observer));
    }

    // ---- traversals ------------------------------------------------------

    pub(crate) fn read_attempt(&self, _ctx: &ThreadContext, key: &K) -> OpResult<F::Output> {
        let hash = KeyHash::new(key.hash_code());
        let Some(slot) = self.index.find_entry(hash) else {
            return OpResult::NotFound;
        };
        let mut address = slot.address();

        if address.in_read_cache() {
            let Some(cache) = &self.read_cache else {
                return OpResult::RetryNow;
            };
            if !cache.is_live(address) {
                // Evicted between snapshot and deref; the entry is being
                // unlinked. Re-resolve from the index.
                return OpResult::RetryNow;
            }
            // SAFETY: liveness checked above; epoch protection is held by the
            // session for the whole attempt.
            let record = unsafe { cache.record_at(ReadCache::<K, V>::slot_of(address)) };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                cache.stats.hits.fetch_add(1, Ordering::Relaxed);
                return OpResult::Done(self.funcs.single_reader(key, &record.value));
            }
            address = info.previous_address();
        }

        let head = self.hlog.head_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        while address >= head {
            // SAFETY: head <= address < tail and protection is held.
            let record = unsafe { &*(self.hlog.record_ptr(address) as *const Record<K, V>) };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                if info.is_tombstone() {
                    return OpResult::NotFound;
                }
                let output = if address >= safe_read_only {
                    self.funcs.concurrent_reader(key, &record.value)
                } else {
                    self.funcs.single_reader(key, &record.value)
                };
                return OpResult::Done(output);
            }
            address = info.previous_address();
        }

        if address < self.hlog.begin_address() {
            return OpResult::NotFound;
        }
        if let Some(cache) = &self.read_cache {
            cache.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        OpResult::OnDisk {
            address,
            entry: slot.entry(),
        }
    }

    pub(crate) fn upsert_attempt(&self, ctx: &ThreadContext, key: &K, value: &V) -> OpResult<()> {
        let hash = KeyHash::new(key.hash_code());
        let slot = self.index.find_or_create_entry(hash);

        let (chain_head, cache_record) = match self.resolve_cache_head(slot.address()) {
            Ok(resolved) => resolved,
            Err(()) => return OpResult::RetryNow,
        };

        let guard = match self.acquire_latch(ctx, hash) {
            Ok(guard) => guard,
            Err(result) => return result,
        };

        let read_only = self.hlog.read_only_address();
        let current_version = truncate_version(ctx.version);
        let mut address = chain_head;
        while address >= read_only {
            // SAFETY: address is in the mutable region; protection is held.
            let record_ptr = unsafe { self.hlog.record_ptr(address) } as *mut Record<K, V>;
            let record = unsafe { &*record_ptr };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                if info.version() == truncate_version(ctx.version + 1) {
                    return OpResult::CprShift;
                }
                if info.version() == current_version && !info.is_tombstone() {
                    // SAFETY: mutable-region records may be written in place;
                    // concurrent_writer owns tolerance of racing readers.
                    if self
                        .funcs
                        .concurrent_writer(key, value, unsafe { &mut (*record_ptr).value })
                    {
                        if let Some(stale) = cache_record {
                            stale.set_invalid();
                        }
                        drop(guard);
                        return OpResult::Done(());
                    }
                }
                break;
            }
            address = info.previous_address();
        }

        let result = self.append_value(ctx, &slot, chain_head, key, value);
        if let (OpResult::Done(()), Some(stale)) = (&result, cache_record) {
            stale.set_invalid();
        }
        drop(guard);
        result
    }

    pub(crate) fn rmw_attempt(&self, ctx: &ThreadContext, key: &K, input: &F::Input) -> OpResult<()> {
        let hash = KeyHash::new(key.hash_code());
        let slot = self.index.find_or_create_entry(hash);

        let (chain_head, cache_record) = match self.resolve_cache_head(slot.address()) {
            Ok(resolved) => resolved,
            Err(()) => return OpResult::RetryNow,
        };
        let cache_source = cache_record.and_then(|record| {
            let info = record.info();
            (!info.is_invalid() && record.key == *key).then(|| record.value)
        });

        let guard = match self.acquire_latch(ctx, hash) {
            Ok(guard) => guard,
            Err(result) => return result,
        };

        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        let current_version = truncate_version(ctx.version);

        let mut source: Option<V> = None;
        let mut found = false;
        let mut address = chain_head;
        while address >= head {
            // SAFETY: head <= address < tail; protection is held.
            let record_ptr = unsafe { self.hlog.record_ptr(address) } as *mut Record<K, V>;
            let record = unsafe { &*record_ptr };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                if info.version() == truncate_version(ctx.version + 1) {
                    return OpResult::CprShift;
                }
                if address >= read_only {
                    if info.version() == current_version && !info.is_tombstone() {
                        // SAFETY: see upsert_attempt.
                        if self.funcs.in_place_updater(key, input, unsafe {
                            &mut (*record_ptr).value
                        }) {
                            if let Some(stale) = cache_record {
                                stale.set_invalid();
                            }
                            drop(guard);
                            return OpResult::Done(());
                        }
                    }
                } else if address >= safe_read_only {
                    // Fuzzy region: another thread may still treat this
                    // record as mutable, so it is not a safe copy source.
                    return OpResult::RetryLater;
                }
                if !info.is_tombstone() {
                    source = Some(record.value);
                }
                found = true;
                break;
            }
            address = info.previous_address();
        }

        if !found {
            if let Some(cached) = cache_source {
                source = Some(cached);
            } else if address >= self.hlog.begin_address() {
                drop(guard);
                return OpResult::OnDisk {
                    address,
                    entry: slot.entry(),
                };
            }
        }

        let new_value = match &source {
            Some(old) => self.funcs.copy_updater(key, input, old),
            None => self.funcs.initial_updater(key, input),
        };
        let result = self.append_raw(ctx, &slot, chain_head, key, &new_value, false);
        if let (OpResult::Done(()), Some(stale)) = (&result, cache_record) {
            stale.set_invalid();
        }
        drop(guard);
        result
    }

    pub(crate) fn delete_attempt(&self, ctx: &ThreadContext, key: &K) -> OpResult<()> {
        let hash = KeyHash::new(key.hash_code());
        let Some(slot) = self.index.find_entry(hash) else {
            return OpResult::NotFound;
        };

        let (chain_head, cache_record) = match self.resolve_cache_head(slot.address()) {
            Ok(resolved) => resolved,
            Err(()) => return OpResult::RetryNow,
        };

        let guard = match self.acquire_latch(ctx, hash) {
            Ok(guard) => guard,
            Err(result) => return result,
        };

        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let begin = self.hlog.begin_address();
        let current_version = truncate_version(ctx.version);

        let mut address = chain_head;
        while address >= head {
            // SAFETY: head <= address < tail; protection is held.
            let record = unsafe { &*(self.hlog.record_ptr(address) as *const Record<K, V>) };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                if info.version() == truncate_version(ctx.version + 1) {
                    return OpResult::CprShift;
                }
                if info.is_tombstone() {
                    return OpResult::NotFound;
                }
                if address >= read_only && info.version() == current_version {
                    if info.previous_address() < begin && address == chain_head {
                        // Sole record of this chain: elide the entry rather
                        // than grow the log with a tombstone.
                        if self.index.try_update_entry(&slot, HashBucketEntry::UNUSED)
                            == Status::Ok
                        {
                            record.set_invalid();
                            drop(guard);
                            return OpResult::Done(());
                        }
                        return OpResult::RetryNow;
                    }
                    record.set_tombstone();
                    if let Some(stale) = cache_record {
                        stale.set_invalid();
                    }
                    drop(guard);
                    return OpResult::Done(());
                }
                break;
            }
            address = info.previous_address();
        }

        if address < begin {
            // Chain exhausted without a live record.
            if cache_record.map_or(true, |record| record.key != *key) {
                return OpResult::NotFound;
            }
        }

        // Record is immutable, on disk, or cached: append a tombstone. A
        // delete never goes pending.
        let Some(new_address) = self.hlog.try_allocate(Record::<K, V>::size()) else {
            return OpResult::NoSpace;
        };
        let info = RecordInfo::new(truncate_version(ctx.version), chain_head, false);
        // SAFETY: freshly allocated tail bytes, unpublished until the CAS.
        let record = unsafe {
            &*Record::<K, V>::initialize_tombstone(self.hlog.record_ptr(new_address), info, *key)
        };
        let desired = HashBucketEntry::new(new_address, slot.tag(), false);
        if self.index.try_update_entry(&slot, desired) == Status::Ok {
            if let Some(stale) = cache_record {
                stale.set_invalid();
            }
            drop(guard);
            OpResult::Done(())
        } else {
            record.set_invalid();
            OpResult::RetryNow
        }
    }

    /// Dereference a read-cache chain head: yields the main-log continuation
    /// address and the live cache record, if any. `Err` means the snapshot
    /// raced an eviction and the attempt should restart.
    fn resolve_cache_head(
        &self,
        entry_address: Address,
    ) -> Result<(Address, Option<&Record<K, V>>), ()> {
        if !entry_address.in_read_cache() {
            return Ok((entry_address, None));
        }
        let Some(cache) = &self.read_cache else {
            return Err(());
        };
        if !cache.is_live(entry_address) {
            return Err(());
        }
        // SAFETY: liveness checked; epoch protection held by the caller.
        let record = unsafe { cache.record_at(ReadCache::<K, V>::slot_of(entry_address)) };
        Ok((record.info().previous_address(), Some(record)))
    }

    /// Take the checkpoint latch appropriate for the session's phase.
    fn acquire_latch(&self, ctx: &ThreadContext, hash: KeyHash) -> Result<LatchGuard<'_>, OpResult<()>> {
        let lock = self.locks.lock_for(hash);
        match ctx.phase {
            Phase::Prepare => {
                if !lock.try_lock_old() {
                    // A new-version operation moved in; this thread is behind.
                    Err(OpResult::CprShift)
                } else {
                    Ok(LatchGuard {
                        lock,
                        hold: LatchHold::Old,
                    })
                }
            }
            Phase::InProgress | Phase::WaitPending | Phase::WaitFlush => {
                if !lock.try_lock_new() {
                    // Old-version stragglers still hold the partition.
                    Err(OpResult::RetryNow)
                } else {
                    Ok(LatchGuard {
                        lock,
                        hold: LatchHold::New,
                    })
                }
            }
            _ => Ok(LatchGuard {
                lock,
                hold: LatchHold::None,
            }),
        }
    }

    fn append_value(
        &self,
        ctx: &ThreadContext,
        slot: &crate::index::IndexSlot,
        chain_head: Address,
        key: &K,
        value: &V,
    ) -> OpResult<()> {
        self.append_raw(ctx, slot, chain_head, key, value, true)
    }

    /// Write a record at the tail and CAS it into the chain head.
    fn append_raw(
        &self,
        ctx: &ThreadContext,
        slot: &crate::index::IndexSlot,
        chain_head: Address,
        key: &K,
        value: &V,
        use_writer: bool,
    ) -> OpResult<()> {
        let Some(new_address) = self.hlog.try_allocate(Record::<K, V>::size()) else {
            return OpResult::NoSpace;
        };
        let info = RecordInfo::new(truncate_version(ctx.version), chain_head, false);
        // SAFETY: freshly allocated tail bytes, unpublished until the CAS.
        let record = unsafe {
            let record_ptr = self.hlog.record_ptr(new_address);
            let record = Record::initialize(record_ptr, info, *key, *value);
            if use_writer {
                self.funcs.single_writer(key, value, &mut (*record).value);
            }
            &*record
        };
        let desired = HashBucketEntry::new(new_address, slot.tag(), false);
        if self.index.try_update_entry(slot, desired) == Status::Ok {
            OpResult::Done(())
        } else {
            record.set_invalid();
            OpResult::RetryNow
        }
    }

    /// Finish a pending RMW against the value fetched from disk. The append
    /// only proceeds if the chain head is still the entry the fetch was
    /// issued under; otherwise the caller re-runs the operation.
    pub(crate) fn rmw_disk_continue(
        &self,
        ctx: &ThreadContext,
        key: &K,
        input: &F::Input,
        source: Option<&V>,
        issued_entry: HashBucketEntry,
    ) -> OpResult<()> {
        let hash = KeyHash::new(key.hash_code());
        let slot = self.index.find_or_create_entry(hash);
        if slot.entry() != issued_entry {
            return OpResult::RetryNow;
        }
        let guard = match self.acquire_latch(ctx, hash) {
            Ok(guard) => guard,
            Err(result) => return result,
        };
        let new_value = match source {
            Some(old) => self.funcs.copy_updater(key, input, old),
            None => self.funcs.initial_updater(key, input),
        };
        let result = self.append_raw(ctx, &slot, slot.address(), key, &new_value, false);
        drop(guard);
        result
    }

    // ---- pending I/O -----------------------------------------------------

    pub(crate) fn issue_fetch(&self, ctx: &PendingContext<K, F::Input>) {
        self.pending_counts[(ctx.version & 1) as usize].fetch_add(1, Ordering::AcqRel);
        self.io.submit_read(ctx.awaiting, Record::<K, V>::size());
    }

    /// Re-target an existing context one hop further down the chain.
    pub(crate) fn reissue_fetch(&self, address: Address) {
        self.io.submit_read(address, Record::<K, V>::size());
    }

    pub(crate) fn retire_pending(&self, ctx: &PendingContext<K, F::Input>) {
        self.pending_counts[(ctx.version & 1) as usize].fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn absorb_completions(&self) {
        for completion in self.io.drain() {
            let stored = completion.result.map_err(|_| Status::IoError);
            self.disk_results
                .lock()
                .insert(completion.address.control(), stored);
        }
    }

    pub(crate) fn take_fetched(&self, address: Address) -> Option<Result<Vec<u8>, Status>> {
        self.disk_results.lock().remove(&address.control())
    }

    /// Promote a record fetched from disk into the read cache. At most one
    /// attempt per fetch: a lost CAS abandons the copy.
    pub(crate) fn try_promote(
        &self,
        key: &K,
        value: &V,
        version: u32,
        issued_entry: HashBucketEntry,
    ) {
        let Some(cache) = &self.read_cache else {
            return;
        };
        let hash = KeyHash::new(key.hash_code());
        let Some(slot) = self.index.find_entry(hash) else {
            return;
        };
        // The chain must not have moved since the fetch was issued; a newer
        // record (or another promotion) supersedes this copy.
        if slot.entry() != issued_entry || slot.address().in_read_cache() {
            return;
        }
        let reserved = match cache.try_reserve() {
            Some(reserved) => Some(reserved),
            None => {
                self.evict_cache_batch(cache);
                cache.try_reserve()
            }
        };
        let Some(reserved) = reserved else {
            cache.stats.dropped_promotions.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let info = RecordInfo::new(truncate_version(version), slot.address(), false);
        // SAFETY: the slot was just reserved and is not yet published.
        let record = unsafe { &*Record::initialize(cache.record_ptr(reserved), info, *key, *value) };
        let desired =
            HashBucketEntry::new(ReadCache::<K, V>::address_of(reserved), slot.tag(), false);
        if self.index.try_update_entry(&slot, desired) == Status::Ok {
            cache.stats.promotions.fetch_add(1, Ordering::Relaxed);
        } else {
            record.set_invalid();
            cache.stats.dropped_promotions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Unlink and retire the oldest batch of cache slots, then advance the
    /// cache head once the epoch drains.
    fn evict_cache_batch(&self, cache: &Arc<ReadCache<K, V>>) {
        let head = cache.head_slot();
        let target = (head + cache.eviction_batch()).min(cache.tail_slot());
        for slot in head..target {
            // SAFETY: slots below tail hold initialized records; protection
            // is held by the calling session.
            let record = unsafe { cache.record_at(slot) };
            let info = record.info();
            record.set_invalid();
            let hash = KeyHash::new(record.key.hash_code());
            if let Some(index_slot) = self.index.find_entry(hash) {
                if index_slot.address() == ReadCache::<K, V>::address_of(slot) {
                    let _ = self.index.try_update_entry(
                        &index_slot,
                        HashBucketEntry::new(info.previous_address(), index_slot.tag(), false),
                    );
                }
            }
        }
        let cache = Arc::clone(cache);
        self.epoch
            .bump_current_epoch_with_action(move || cache.advance_head(target));
    }

    // ---- session refresh and CPR participation ---------------------------

    pub(crate) fn refresh_session(&self, ctx: &mut ThreadContext) {
        self.epoch.refresh();
        let global = self.state.load();
        if global.phase == Phase::InProgressGrow {
            self.participate_in_grow();
        }
        ctx.phase = global.phase;
        ctx.version = global.version;
    }

    fn participate_in_grow(&self) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(error) => {
                tracing::error!(%error, "runtime for grow rehash");
                return;
            }
        };
        let rehash = |address: Address| self.rehash_record(&rt, address);
        while let Some(last) = self.index.migrate_chunk(&rehash) {
            if last {
                let _ = self.index.complete_grow();
                let state = self.state.load();
                if state.phase == Phase::InProgressGrow {
                    let _ = self.state.try_advance(state);
                }
                break;
            }
        }
    }

    /// Recover the key hash for an index entry during migration. Entries
    /// below HeadAddress are re-read from the device.
    fn rehash_record(&self, rt: &tokio::runtime::Runtime, address: Address) -> Option<KeyHash> {
        if address.in_read_cache() {
            let cache = self.read_cache.as_ref()?;
            if !cache.is_live(address) {
                return None;
            }
            // SAFETY: liveness checked; migration runs under protection.
            let record = unsafe { cache.record_at(ReadCache::<K, V>::slot_of(address)) };
            return Some(KeyHash::new(record.key.hash_code()));
        }
        if self.hlog.contains(address) {
            // SAFETY: contains() bounds the address; protection is held.
            let record = unsafe { &*(self.hlog.record_ptr(address) as *const Record<K, V>) };
            return Some(KeyHash::new(record.key.hash_code()));
        }
        if address < self.hlog.begin_address() {
            return None;
        }
        let bytes = rt
            .block_on(
                self.hlog
                    .device
                    .read(address.control(), Record::<K, V>::size()),
            )
            .ok()?;
        // SAFETY: the device round-trips engine-written record bytes.
        let record = unsafe { Record::<K, V>::read_from(bytes.as_ptr()) };
        Some(KeyHash::new(record.key.hash_code()))
    }

    // ---- scans and conditional copies ------------------------------------

    /// Iterate records in `range`, oldest first. The iterator pins this
    /// thread in the epoch for its lifetime.
    pub fn scan(
        &self,
        range: crate::scan::ScanRange,
    ) -> std::io::Result<crate::scan::LogScanIterator<K, V, D>> {
        crate::scan::LogScanIterator::new(Arc::clone(&self.hlog), range)
    }

    /// Address of the newest memory-resident record for `key`, or `None` if
    /// the chain is empty or leaves memory before a match.
    pub(crate) fn resident_record_address(&self, key: &K) -> Option<Address> {
        let hash = KeyHash::new(key.hash_code());
        let slot = self.index.find_entry(hash)?;
        let mut address = slot.address();
        if address.in_read_cache() {
            let cache = self.read_cache.as_ref()?;
            if !cache.is_live(address) {
                return None;
            }
            // SAFETY: liveness checked; the caller holds protection.
            let record = unsafe { cache.record_at(ReadCache::<K, V>::slot_of(address)) };
            address = record.info().previous_address();
        }
        let head = self.hlog.head_address();
        while address >= head {
            // SAFETY: head <= address < tail; protection is held.
            let record = unsafe { &*(self.hlog.record_ptr(address) as *const Record<K, V>) };
            let info = record.info();
            if !info.is_invalid() && record.key == *key {
                return Some(address);
            }
            address = info.previous_address();
        }
        None
    }

    /// Whether the chain starting at `chain_head` holds any record for `key`
    /// at or above `cutoff`, reading below HeadAddress from the device.
    pub(crate) fn chain_has_record_at_or_above(
        &self,
        chain_head: Address,
        key: &K,
        cutoff: Address,
        rt: &tokio::runtime::Runtime,
    ) -> bool {
        let mut address = chain_head;
        let head = self.hlog.head_address();
        while address >= cutoff {
            let info;
            let matches;
            if address >= head {
                // SAFETY: head <= address < tail; protection is held.
                let record = unsafe { &*(self.hlog.record_ptr(address) as *const Record<K, V>) };
                info = record.info();
                matches = record.key == *key;
            } else {
                let Ok(bytes) = rt.block_on(
                    self.hlog
                        .device
                        .read(address.control(), Record::<K, V>::size()),
                ) else {
                    return true;
                };
                // SAFETY: the device round-trips engine-written record bytes.
                let record = unsafe { Record::<K, V>::read_from(bytes.as_ptr()) };
                info = record.info();
                matches = record.key == *key;
            }
            if !info.is_invalid() && matches {
                return true;
            }
            address = info.previous_address();
        }
        false
    }

    /// Copy `value` to the tail unless the chain for `key` already holds a
    /// record at or above `cutoff`. The chain walk and the append both work
    /// from one index snapshot, so the CAS in `append_raw` fails whenever a
    /// concurrent update lands after the walk and the whole attempt restarts.
    /// `Done(true)` means a record was appended, `Done(false)` that a newer
    /// record made the copy unnecessary.
    pub(crate) fn conditional_copy(
        &self,
        ctx: &ThreadContext,
        key: &K,
        value: &V,
        cutoff: Address,
        rt: &tokio::runtime::Runtime,
    ) -> OpResult<bool> {
        let hash = KeyHash::new(key.hash_code());
        loop {
            let slot = self.index.find_or_create_entry(hash);
            let (chain_head, cache_record) = match self.resolve_cache_head(slot.address()) {
                Ok(resolved) => resolved,
                Err(()) => continue, // racing eviction; re-snapshot
            };
            if self.chain_has_record_at_or_above(chain_head, key, cutoff, rt) {
                return OpResult::Done(false);
            }
            match self.append_raw(ctx, &slot, chain_head, key, value, false) {
                OpResult::Done(()) => {
                    if let Some(stale) = cache_record {
                        stale.set_invalid();
                    }
                    return OpResult::Done(true);
                }
                OpResult::RetryNow => continue,
                OpResult::NoSpace => return OpResult::NoSpace,
                other => {
                    let _ = other;
                    return OpResult::RetryNow;
                }
            }
        }
    }

    // ---- maintenance drivers ---------------------------------------------

    /// Take a fold-over checkpoint: bump the CPR version, drain old-version
    /// pending operations, then seal and flush the log to the tail.
    ///
    /// Sessions active during the checkpoint must keep operating (or call
    /// `refresh`) for the phases to complete.
    pub fn checkpoint(&self) -> Result<CheckpointResult, Status> {
        let Some(prepare) = self.state.try_start_action(Action::Checkpoint) else {
            return Err(Status::Aborted);
        };
        let old_version = prepare.version;
        self.wait_for_phase_visibility();

        let in_progress = self.advance(prepare);
        self.wait_for_phase_visibility();

        let wait_pending = self.advance(in_progress);
        let old_parity = (old_version & 1) as usize;
        while self.pending_counts[old_parity].load(Ordering::Acquire) > 0 {
            self.epoch_pulse();
            std::thread::yield_now();
        }

        let wait_flush = self.advance(wait_pending);
        let sealed_tail = self.hlog.shift_read_only_to_tail();
        while self.hlog.flushed_until_address() < sealed_tail {
            if !self.hlog.flush_errors.lock().is_empty() {
                // Leave the state machine at rest; the flush error surfaces
                // on the next flush attempt too.
                let _ = self.advance(wait_flush);
                return Err(Status::IoError);
            }
            self.epoch_pulse();
            std::thread::yield_now();
        }

        let rest = self.advance(wait_flush);
        let token = Uuid::new_v4();
        tracing::info!(version = rest.version, %token, sealed = ?sealed_tail, "checkpoint complete");
        Ok(CheckpointResult {
            token,
            version: rest.version,
        })
    }

    /// Double the hash table online. Sessions participate in chunk migration
    /// during their refreshes; this call drives any chunks left over.
    pub fn grow_index(&self) -> Result<u64, Status> {
        let Some(prepare) = self.state.try_start_action(Action::GrowIndex) else {
            return Err(Status::Aborted);
        };
        if self.index.start_grow().is_err() {
            let in_progress = self.advance(prepare);
            let _ = self.advance(in_progress);
            return Err(Status::Aborted);
        }
        self.wait_for_phase_visibility();
        let _ = self.advance(prepare);

        self.participate_in_grow();
        while self.index.grow_in_progress() {
            self.epoch_pulse();
            std::thread::yield_now();
        }
        let state = self.state.load();
        if state.phase == Phase::InProgressGrow {
            let _ = self.state.try_advance(state);
        }
        Ok(self.index.table_size())
    }

    /// Truncate the log below `until` and drop the index entries that
    /// pointed into the truncated prefix.
    pub fn shift_begin_address(&self, until: Address) -> Status {
        let Some(gc) = self.state.try_start_action(Action::GarbageCollect) else {
            return Status::Aborted;
        };
        self.hlog.shift_begin_address(until);
        self.epoch_pulse();
        self.index.garbage_collect(self.hlog.begin_address());
        let _ = self.advance(gc);
        Status::Ok
    }

    /// Seal the log up to the tail and optionally wait for the flush.
    pub fn flush(&self, wait: bool) -> Result<Address, Status> {
        let sealed_tail = self.hlog.shift_read_only_to_tail();
        self.epoch_pulse();
        if wait {
            while self.hlog.flushed_until_address() < sealed_tail {
                if !self.hlog.flush_errors.lock().is_empty() {
                    return Err(Status::IoError);
                }
                self.epoch_pulse();
                std::thread::yield_now();
            }
        }
        Ok(sealed_tail)
    }

    fn advance(&self, expected: SystemState) -> SystemState {
        match self.state.try_advance(expected) {
            Some(next) => next,
            None => self.state.load(),
        }
    }

    /// Wait until every protected thread has observed the state published
    /// before this call.
    fn wait_for_phase_visibility(&self) {
        let epoch = self.epoch.bump_current_epoch();
        while !self.epoch.is_safe_to_reclaim(epoch) {
            self.epoch_pulse();
            std::thread::yield_now();
        }
    }

    /// Participate in the epoch from a maintenance thread so deferred
    /// actions (flushes, evictions) can run here.
    pub(crate) fn epoch_pulse(&self) {
        self.epoch.protect_and_drain();
        self.epoch.unprotect();
    }
}

/// Unlink cache records whose main-log continuation fell below `new_head`,
/// so no reader chases an evicted address through the cache.
fn unlink_cache_range<K: Key, V: Value>(
    cache: &ReadCache<K, V>,
    index: &MemHashIndex,
    new_head: Address,
) {
    for slot in cache.head_slot()..cache.tail_slot() {
        // SAFETY: live slots hold initialized records; this hook runs on an
        // epoch-draining thread.
        let record = unsafe { cache.record_at(slot) };
        let info = record.info();
        if info.is_invalid() {
            continue;
        }
        let previous = info.previous_address();
        if previous.in_read_cache() || previous >= new_head {
            continue;
        }
        let hash = KeyHash::new(record.key.hash_code());
        if let Some(index_slot) = index.find_entry(hash) {
            if index_slot.address() == ReadCache::<K, V>::address_of(slot) {
                let _ = index.try_update_entry(
                    &index_slot,
                    HashBucketEntry::new(previous, index_slot.tag(), false),
                );
            }
        }
        record.set_invalid();
    }
}

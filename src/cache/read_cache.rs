//! Fixed-slot arena for records promoted from the on-disk region.
//!
//! Every record of a given store has the same size, so the cache is a ring
//! of record slots addressed by a monotonic slot counter. A cache address
//! stores the slot counter with the read-cache bit set; the record's
//! previous-address field preserves the main-log chain so lookups fall
//! through on mismatch or eviction.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::record::{Key, Record, Value};
use crate::utility::AlignedBuffer;

/// Counters, readable for logging and tests.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub promotions: AtomicU64,
    /// Promotions discarded after losing the index CAS (at most once each).
    pub dropped_promotions: AtomicU64,
}

pub struct ReadCache<K: Key, V: Value> {
    buffer: AlignedBuffer,
    capacity_slots: u64,
    record_size: u32,
    /// Next slot to hand out (monotonic).
    tail: AtomicU64,
    /// Oldest live slot (monotonic).
    head: AtomicU64,
    pub stats: CacheStats,
    _marker: PhantomData<(K, V)>,
}

impl<K: Key, V: Value> ReadCache<K, V> {
    /// Build a cache with a `2^memory_size_bits`-byte budget. Returns `None`
    /// if the budget holds no records or allocation fails.
    pub fn new(memory_size_bits: u32) -> Option<Self> {
        let record_size = Record::<K, V>::size();
        let bytes = 1u64 << memory_size_bits;
        let capacity_slots = bytes / record_size as u64;
        if capacity_slots == 0 {
            return None;
        }
        let buffer = AlignedBuffer::zeroed(64, (capacity_slots * record_size as u64) as usize)?;
        Some(ReadCache {
            buffer,
            capacity_slots,
            record_size,
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            stats: CacheStats::default(),
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn capacity_slots(&self) -> u64 {
        self.capacity_slots
    }

    #[inline]
    pub fn head_slot(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tail_slot(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Cache address for a slot (read-cache bit set). Slot counters are
    /// offset by one so no cache address is ever the null address.
    #[inline]
    pub fn address_of(slot: u64) -> Address {
        Address::from_control(slot + 1).with_read_cache()
    }

    /// Slot for a cache address.
    #[inline]
    pub fn slot_of(address: Address) -> u64 {
        debug_assert!(address.in_read_cache());
        address.strip_read_cache().control() - 1
    }

    /// Whether the record at `address` is still resident (not evicted).
    #[inline]
    pub fn is_live(&self, address: Address) -> bool {
        let slot = Self::slot_of(address);
        slot >= self.head_slot() && slot < self.tail_slot()
    }

    /// Reserve one slot for a promotion. Fails when the ring is full; the
    /// caller evicts and may try again, or drops the promotion.
    pub fn try_reserve(&self) -> Option<u64> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail - self.head.load(Ordering::Acquire) >= self.capacity_slots {
                return None;
            }
            if self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(tail);
            }
        }
    }

    /// Raw pointer to a slot's record bytes.
    ///
    /// # Safety
    /// `slot` must be reserved and not yet evicted-and-recycled; the caller
    /// holds epoch protection while dereferencing.
    #[inline]
    pub unsafe fn record_ptr(&self, slot: u64) -> *mut u8 {
        debug_assert!(slot < self.tail_slot());
        self.buffer
            .as_mut_ptr()
            .add(((slot % self.capacity_slots) * self.record_size as u64) as usize)
    }

    /// Shared view of the record in `slot`.
    ///
    /// # Safety
    /// Same contract as [`ReadCache::record_ptr`].
    #[inline]
    pub unsafe fn record_at(&self, slot: u64) -> &Record<K, V> {
        &*(self.record_ptr(slot) as *const Record<K, V>)
    }

    /// Advance the head past evicted slots. The store unlinks the affected
    /// index entries first and defers this through the epoch.
    pub fn advance_head(&self, new_head: u64) {
        let mut head = self.head.load(Ordering::Acquire);
        let new_head = new_head.min(self.tail_slot());
        while new_head > head {
            match self
                .head
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Number of slots the store should evict in one batch when the ring is
    /// full (an eighth of capacity, at least one).
    pub fn eviction_batch(&self) -> u64 {
        (self.capacity_slots / 8).max(1)
    }
}

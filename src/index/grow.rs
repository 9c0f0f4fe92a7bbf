//! Chunked migration state for online index growth.
//!
//! A split doubles the table. The old table is divided into fixed-size
//! chunks; threads claim chunks by fetch-add and migrate them concurrently.
//! Completion is detected when the pending-chunk counter reaches zero, which
//! is what lets the coordinator flip the table version.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Buckets migrated per claimed chunk.
pub const HASH_TABLE_CHUNK_SIZE: u64 = 16384;

pub fn calculate_num_chunks(table_size: u64) -> u64 {
    table_size.div_ceil(HASH_TABLE_CHUNK_SIZE).max(1)
}

/// Bucket range `[start, end)` covered by `chunk` of a table of `table_size`.
pub fn get_chunk_bounds(chunk: u64, table_size: u64) -> (u64, u64) {
    let start = chunk * HASH_TABLE_CHUNK_SIZE;
    let end = (start + HASH_TABLE_CHUNK_SIZE).min(table_size);
    (start, end)
}

/// Shared state of one in-flight grow.
pub struct GrowState {
    old_version: AtomicU8,
    num_chunks: AtomicU64,
    next_chunk: AtomicU64,
    pending_chunks: AtomicU64,
    entries_migrated: AtomicU64,
    rehash_failures: AtomicU64,
}

impl GrowState {
    pub fn new() -> Self {
        GrowState {
            old_version: AtomicU8::new(0),
            num_chunks: AtomicU64::new(0),
            next_chunk: AtomicU64::new(0),
            pending_chunks: AtomicU64::new(0),
            entries_migrated: AtomicU64::new(0),
            rehash_failures: AtomicU64::new(0),
        }
    }

    pub fn initialize(&self, old_version: u8, num_chunks: u64) {
        self.old_version.store(old_version, Ordering::Release);
        self.num_chunks.store(num_chunks, Ordering::Release);
        self.next_chunk.store(0, Ordering::Release);
        self.pending_chunks.store(num_chunks, Ordering::Release);
        self.entries_migrated.store(0, Ordering::Release);
        self.rehash_failures.store(0, Ordering::Release);
    }

    #[inline]
    pub fn old_version(&self) -> u8 {
        self.old_version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn new_version(&self) -> u8 {
        1 - self.old_version()
    }

    /// Claim the next unmigrated chunk, if any remain.
    pub fn claim_chunk(&self) -> Option<u64> {
        let chunk = self.next_chunk.fetch_add(1, Ordering::AcqRel);
        if chunk < self.num_chunks.load(Ordering::Acquire) {
            Some(chunk)
        } else {
            None
        }
    }

    /// Mark one claimed chunk migrated. Returns true when this was the last
    /// outstanding chunk.
    pub fn complete_chunk(&self) -> bool {
        self.pending_chunks.fetch_sub(1, Ordering::AcqRel) == 1
    }

    #[inline]
    pub fn remaining_chunks(&self) -> u64 {
        self.pending_chunks.load(Ordering::Acquire)
    }

    pub fn record_migrated(&self, entries: u64, rehash_failures: u64) {
        self.entries_migrated.fetch_add(entries, Ordering::AcqRel);
        self.rehash_failures
            .fetch_add(rehash_failures, Ordering::AcqRel);
    }

    pub fn entries_migrated(&self) -> u64 {
        self.entries_migrated.load(Ordering::Acquire)
    }

    pub fn rehash_failures(&self) -> u64 {
        self.rehash_failures.load(Ordering::Acquire)
    }
}

impl Default for GrowState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_math() {
        assert_eq!(calculate_num_chunks(1), 1);
        assert_eq!(calculate_num_chunks(HASH_TABLE_CHUNK_SIZE), 1);
        assert_eq!(calculate_num_chunks(HASH_TABLE_CHUNK_SIZE + 1), 2);
        assert_eq!(get_chunk_bounds(0, 100), (0, 100));
        assert_eq!(
            get_chunk_bounds(1, 3 * HASH_TABLE_CHUNK_SIZE),
            (HASH_TABLE_CHUNK_SIZE, 2 * HASH_TABLE_CHUNK_SIZE)
        );
    }

    #[test]
    fn chunks_claimed_once_each() {
        let state = GrowState::new();
        state.initialize(0, 3);
        assert_eq!(state.claim_chunk(), Some(0));
        assert_eq!(state.claim_chunk(), Some(1));
        assert_eq!(state.claim_chunk(), Some(2));
        assert_eq!(state.claim_chunk(), None);
    }

    #[test]
    fn completion_detected_on_last_chunk() {
        let state = GrowState::new();
        state.initialize(1, 2);
        assert_eq!(state.new_version(), 0);
        assert!(!state.complete_chunk());
        assert!(state.complete_chunk());
        assert_eq!(state.remaining_chunks(), 0);
    }
}

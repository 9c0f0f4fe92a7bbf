//! Hash-partitioned checkpoint latches.
//!
//! During the PREPARE/IN_PROGRESS handoff, old-version and new-version
//! operations on the same hash partition must not interleave. Each latch
//! packs an old-version holder count (low word) and a new-version holder
//! count (high word); old acquisitions fail once any new holder exists, and
//! new acquisitions wait out the old holders.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::index::KeyHash;

const NEW_SHIFT: u32 = 32;
const OLD_MASK: u64 = (1 << NEW_SHIFT) - 1;

/// Which side of a latch an operation holds, for symmetric release.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LatchHold {
    None,
    Old,
    New,
}

pub struct CheckpointLock(AtomicU64);

impl CheckpointLock {
    const fn new() -> Self {
        CheckpointLock(AtomicU64::new(0))
    }

    /// Acquire as an old-version operation. Fails once a new-version holder
    /// has moved in.
    pub fn try_lock_old(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current >> NEW_SHIFT != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unlock_old(&self) {
        let previous = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & OLD_MASK != 0);
    }

    /// Acquire as a new-version operation. Fails while old-version holders
    /// remain; the caller retries after a refresh.
    pub fn try_lock_new(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & OLD_MASK != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + (1 << NEW_SHIFT),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unlock_new(&self) {
        let previous = self.0.fetch_sub(1 << NEW_SHIFT, Ordering::AcqRel);
        debug_assert!(previous >> NEW_SHIFT != 0);
    }
}

/// Fixed pool of latches indexed by key hash.
pub struct CheckpointLocks {
    locks: Box<[CheckpointLock]>,
    mask: u64,
}

impl CheckpointLocks {
    /// 2^13 latches; contention during the handoff window is brief, so the
    /// pool does not scale with the table.
    const SIZE: usize = 1 << 13;

    pub fn new() -> Self {
        let mut locks = Vec::with_capacity(Self::SIZE);
        locks.resize_with(Self::SIZE, CheckpointLock::new);
        CheckpointLocks {
            locks: locks.into_boxed_slice(),
            mask: Self::SIZE as u64 - 1,
        }
    }

    #[inline]
    pub fn lock_for(&self, hash: KeyHash) -> &CheckpointLock {
        &self.locks[(hash.control() & self.mask) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_holders_block_new() {
        let lock = CheckpointLock::new();
        assert!(lock.try_lock_old());
        assert!(lock.try_lock_old());
        assert!(!lock.try_lock_new());
        lock.unlock_old();
        assert!(!lock.try_lock_new());
        lock.unlock_old();
        assert!(lock.try_lock_new());
    }

    #[test]
    fn new_holder_blocks_old() {
        let lock = CheckpointLock::new();
        assert!(lock.try_lock_new());
        assert!(!lock.try_lock_old());
        lock.unlock_new();
        assert!(lock.try_lock_old());
    }

    #[test]
    fn hashes_map_to_stable_latches() {
        let locks = CheckpointLocks::new();
        let hash = KeyHash::new(0xdead_beef_cafe_f00d);
        let a = locks.lock_for(hash) as *const _;
        let b = locks.lock_for(hash) as *const _;
        assert!(std::ptr::eq(a, b));
    }
}

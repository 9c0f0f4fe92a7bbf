//! The epoch table and drain list.
//!
//! Each registered thread owns one cache-line-sized entry in a fixed table.
//! While protected, the entry carries the epoch the thread last observed.
//! The safe-to-reclaim epoch is the minimum over all protected entries minus
//! one; deferred actions are stamped with the epoch at which they were
//! scheduled and run once that epoch becomes safe.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::MAX_THREADS;

/// Entry value meaning "not protected".
const UNPROTECTED: u64 = 0;

/// Number of slots in the deferred-action list.
const DRAIN_LIST_SIZE: usize = 256;

/// Drain slot states. Anything below LOCKED is a real epoch.
const SLOT_FREE: u64 = u64::MAX;
const SLOT_LOCKED: u64 = u64::MAX - 1;

static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_index() -> usize {
    THREAD_INDEX.with(|slot| match slot.get() {
        Some(index) => index,
        None => {
            let index = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed) % MAX_THREADS;
            slot.set(Some(index));
            index
        }
    })
}

/// One thread's epoch slot. Padded to a cache line so neighboring threads do
/// not false-share.
#[repr(C, align(64))]
struct Entry {
    local_epoch: AtomicU64,
    reentrant: AtomicU32,
}

impl Entry {
    const fn new() -> Self {
        Entry {
            local_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
        }
    }
}

type Action = Box<dyn FnOnce() + Send>;

/// One deferred action plus the epoch that must become safe before it runs.
struct DrainSlot {
    epoch: AtomicU64,
    action: Mutex<Option<Action>>,
}

impl DrainSlot {
    fn new() -> Self {
        DrainSlot {
            epoch: AtomicU64::new(SLOT_FREE),
            action: Mutex::new(None),
        }
    }

    /// Run the slot's action if its epoch is safe. Returns true if the slot
    /// was consumed by this call.
    fn try_pop(&self, safe_epoch: u64) -> bool {
        let slot_epoch = self.epoch.load(Ordering::Acquire);
        if slot_epoch >= SLOT_LOCKED || slot_epoch > safe_epoch {
            return false;
        }
        if self
            .epoch
            .compare_exchange(slot_epoch, SLOT_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let action = self.action.lock().take();
        self.epoch.store(SLOT_FREE, Ordering::Release);
        if let Some(action) = action {
            action();
        }
        true
    }

    /// Install an action into a free slot. Returns false if the slot was
    /// taken by another thread first.
    fn try_push(&self, epoch: u64, action: Action) -> Result<(), Action> {
        if self
            .epoch
            .compare_exchange(SLOT_FREE, SLOT_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(action);
        }
        *self.action.lock() = Some(action);
        self.epoch.store(epoch, Ordering::Release);
        Ok(())
    }

    /// Replace an already-safe action with a new one, running the old action.
    fn try_swap(&self, safe_epoch: u64, epoch: u64, action: Action) -> Result<(), Action> {
        let slot_epoch = self.epoch.load(Ordering::Acquire);
        if slot_epoch >= SLOT_LOCKED || slot_epoch > safe_epoch {
            return Err(action);
        }
        if self
            .epoch
            .compare_exchange(slot_epoch, SLOT_LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(action);
        }
        let old = self.action.lock().replace(action);
        self.epoch.store(epoch, Ordering::Release);
        if let Some(old) = old {
            old();
        }
        Ok(())
    }
}

/// The epoch-protection service. One instance per engine; no globals beyond
/// the per-thread slot id.
pub struct LightEpoch {
    table: Box<[Entry]>,
    current: AtomicU64,
    safe_to_reclaim: AtomicU64,
    drain_list: Box<[DrainSlot]>,
    drain_count: AtomicU32,
}

impl LightEpoch {
    pub fn new() -> Self {
        LightEpoch {
            table: (0..MAX_THREADS).map(|_| Entry::new()).collect(),
            current: AtomicU64::new(1),
            safe_to_reclaim: AtomicU64::new(0),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| DrainSlot::new()).collect(),
            drain_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim.load(Ordering::Acquire)
    }

    /// Enter the protected region, observing the current epoch. Reentrant.
    pub fn protect(&self) -> u64 {
        let entry = &self.table[thread_index()];
        entry.reentrant.fetch_add(1, Ordering::AcqRel);
        let epoch = self.current.load(Ordering::Acquire);
        entry.local_epoch.store(epoch, Ordering::SeqCst);
        epoch
    }

    /// Enter the protected region and run any drainable deferred actions.
    pub fn protect_and_drain(&self) -> u64 {
        let epoch = self.protect();
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.compute_safe_to_reclaim());
        }
        epoch
    }

    /// Re-observe the current epoch without changing the protection count,
    /// then drain. Called from session refresh while protection is held.
    pub fn refresh(&self) -> u64 {
        let entry = &self.table[thread_index()];
        let epoch = self.current.load(Ordering::Acquire);
        entry.local_epoch.store(epoch, Ordering::SeqCst);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.compute_safe_to_reclaim());
        }
        epoch
    }

    /// Leave the protected region.
    pub fn unprotect(&self) {
        let entry = &self.table[thread_index()];
        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            entry.local_epoch.store(UNPROTECTED, Ordering::SeqCst);
        }
    }

    /// Whether the calling thread currently holds protection.
    pub fn is_protected(&self) -> bool {
        self.table[thread_index()].reentrant.load(Ordering::Acquire) > 0
    }

    /// Advance the global epoch.
    pub fn bump_current_epoch(&self) -> u64 {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.compute_safe_to_reclaim();
            self.drain(self.safe_to_reclaim_epoch());
        }
        next
    }

    /// Advance the global epoch and schedule `action` to run once every
    /// thread active at the old epoch has moved past it.
    ///
    /// If the drain list is full after bounded retries the action runs
    /// inline after spinning for the old epoch to become safe; correctness
    /// is preserved at the cost of blocking this caller.
    pub fn bump_current_epoch_with_action<F>(&self, action: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let prior = self.current.fetch_add(1, Ordering::AcqRel);
        let mut action: Action = Box::new(action);

        let mut retries = 0usize;
        loop {
            let safe = self.compute_safe_to_reclaim();
            if safe >= prior {
                // Already safe; run it now.
                action();
                return prior + 1;
            }
            for slot in self.drain_list.iter() {
                match slot.try_push(prior, action) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return prior + 1;
                    }
                    Err(a) => action = a,
                }
                match slot.try_swap(safe, prior, action) {
                    Ok(()) => return prior + 1,
                    Err(a) => action = a,
                }
            }
            retries += 1;
            if retries >= 500 {
                // Drain list saturated: wait out the old epoch and run inline.
                while self.compute_safe_to_reclaim() < prior {
                    std::hint::spin_loop();
                }
                action();
                return prior + 1;
            }
            std::hint::spin_loop();
        }
    }

    /// Run every deferred action whose epoch is at most `safe_epoch`.
    fn drain(&self, safe_epoch: u64) {
        for slot in self.drain_list.iter() {
            if self.drain_count.load(Ordering::Acquire) == 0 {
                break;
            }
            if slot.try_pop(safe_epoch) {
                self.drain_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Recompute the safe-to-reclaim epoch from the thread table.
    pub fn compute_safe_to_reclaim(&self) -> u64 {
        let current = self.current.load(Ordering::Acquire);
        let mut oldest = current;
        for entry in self.table.iter() {
            let epoch = entry.local_epoch.load(Ordering::Acquire);
            if epoch != UNPROTECTED && epoch < oldest {
                oldest = epoch;
            }
        }
        let safe = oldest.saturating_sub(1);
        // Monotonic max.
        let mut seen = self.safe_to_reclaim.load(Ordering::Acquire);
        while safe > seen {
            match self.safe_to_reclaim.compare_exchange(
                seen,
                safe,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return safe,
                Err(actual) => seen = actual,
            }
        }
        seen.max(safe)
    }

    /// Whether every thread active when `epoch` was current has moved on.
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        self.compute_safe_to_reclaim() >= epoch
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn protect_unprotect_round_trip() {
        let epoch = LightEpoch::new();
        assert!(!epoch.is_protected());
        let e = epoch.protect();
        assert!(e >= 1);
        assert!(epoch.is_protected());
        epoch.unprotect();
        assert!(!epoch.is_protected());
    }

    #[test]
    fn reentrant_protection() {
        let epoch = LightEpoch::new();
        epoch.protect();
        epoch.protect();
        epoch.unprotect();
        assert!(epoch.is_protected());
        epoch.unprotect();
        assert!(!epoch.is_protected());
    }

    #[test]
    fn action_runs_after_unprotected_threads_pass() {
        let epoch = Arc::new(LightEpoch::new());
        let fired = Arc::new(AtomicBool::new(false));

        // No thread is protected, so the action may run immediately.
        let f = fired.clone();
        epoch.bump_current_epoch_with_action(move || {
            f.store(true, Ordering::SeqCst);
        });
        epoch.protect_and_drain();
        epoch.unprotect();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn action_deferred_while_a_thread_is_protected() {
        let epoch = Arc::new(LightEpoch::new());
        let fired = Arc::new(AtomicBool::new(false));

        let other = {
            let epoch = epoch.clone();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            let handle = std::thread::spawn(move || {
                epoch.protect();
                ready_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                epoch.unprotect();
            });
            ready_rx.recv().unwrap();
            (handle, release_tx)
        };

        let f = fired.clone();
        epoch.bump_current_epoch_with_action(move || {
            f.store(true, Ordering::SeqCst);
        });
        // The other thread still pins the old epoch.
        epoch.protect_and_drain();
        epoch.unprotect();
        assert!(!fired.load(Ordering::SeqCst));

        other.1.send(()).unwrap();
        other.0.join().unwrap();

        // Now the old epoch is safe and a drain runs the action.
        epoch.bump_current_epoch();
        epoch.protect_and_drain();
        epoch.unprotect();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn safe_epoch_tracks_bumps() {
        let epoch = LightEpoch::new();
        let before = epoch.current_epoch();
        epoch.bump_current_epoch();
        epoch.bump_current_epoch();
        assert_eq!(epoch.current_epoch(), before + 2);
        assert!(epoch.is_safe_to_reclaim(before));
    }
}

//! The log itself: frame ring, tail allocation, and boundary shifts.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::{Address, AtomicAddress, AtomicPageOffset};
use crate::config::{ConfigError, LogConfig};
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::utility::AlignedBuffer;

use super::page_status::{AtomicFullPageStatus, CloseStatus, FlushStatus, FullPageStatus};

/// The log reserves the first bytes of page 0 so that no record ever has
/// address zero (the null address).
pub const FIRST_VALID_OFFSET: u32 = 64;

/// Callback invoked with the newly sealed (or newly evicted) address range.
pub type SealedRangeObserver = Box<dyn Fn(Address, Address) + Send + Sync>;

/// One slot of the frame ring.
struct PageFrame {
    buf: AlignedBuffer,
    status: AtomicFullPageStatus,
}

/// Snapshot of all boundary addresses.
#[derive(Debug, Clone, Copy)]
pub struct LogStats {
    pub begin_address: Address,
    pub head_address: Address,
    pub safe_head_address: Address,
    pub safe_read_only_address: Address,
    pub read_only_address: Address,
    pub flushed_until_address: Address,
    pub tail_address: Address,
}

/// The hybrid log. Owns all page memory and the device handle; raw pointers
/// into pages never escape the unsafe accessors below.
pub struct HybridLog<D: StorageDevice> {
    pub(crate) device: Arc<D>,
    epoch: Arc<LightEpoch>,

    page_size: u32,
    buffer_size: u32,
    num_mutable_pages: u32,

    frames: Box<[PageFrame]>,

    tail: AtomicPageOffset,
    read_only_address: AtomicAddress,
    pub(crate) safe_read_only_address: AtomicAddress,
    head_address: AtomicAddress,
    safe_head_address: AtomicAddress,
    begin_address: AtomicAddress,
    pub(crate) flushed_until_address: AtomicAddress,

    /// Device errors recorded by the flush path, keyed by page.
    pub(crate) flush_errors: Mutex<Vec<(u32, std::io::Error)>>,

    sealed_observer: RwLock<Option<SealedRangeObserver>>,
    evict_observer: RwLock<Option<SealedRangeObserver>>,
}

impl<D: StorageDevice> HybridLog<D> {
    pub fn new(
        config: &LogConfig,
        device: Arc<D>,
        epoch: Arc<LightEpoch>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let page_size = 1u32 << config.page_size_bits;
        let buffer_size = 1u32 << (config.memory_size_bits - config.page_size_bits);
        let num_mutable = ((buffer_size as f64 * config.mutable_fraction) as u32)
            .clamp(1, buffer_size.saturating_sub(1).max(1));

        let mut frames = Vec::with_capacity(buffer_size as usize);
        for _ in 0..buffer_size {
            let buf = AlignedBuffer::zeroed(512, page_size as usize)
                .ok_or(ConfigError::AllocationFailed)?;
            frames.push(PageFrame {
                buf,
                status: AtomicFullPageStatus::new(FullPageStatus::new(
                    FlushStatus::Flushed,
                    CloseStatus::Open,
                )),
            });
        }

        let start = Address::new(0, FIRST_VALID_OFFSET);
        Ok(HybridLog {
            device,
            epoch,
            page_size,
            buffer_size,
            num_mutable_pages: num_mutable,
            frames: frames.into_boxed_slice(),
            tail: AtomicPageOffset::new(0, FIRST_VALID_OFFSET as u64),
            read_only_address: AtomicAddress::new(start),
            safe_read_only_address: AtomicAddress::new(start),
            head_address: AtomicAddress::new(start),
            safe_head_address: AtomicAddress::new(start),
            begin_address: AtomicAddress::new(start),
            flushed_until_address: AtomicAddress::new(start),
            flush_errors: Mutex::new(Vec::new()),
            sealed_observer: RwLock::new(None),
            evict_observer: RwLock::new(None),
        })
    }

    #[inline]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub(crate) fn epoch_handle(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    /// Register the single subscriber notified of each newly sealed
    /// read-only range.
    pub fn set_sealed_observer(&self, observer: SealedRangeObserver) {
        *self.sealed_observer.write() = Some(observer);
    }

    /// Register the eviction hook (read-cache unlinking).
    pub fn set_evict_observer(&self, observer: SealedRangeObserver) {
        *self.evict_observer.write() = Some(observer);
    }

    #[inline]
    pub fn tail_address(&self) -> Address {
        let tail = self.tail.load(Ordering::Acquire);
        if tail.offset() >= self.page_size as u64 {
            Address::new(tail.page() + 1, 0)
        } else {
            Address::new(tail.page(), tail.offset() as u32)
        }
    }

    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.read_only_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.safe_read_only_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn head_address(&self) -> Address {
        self.head_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn safe_head_address(&self) -> Address {
        self.safe_head_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn begin_address(&self) -> Address {
        self.begin_address.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.flushed_until_address.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            begin_address: self.begin_address(),
            head_address: self.head_address(),
            safe_head_address: self.safe_head_address(),
            safe_read_only_address: self.safe_read_only_address(),
            read_only_address: self.read_only_address(),
            flushed_until_address: self.flushed_until_address(),
            tail_address: self.tail_address(),
        }
    }

    /// Whether `address` is memory-resident (at or above Head, below Tail).
    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.head_address() && address < self.tail_address()
    }

    /// Raw pointer to the record bytes at `address`.
    ///
    /// # Safety
    /// `address` must be memory-resident (`contains`), not a read-cache
    /// address, and the caller must hold epoch protection so the page cannot
    /// be evicted underneath it. Mutation through the pointer is only
    /// permitted for addresses at or above ReadOnlyAddress.
    #[inline]
    pub unsafe fn record_ptr(&self, address: Address) -> *mut u8 {
        debug_assert!(!address.in_read_cache());
        debug_assert!(address >= self.safe_head_address());
        debug_assert!(address < self.tail_address());
        let frame = &self.frames[(address.page() % self.buffer_size) as usize];
        frame.buf.as_mut_ptr().add(address.offset() as usize)
    }

    /// Full-page byte view used by the flush path. Only sealed bytes are
    /// meaningful; the caller bounds what it persists.
    pub(crate) fn page_slice(&self, page: u32) -> &[u8] {
        let frame = &self.frames[(page % self.buffer_size) as usize];
        // SAFETY: the buffer is owned and page_size bytes long; flush only
        // touches pages at or below ReadOnly, which no longer mutate.
        unsafe { std::slice::from_raw_parts(frame.buf.as_ptr(), self.page_size as usize) }
    }

    /// Reserve `num_bytes` at the tail.
    ///
    /// Returns `None` when the reservation overflowed the current page; the
    /// crossing thread closes the page and opens the next one, and every
    /// caller retries after an epoch refresh. Never spins internally.
    pub fn try_allocate(self: &Arc<Self>, num_bytes: u32) -> Option<Address> {
        debug_assert!(num_bytes > 0 && num_bytes <= self.page_size);
        let reserved = self.tail.reserve(num_bytes);
        let start = reserved.offset();
        if start + num_bytes as u64 <= self.page_size as u64 {
            return Some(Address::new(reserved.page(), start as u32));
        }
        // Every blocked thread helps close the page; the open is idempotent
        // and gated on the recycled frame being flushed and evicted.
        self.close_page_and_open_next(reserved.page());
        None
    }

    /// Advance the tail to the next page once its frame can be recycled.
    fn close_page_and_open_next(self: &Arc<Self>, old_page: u32) {
        let new_page = old_page + 1;
        if new_page >= self.buffer_size {
            // The frame for new_page still holds page new_page - buffer_size.
            let recycled_page = new_page - self.buffer_size;
            let required_head = Address::new(recycled_page + 1, 0);
            if self.flushed_until_address() < required_head {
                // Cannot evict unflushed data; push the sealed frontier out
                // and let the flush catch up.
                self.shift_read_only_address(required_head);
                return;
            }
            if self.head_address() < required_head {
                self.shift_head_address(required_head);
                return;
            }
            if self.safe_head_address() < required_head {
                // Eviction is waiting on the epoch; callers refresh.
                return;
            }
        }

        let (_, won) = self.tail.try_new_page(old_page);
        if !won {
            return;
        }
        let frame = &self.frames[(new_page % self.buffer_size) as usize];
        // SAFETY: safe_head has passed the page previously in this frame,
        // so no protected thread can still read it.
        unsafe { frame.buf.clear() };
        frame.status.store(
            FullPageStatus::new(FlushStatus::Dirty, CloseStatus::Open),
            Ordering::Release,
        );
        tracing::debug!(page = new_page, "opened log page");

        // Keep the in-memory mutable region at its configured width.
        if new_page >= self.num_mutable_pages {
            let desired = Address::new(new_page - self.num_mutable_pages + 1, 0);
            self.shift_read_only_address(desired);
        }
    }

    /// Monotonically advance ReadOnlyAddress. On advance, registers an epoch
    /// action that bumps SafeReadOnly, notifies the sealed-range subscriber,
    /// and flushes the sealed pages.
    pub fn shift_read_only_address(self: &Arc<Self>, desired: Address) -> bool {
        let desired = desired.min(self.tail_address());
        if !self.read_only_address.bump_to(desired, Ordering::AcqRel) {
            return false;
        }
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.on_pages_sealed(desired);
        });
        true
    }

    /// Seal everything up to the current tail. Returns the sealed tail.
    pub fn shift_read_only_to_tail(self: &Arc<Self>) -> Address {
        let tail = self.tail_address();
        self.shift_read_only_address(tail);
        tail
    }

    fn on_pages_sealed(&self, until: Address) {
        let old_safe = self.safe_read_only_address();
        if !self.safe_read_only_address.bump_to(until, Ordering::AcqRel) {
            return;
        }
        if let Some(observer) = self.sealed_observer.read().as_ref() {
            observer(old_safe, until);
        }
        if let Err(error) = self.flush_until(until) {
            tracing::error!(%error, until = ?until, "flush of sealed pages failed");
        }
    }

    /// Monotonically advance HeadAddress, clamped to FlushedUntil (unflushed
    /// data is never evicted). The epoch action bumps SafeHead and runs the
    /// eviction hook over the vacated range.
    pub fn shift_head_address(self: &Arc<Self>, desired: Address) -> bool {
        let desired = desired.min(self.flushed_until_address());
        if !self.head_address.bump_to(desired, Ordering::AcqRel) {
            return false;
        }
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.on_pages_evicted(desired);
        });
        true
    }

    fn on_pages_evicted(&self, until: Address) {
        let old_safe = self.safe_head_address();
        if !self.safe_head_address.bump_to(until, Ordering::AcqRel) {
            return;
        }
        if let Some(observer) = self.evict_observer.read().as_ref() {
            observer(old_safe, until);
        }
        // Frames wholly below the new safe head are recyclable.
        for page in old_safe.page()..until.page() {
            let frame = &self.frames[(page % self.buffer_size) as usize];
            frame.status.store(
                FullPageStatus::new(FlushStatus::Flushed, CloseStatus::Closed),
                Ordering::Release,
            );
        }
        tracing::debug!(until = ?until, "evicted log pages");
    }

    /// Advance BeginAddress (truncation). Head and ReadOnly are dragged
    /// along if they lag; the device is truncated once the epoch drains.
    /// The advance is clamped to HeadAddress so that only non-resident data
    /// is ever truncated in one step.
    pub fn shift_begin_address(self: &Arc<Self>, desired: Address) -> bool {
        let desired = desired.min(self.head_address());
        if !self.begin_address.bump_to(desired, Ordering::AcqRel) {
            return false;
        }
        self.shift_read_only_address(desired);
        self.shift_head_address(desired);
        let log = Arc::clone(self);
        self.epoch.bump_current_epoch_with_action(move || {
            log.truncate_device(desired);
        });
        true
    }

    fn truncate_device(&self, until: Address) {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(error) => {
                tracing::error!(%error, "runtime for device truncation");
                return;
            }
        };
        if let Err(error) = rt.block_on(self.device.truncate_until(until.control())) {
            tracing::warn!(%error, until = ?until, "device truncation failed");
        }
    }

    /// First address of the page following `address`'s page.
    pub fn next_page_start(&self, address: Address) -> Address {
        Address::new(address.page() + 1, 0)
    }
}

// SAFETY: page frames are raw shared memory deliberately accessed from many
// threads; the boundary protocol (epoch-protected head/tail checks) is what
// makes that sound, as in the record_ptr contract.
unsafe impl<D: StorageDevice> Send for HybridLog<D> {}
unsafe impl<D: StorageDevice> Sync for HybridLog<D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn test_log(page_bits: u32, memory_bits: u32) -> Arc<HybridLog<MemoryDevice>> {
        let config = LogConfig {
            page_size_bits: page_bits,
            memory_size_bits: memory_bits,
            mutable_fraction: 0.5,
            segment_size_bits: 30,
        };
        let epoch = Arc::new(LightEpoch::new());
        Arc::new(HybridLog::new(&config, Arc::new(MemoryDevice::new()), epoch).unwrap())
    }

    #[test]
    fn fresh_log_boundaries() {
        let log = test_log(12, 16);
        let stats = log.stats();
        let start = Address::new(0, FIRST_VALID_OFFSET);
        assert_eq!(stats.begin_address, start);
        assert_eq!(stats.head_address, start);
        assert_eq!(stats.read_only_address, start);
        assert_eq!(stats.tail_address, start);
        assert_eq!(log.buffer_size(), 16);
    }

    #[test]
    fn allocate_advances_tail() {
        let log = test_log(12, 16);
        let a = log.try_allocate(64).unwrap();
        let b = log.try_allocate(64).unwrap();
        assert_eq!(a, Address::new(0, FIRST_VALID_OFFSET));
        assert_eq!(b, Address::new(0, FIRST_VALID_OFFSET + 64));
        assert_eq!(log.tail_address(), Address::new(0, FIRST_VALID_OFFSET + 128));
    }

    #[test]
    fn page_overflow_returns_none_then_succeeds() {
        let log = test_log(12, 16); // 4 KiB pages
        // Fill page 0.
        let mut allocated = 0u32;
        while allocated + 512 <= (1 << 12) - FIRST_VALID_OFFSET {
            log.try_allocate(512).unwrap();
            allocated += 512;
        }
        // Next allocation crosses the page.
        assert!(log.try_allocate(512).is_none());
        // After the crossing thread opened page 1, allocation succeeds.
        let addr = log.try_allocate(512).unwrap();
        assert_eq!(addr.page(), 1);
        assert_eq!(addr.offset(), 0);
    }

    #[test]
    fn boundaries_stay_ordered_across_page_rollovers() {
        let log = test_log(9, 13); // 512 B pages, 16 frames
        for _ in 0..2000 {
            if log.try_allocate(48).is_none() {
                // Emulate a session refresh so epoch actions drain.
                log.epoch.protect_and_drain();
                log.epoch.unprotect();
            }
            let s = log.stats();
            assert!(s.begin_address <= s.head_address);
            assert!(s.head_address <= s.read_only_address);
            assert!(s.read_only_address <= s.tail_address);
            assert!(s.safe_head_address <= s.head_address);
            assert!(s.safe_read_only_address <= s.read_only_address);
        }
    }

    #[test]
    fn shift_read_only_to_tail_seals_and_flushes() {
        let log = test_log(12, 16);
        for _ in 0..8 {
            log.try_allocate(128).unwrap();
        }
        let sealed = log.shift_read_only_to_tail();
        // No thread holds protection, so the epoch action ran inline.
        assert_eq!(log.read_only_address(), sealed);
        assert_eq!(log.safe_read_only_address(), sealed);
        assert_eq!(log.flushed_until_address(), sealed);
    }

    #[test]
    fn sealed_observer_sees_range() {
        use std::sync::atomic::{AtomicU64, Ordering as O};
        let log = test_log(12, 16);
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        log.set_sealed_observer(Box::new(move |_old, new| {
            seen2.store(new.control(), O::SeqCst);
        }));
        log.try_allocate(256).unwrap();
        let sealed = log.shift_read_only_to_tail();
        assert_eq!(seen.load(O::SeqCst), sealed.control());
    }

    #[test]
    fn head_cannot_pass_flushed_until() {
        let log = test_log(12, 16);
        log.try_allocate(256).unwrap();
        let tail = log.tail_address();
        // Nothing flushed yet: head stays put.
        log.shift_head_address(tail);
        assert_eq!(log.head_address(), Address::new(0, FIRST_VALID_OFFSET));
        // After sealing + flushing, head can advance.
        log.shift_read_only_to_tail();
        log.shift_head_address(tail);
        assert_eq!(log.head_address(), tail);
    }

    #[test]
    fn begin_shift_drags_lagging_boundaries() {
        let log = test_log(12, 16);
        for _ in 0..16 {
            log.try_allocate(200).unwrap();
        }
        let cutoff = log.shift_read_only_to_tail();
        log.shift_head_address(cutoff);
        log.shift_begin_address(cutoff);
        let s = log.stats();
        assert_eq!(s.begin_address, cutoff);
        assert!(s.begin_address <= s.head_address);
        assert!(s.head_address <= s.read_only_address);
    }
}

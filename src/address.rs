//! Logical addresses into the hybrid log.
//!
//! An address is 48 bits: the upper 23 bits select a page and the lower 25
//! bits an offset within it. Bit 47 is reserved to mark addresses that point
//! into the read cache instead of the main log; such addresses must be
//! stripped before page/offset arithmetic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of offset bits within a page. Fixed by the address layout; the
/// allocator's configured page size may be smaller, in which case offsets
/// simply never exceed it.
pub const OFFSET_BITS: u32 = 25;
/// Number of page-index bits.
pub const PAGE_BITS: u32 = 23;
/// Total significant address bits.
pub const ADDRESS_BITS: u32 = 48;

const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const PAGE_MASK: u64 = (1 << PAGE_BITS) - 1;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

/// High bit marking an address as pointing into the read cache.
pub const READ_CACHE_BIT: u64 = 1 << (ADDRESS_BITS - 1);

/// A 48-bit logical address into the log (or the read cache).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The null address. No record is ever written at offset 0 of page 0;
    /// the log reserves the first 64 bytes.
    pub const INVALID: Address = Address(0);

    #[inline]
    pub const fn new(page: u32, offset: u32) -> Self {
        Address(((page as u64 & PAGE_MASK) << OFFSET_BITS) | (offset as u64 & OFFSET_MASK))
    }

    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Address(control & ADDRESS_MASK)
    }

    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    /// Page index. The read-cache bit, if set, must be stripped first.
    #[inline]
    pub const fn page(self) -> u32 {
        ((self.0 >> OFFSET_BITS) & PAGE_MASK) as u32
    }

    #[inline]
    pub const fn offset(self) -> u32 {
        (self.0 & OFFSET_MASK) as u32
    }

    #[inline]
    pub const fn in_read_cache(self) -> bool {
        self.0 & READ_CACHE_BIT != 0
    }

    /// The same address with the read-cache bit set.
    #[inline]
    pub const fn with_read_cache(self) -> Self {
        Address(self.0 | READ_CACHE_BIT)
    }

    /// The same address with the read-cache bit cleared.
    #[inline]
    pub const fn strip_read_cache(self) -> Self {
        Address(self.0 & !READ_CACHE_BIT)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(
                f,
                "Address(rc:{}:{})",
                self.strip_read_cache().page(),
                self.offset()
            )
        } else {
            write!(f, "Address({}:{})", self.page(), self.offset())
        }
    }
}

/// Atomically updatable address.
#[derive(Debug, Default)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    pub const fn new(address: Address) -> Self {
        AtomicAddress(AtomicU64::new(address.control()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Address {
        Address::from_control(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, address: Address, order: Ordering) {
        self.0.store(address.control(), order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Address, Address> {
        self.0
            .compare_exchange(current.control(), new.control(), success, failure)
            .map(Address::from_control)
            .map_err(Address::from_control)
    }

    /// Monotonically raise the stored address to at least `value`.
    /// Returns true if this call performed the advance.
    pub fn bump_to(&self, value: Address, order: Ordering) -> bool {
        let mut current = self.load(Ordering::Acquire);
        while value > current {
            match self.compare_exchange(current, value, order, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

/// Packed (page, offset) word used for the log tail.
///
/// The offset field is wider than a page (41 bits) so concurrent fetch-add
/// reservations that overflow the page cannot corrupt the page field; the
/// overflowing reservations are simply discarded and retried on the next
/// page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageOffset(u64);

const PO_OFFSET_BITS: u32 = 41;
const PO_OFFSET_MASK: u64 = (1 << PO_OFFSET_BITS) - 1;

impl PageOffset {
    #[inline]
    pub const fn new(page: u32, offset: u64) -> Self {
        PageOffset(((page as u64) << PO_OFFSET_BITS) | (offset & PO_OFFSET_MASK))
    }

    #[inline]
    pub const fn page(self) -> u32 {
        (self.0 >> PO_OFFSET_BITS) as u32
    }

    /// Reserved offset. May exceed the page size; such reservations lost the
    /// page and must retry.
    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & PO_OFFSET_MASK
    }

    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    /// Interpret as a log address. Only valid when the offset fits a page.
    #[inline]
    pub fn address(self) -> Address {
        debug_assert!(self.offset() <= (1 << OFFSET_BITS) - 1);
        Address::new(self.page(), self.offset() as u32)
    }
}

/// Atomic tail pointer of the log.
#[derive(Debug)]
pub struct AtomicPageOffset(AtomicU64);

impl AtomicPageOffset {
    pub const fn new(page: u32, offset: u64) -> Self {
        AtomicPageOffset(AtomicU64::new(PageOffset::new(page, offset).control()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> PageOffset {
        PageOffset(self.0.load(order))
    }

    /// Reserve `num_bytes` at the tail. Returns the pre-reservation value;
    /// the caller checks whether its slice fits the page.
    #[inline]
    pub fn reserve(&self, num_bytes: u32) -> PageOffset {
        PageOffset(self.0.fetch_add(num_bytes as u64, Ordering::AcqRel))
    }

    /// Attempt to advance the tail from `old_page` to `old_page + 1`,
    /// offset 0. Returns (advanced, won) where `advanced` says whether the
    /// tail now sits past `old_page` (by us or someone else) and `won` says
    /// whether this call performed the advance.
    pub fn try_new_page(&self, old_page: u32) -> (bool, bool) {
        let current = PageOffset(self.0.load(Ordering::Acquire));
        if current.page() > old_page {
            return (true, false);
        }
        let desired = PageOffset::new(old_page + 1, 0);
        match self.0.compare_exchange(
            current.control(),
            desired.control(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => (true, true),
            Err(actual) => (PageOffset(actual).page() > old_page, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let a = Address::new(7, 1234);
        assert_eq!(a.page(), 7);
        assert_eq!(a.offset(), 1234);
        assert_eq!(Address::from_control(a.control()), a);
    }

    #[test]
    fn read_cache_bit_round_trip() {
        let a = Address::new(3, 99);
        let rc = a.with_read_cache();
        assert!(rc.in_read_cache());
        assert!(!a.in_read_cache());
        assert_eq!(rc.strip_read_cache(), a);
    }

    #[test]
    fn ordering_follows_pages_then_offsets() {
        assert!(Address::new(0, 10) < Address::new(0, 11));
        assert!(Address::new(0, u32::MAX >> 7) < Address::new(1, 0));
        assert!(Address::INVALID < Address::new(0, 64));
    }

    #[test]
    fn bump_to_is_monotonic() {
        let a = AtomicAddress::new(Address::new(1, 0));
        assert!(a.bump_to(Address::new(2, 0), Ordering::AcqRel));
        assert!(!a.bump_to(Address::new(1, 50), Ordering::AcqRel));
        assert_eq!(a.load(Ordering::Acquire), Address::new(2, 0));
    }

    #[test]
    fn reserve_overflows_into_offset_bits_only() {
        let tail = AtomicPageOffset::new(5, (1 << OFFSET_BITS) - 8);
        let before = tail.reserve(64);
        assert_eq!(before.page(), 5);
        // The reservation crossed the page; page field is intact.
        let after = tail.load(Ordering::Acquire);
        assert_eq!(after.page(), 5);
        assert!(after.offset() > (1 << OFFSET_BITS) - 1);
    }

    #[test]
    fn new_page_single_winner() {
        let tail = AtomicPageOffset::new(5, 123456);
        let (advanced, won) = tail.try_new_page(5);
        assert!(advanced && won);
        let (advanced, won) = tail.try_new_page(5);
        assert!(advanced && !won);
        assert_eq!(tail.load(Ordering::Acquire), PageOffset::new(6, 0));
    }
}

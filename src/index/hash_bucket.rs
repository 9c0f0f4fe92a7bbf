//! Bucket layout and the packed entry words.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::CACHE_LINE_BYTES;

/// Number of tag bits stored per entry.
pub const TAG_BITS: u32 = 14;
const TAG_SHIFT: u32 = 48;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const ADDRESS_MASK: u64 = (1 << 48) - 1;
const TENTATIVE_BIT: u64 = 1 << 63;

/// A key hash split into bucket-selecting bits (low) and a tag (high).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KeyHash(u64);

impl KeyHash {
    #[inline]
    pub const fn new(hash: u64) -> Self {
        KeyHash(hash)
    }

    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    /// Bucket index within a table of `table_size` buckets (a power of two).
    #[inline]
    pub const fn table_index(self, table_size: u64) -> u64 {
        self.0 & (table_size - 1)
    }

    #[inline]
    pub const fn tag(self) -> u16 {
        ((self.0 >> (64 - TAG_BITS)) & TAG_MASK) as u16
    }
}

/// Packed bucket entry: 48-bit address (read-cache bit included), 14-bit
/// tag, tentative bit. The all-zero word means "unused".
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HashBucketEntry(u64);

impl HashBucketEntry {
    pub const UNUSED: HashBucketEntry = HashBucketEntry(0);

    #[inline]
    pub fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & ADDRESS_MASK;
        control |= ((tag as u64) & TAG_MASK) << TAG_SHIFT;
        if tentative {
            control |= TENTATIVE_BIT;
        }
        HashBucketEntry(control)
    }

    #[inline]
    pub const fn from_control(control: u64) -> Self {
        HashBucketEntry(control)
    }

    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    /// Address field; may carry the read-cache bit.
    #[inline]
    pub const fn address(self) -> Address {
        Address::from_control(self.0 & ADDRESS_MASK)
    }

    #[inline]
    pub const fn tag(self) -> u16 {
        ((self.0 >> TAG_SHIFT) & TAG_MASK) as u16
    }

    #[inline]
    pub const fn is_tentative(self) -> bool {
        self.0 & TENTATIVE_BIT != 0
    }

    /// The same entry with the tentative bit cleared.
    #[inline]
    pub const fn finalized(self) -> Self {
        HashBucketEntry(self.0 & !TENTATIVE_BIT)
    }
}

/// Atomically updatable bucket entry.
#[derive(Debug, Default)]
pub struct AtomicHashBucketEntry(AtomicU64);

impl AtomicHashBucketEntry {
    #[inline]
    pub fn load(&self, order: Ordering) -> HashBucketEntry {
        HashBucketEntry(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, entry: HashBucketEntry, order: Ordering) {
        self.0.store(entry.control(), order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: HashBucketEntry,
        new: HashBucketEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<HashBucketEntry, HashBucketEntry> {
        self.0
            .compare_exchange(current.control(), new.control(), success, failure)
            .map(HashBucketEntry)
            .map_err(HashBucketEntry)
    }
}

/// Link from a bucket to its overflow bucket: pool index + 1, or 0 for none.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct OverflowEntry(u64);

impl OverflowEntry {
    pub const UNUSED: OverflowEntry = OverflowEntry(0);

    #[inline]
    pub const fn new(pool_index: u32) -> Self {
        OverflowEntry(pool_index as u64 + 1)
    }

    #[inline]
    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    /// Pool index of the linked bucket. Only valid when used.
    #[inline]
    pub const fn pool_index(self) -> u32 {
        debug_assert!(self.0 != 0);
        (self.0 - 1) as u32
    }
}

#[derive(Debug, Default)]
pub struct AtomicOverflowEntry(AtomicU64);

impl AtomicOverflowEntry {
    #[inline]
    pub fn load(&self, order: Ordering) -> OverflowEntry {
        OverflowEntry(self.0.load(order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: OverflowEntry,
        new: OverflowEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<OverflowEntry, OverflowEntry> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(OverflowEntry)
            .map_err(OverflowEntry)
    }

    #[inline]
    pub fn store(&self, entry: OverflowEntry, order: Ordering) {
        self.0.store(entry.0, order);
    }
}

/// One cache line: seven tagged entries and an overflow link.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct HashBucket {
    pub entries: [AtomicHashBucketEntry; HashBucket::NUM_ENTRIES],
    pub overflow: AtomicOverflowEntry,
}

impl HashBucket {
    pub const NUM_ENTRIES: usize = 7;
}

const _: () = assert!(std::mem::size_of::<HashBucket>() == CACHE_LINE_BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip() {
        let addr = Address::new(9, 4096);
        let entry = HashBucketEntry::new(addr, 0x1fff, true);
        assert_eq!(entry.address(), addr);
        assert_eq!(entry.tag(), 0x1fff);
        assert!(entry.is_tentative());
        assert!(!entry.finalized().is_tentative());
        assert_eq!(entry.finalized().address(), addr);
    }

    #[test]
    fn read_cache_address_survives_packing() {
        let addr = Address::new(2, 128).with_read_cache();
        let entry = HashBucketEntry::new(addr, 7, false);
        assert!(entry.address().in_read_cache());
        assert_eq!(entry.address().strip_read_cache(), Address::new(2, 128));
    }

    #[test]
    fn zero_word_is_unused() {
        assert!(HashBucketEntry::UNUSED.is_unused());
        assert!(!HashBucketEntry::new(Address::new(0, 64), 1, false).is_unused());
    }

    #[test]
    fn tag_comes_from_high_bits() {
        let h = KeyHash::new(0xabcd_0000_0000_1234);
        assert_eq!(h.tag(), (0xabcd_0000_0000_1234u64 >> 50) as u16);
        assert_eq!(h.table_index(1024), 0x1234 & 1023);
    }

    #[test]
    fn overflow_entry_distinguishes_index_zero() {
        let none = OverflowEntry::UNUSED;
        let zero = OverflowEntry::new(0);
        assert!(none.is_unused());
        assert!(!zero.is_unused());
        assert_eq!(zero.pool_index(), 0);
    }
}

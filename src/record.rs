//! Record layout and header bit manipulation.
//!
//! A record is `{ header, key, value }` laid out contiguously in log (or
//! read-cache, or device) memory. The header packs the previous-chain
//! address, the CPR version that created the record, and the
//! invalid/tombstone flags into one atomically-updatable word.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::utility::{murmur3_finalize, pad_alignment};

/// Keys are fixed-size, blittable values hashed to 64 bits.
///
/// `Copy` is required so records can be re-materialized from device bytes
/// without running destructors.
pub trait Key: Copy + PartialEq + Send + Sync + 'static {
    /// 64-bit hash of the key. Equal keys must hash equally; the index uses
    /// the upper bits as a tag and the lower bits for bucket selection, so
    /// the hash should avalanche well.
    fn hash_code(&self) -> u64;
}

/// Values are fixed-size, blittable payloads. The engine never interprets
/// value bytes beyond copying them.
pub trait Value: Copy + Send + Sync + 'static {}

impl<T: Copy + Send + Sync + 'static> Value for T {}

macro_rules! impl_int_key {
    ($($t:ty),*) => {
        $(impl Key for $t {
            #[inline]
            fn hash_code(&self) -> u64 {
                murmur3_finalize(*self as u64)
            }
        })*
    };
}

impl_int_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<const N: usize> Key for [u8; N] {
    fn hash_code(&self) -> u64 {
        let mut h = 0xcbf29ce484222325u64;
        for &b in self.iter() {
            h = (h ^ b as u64).wrapping_mul(0x100000001b3);
        }
        murmur3_finalize(h)
    }
}

const PREV_ADDRESS_MASK: u64 = (1 << 48) - 1;
const VERSION_SHIFT: u32 = 48;
const VERSION_MASK: u64 = (1 << 13) - 1;
const INVALID_BIT: u64 = 1 << 61;
const TOMBSTONE_BIT: u64 = 1 << 62;

/// Packed record header.
///
/// Bits 0..48: previous address (back-reference only, strictly decreasing
/// along a chain). Bits 48..61: CPR version. Bit 61: invalid (superseded or
/// failed insert). Bit 62: tombstone. Bit 63: reserved.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RecordInfo(u64);

impl RecordInfo {
    pub fn new(version: u32, previous_address: Address, tombstone: bool) -> Self {
        let mut control = previous_address.control() & PREV_ADDRESS_MASK;
        control |= ((version as u64) & VERSION_MASK) << VERSION_SHIFT;
        if tombstone {
            control |= TOMBSTONE_BIT;
        }
        RecordInfo(control)
    }

    #[inline]
    pub const fn from_control(control: u64) -> Self {
        RecordInfo(control)
    }

    #[inline]
    pub const fn control(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn previous_address(self) -> Address {
        Address::from_control(self.0 & PREV_ADDRESS_MASK)
    }

    /// CPR version, truncated to 13 bits (comparisons use the same
    /// truncation on both sides).
    #[inline]
    pub const fn version(self) -> u32 {
        ((self.0 >> VERSION_SHIFT) & VERSION_MASK) as u32
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 & INVALID_BIT != 0
    }

    #[inline]
    pub const fn is_tombstone(self) -> bool {
        self.0 & TOMBSTONE_BIT != 0
    }

    #[inline]
    pub const fn with_invalid(self) -> Self {
        RecordInfo(self.0 | INVALID_BIT)
    }

    #[inline]
    pub const fn with_tombstone(self) -> Self {
        RecordInfo(self.0 | TOMBSTONE_BIT)
    }
}

const _: () = assert!(mem::size_of::<RecordInfo>() == 8);

/// Truncate a session version the same way the header stores it.
#[inline]
pub const fn truncate_version(version: u32) -> u32 {
    version & VERSION_MASK as u32
}

/// A record as it lives in log memory. Accessed through raw pointers owned
/// by the allocators; references derived from them are short-lived.
#[repr(C)]
pub struct Record<K: Key, V: Value> {
    header: AtomicU64,
    pub key: K,
    pub value: V,
}

impl<K: Key, V: Value> Record<K, V> {
    /// Allocation size of one record, padded to 8 bytes so headers stay
    /// aligned.
    pub const fn size() -> u32 {
        pad_alignment(mem::size_of::<Self>(), 8) as u32
    }

    #[inline]
    pub fn info(&self) -> RecordInfo {
        RecordInfo::from_control(self.header.load(Ordering::Acquire))
    }

    /// Mark the record superseded/failed. Used when a CAS into the index
    /// loses and the freshly written record must be discarded in place.
    #[inline]
    pub fn set_invalid(&self) {
        self.header.fetch_or(INVALID_BIT, Ordering::AcqRel);
    }

    /// Flag a live in-place record as deleted.
    #[inline]
    pub fn set_tombstone(&self) {
        self.header.fetch_or(TOMBSTONE_BIT, Ordering::AcqRel);
    }

    /// Write a fresh record into raw log memory.
    ///
    /// # Safety
    /// `dst` must point to at least `Record::<K, V>::size()` writable bytes,
    /// 8-byte aligned, not concurrently accessed until the enclosing index
    /// entry is published.
    pub unsafe fn initialize(dst: *mut u8, info: RecordInfo, key: K, value: V) -> *mut Self {
        let record = dst as *mut Self;
        ptr::write(
            record,
            Record {
                header: AtomicU64::new(info.control()),
                key,
                value,
            },
        );
        record
    }

    /// Write a tombstone record: header and key only, value bytes zeroed.
    ///
    /// # Safety
    /// Same contract as [`Record::initialize`].
    pub unsafe fn initialize_tombstone(dst: *mut u8, info: RecordInfo, key: K) -> *mut Self {
        let record = dst as *mut Self;
        ptr::write_bytes(dst, 0, Self::size() as usize);
        ptr::addr_of_mut!((*record).header).write(AtomicU64::new(info.with_tombstone().control()));
        ptr::addr_of_mut!((*record).key).write(key);
        record
    }

    /// Copy a record out of raw bytes fetched from the device. Unaligned
    /// sources are fine; the result is an owned bit copy.
    ///
    /// # Safety
    /// `src` must hold at least `Record::<K, V>::size()` bytes of a record
    /// previously written by this engine.
    pub unsafe fn read_from(src: *const u8) -> Self {
        ptr::read_unaligned(src as *const Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bit_layout() {
        let prev = Address::new(12, 345);
        let info = RecordInfo::new(7, prev, false);
        assert_eq!(info.previous_address(), prev);
        assert_eq!(info.version(), 7);
        assert!(!info.is_tombstone());
        assert!(!info.is_invalid());

        let dead = info.with_tombstone();
        assert!(dead.is_tombstone());
        assert_eq!(dead.previous_address(), prev);

        let gone = info.with_invalid();
        assert!(gone.is_invalid());
        assert_eq!(gone.version(), 7);
    }

    #[test]
    fn version_truncates_to_13_bits() {
        let info = RecordInfo::new((1 << 13) + 5, Address::INVALID, false);
        assert_eq!(info.version(), 5);
        assert_eq!(truncate_version((1 << 13) + 5), 5);
    }

    #[test]
    fn record_size_is_padded() {
        assert_eq!(Record::<u64, u64>::size() % 8, 0);
        assert!(Record::<u64, u64>::size() >= 24);
        assert_eq!(Record::<u32, [u8; 3]>::size() % 8, 0);
    }

    #[test]
    fn initialize_and_read_back() {
        // u64 backing keeps the buffer 8-byte aligned.
        let mut buf = vec![0u64; Record::<u64, u64>::size() as usize / 8];
        let info = RecordInfo::new(1, Address::new(2, 64), false);
        let record =
            unsafe { Record::<u64, u64>::initialize(buf.as_mut_ptr() as *mut u8, info, 42, 84) };
        let record = unsafe { &*record };
        assert_eq!(record.key, 42);
        assert_eq!(record.value, 84);
        assert_eq!(record.info().previous_address(), Address::new(2, 64));

        record.set_invalid();
        assert!(record.info().is_invalid());
    }

    #[test]
    fn tombstone_init_zeroes_value() {
        let mut buf = vec![u64::MAX; Record::<u64, u64>::size() as usize / 8];
        let info = RecordInfo::new(3, Address::INVALID, false);
        let record = unsafe {
            Record::<u64, u64>::initialize_tombstone(buf.as_mut_ptr() as *mut u8, info, 9)
        };
        let record = unsafe { &*record };
        assert!(record.info().is_tombstone());
        assert_eq!(record.key, 9);
        assert_eq!(record.value, 0);
    }

    #[test]
    fn int_keys_hash_distinctly() {
        assert_ne!(1u64.hash_code(), 2u64.hash_code());
        assert_ne!([1u8, 2, 3].hash_code(), [3u8, 2, 1].hash_code());
    }
}

//! The main bucket array.

use crate::utility::is_power_of_two;

use super::hash_bucket::{HashBucket, KeyHash};

/// A fixed, power-of-two-sized array of buckets. Two of these exist per
/// index so growth can build the next size while the current one serves.
pub struct HashTable {
    buckets: Box<[HashBucket]>,
}

impl HashTable {
    /// An empty placeholder (the inactive table before the first grow).
    pub fn empty() -> Self {
        HashTable {
            buckets: Box::new([]),
        }
    }

    /// Allocate `size` zeroed buckets. `size` must be a power of two.
    pub fn new(size: u64) -> Self {
        assert!(is_power_of_two(size), "hash table size must be a power of two");
        HashTable {
            buckets: (0..size).map(|_| HashBucket::default()).collect(),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.buckets.len() as u64
    }

    #[inline]
    pub fn bucket(&self, index: u64) -> &HashBucket {
        &self.buckets[index as usize]
    }

    /// Bucket for `hash` in this table.
    #[inline]
    pub fn bucket_for(&self, hash: KeyHash) -> &HashBucket {
        self.bucket(hash.table_index(self.size()))
    }

    /// Reset to the empty placeholder, dropping all buckets.
    pub fn clear(&mut self) {
        self.buckets = Box::new([]);
    }
}

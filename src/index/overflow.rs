//! Overflow bucket pool.
//!
//! Buckets that fill their seven slots chain into buckets allocated here.
//! Each bucket is boxed so its address stays stable while the pool vector
//! grows; links between buckets store pool indices, never pointers.

use parking_lot::Mutex;

use super::hash_bucket::HashBucket;

pub struct OverflowPool {
    buckets: Mutex<Vec<Box<HashBucket>>>,
    free: Mutex<Vec<u32>>,
}

impl OverflowPool {
    pub fn new() -> Self {
        OverflowPool {
            buckets: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a zeroed overflow bucket, reusing a freed slot if possible.
    /// Returns the pool index and a stable pointer to the bucket.
    pub fn allocate(&self) -> (u32, *const HashBucket) {
        if let Some(index) = self.free.lock().pop() {
            let buckets = self.buckets.lock();
            let ptr: *const HashBucket = &*buckets[index as usize];
            return (index, ptr);
        }
        let mut buckets = self.buckets.lock();
        let index = buckets.len() as u32;
        buckets.push(Box::default());
        let ptr: *const HashBucket = &*buckets[index as usize];
        (index, ptr)
    }

    /// Return a bucket that lost its installation CAS. The bucket must not
    /// be reachable from any chain.
    pub fn deallocate(&self, index: u32) {
        self.free.lock().push(index);
    }

    /// Stable pointer to the bucket at `index`.
    pub fn bucket_ptr(&self, index: u32) -> Option<*const HashBucket> {
        let buckets = self.buckets.lock();
        buckets.get(index as usize).map(|b| &**b as *const HashBucket)
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every bucket. Only valid while no chain references the pool
    /// (table swap during grow).
    pub fn clear(&self) {
        self.buckets.lock().clear();
        self.free.lock().clear();
    }
}

impl Default for OverflowPool {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: bucket contents are atomics; the vectors are lock-protected and
// pointers handed out remain valid until clear(), which callers only invoke
// once the table generation is unreachable.
unsafe impl Send for OverflowPool {}
unsafe impl Sync for OverflowPool {}

//! The lock-free hash index.
//!
//! A power-of-two array of 64-byte buckets maps key hashes to the logical
//! address of the newest record for that hash chain. Buckets overflow into a
//! side pool; all mutation is CAS-based.

mod grow;
mod hash_bucket;
mod hash_table;
mod mem_index;
mod overflow;

pub use grow::{calculate_num_chunks, get_chunk_bounds, GrowState, HASH_TABLE_CHUNK_SIZE};
pub use hash_bucket::{
    AtomicHashBucketEntry, AtomicOverflowEntry, HashBucket, HashBucketEntry, KeyHash,
    OverflowEntry,
};
pub use hash_table::HashTable;
pub use mem_index::{IndexSlot, IndexStats, MemHashIndex};
pub use overflow::OverflowPool;

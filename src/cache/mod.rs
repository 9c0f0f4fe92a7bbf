//! The read cache: a secondary record arena for copies of on-disk records.

mod read_cache;

pub use read_cache::{CacheStats, ReadCache};

//! Online log compaction.

mod compact;

pub use compact::CompactionStats;

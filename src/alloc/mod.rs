//! The hybrid-log page allocator.
//!
//! An append-only 48-bit address space backed by a bounded ring of in-memory
//! page frames. Pages move through mutable → read-only → flushed → evicted
//! states as the Begin/Head/ReadOnly/Tail boundaries advance monotonically.

mod flush;
mod hybrid_log;
mod page_status;

pub use hybrid_log::{HybridLog, LogStats, SealedRangeObserver, FIRST_VALID_OFFSET};
pub use page_status::{CloseStatus, FlushStatus, FullPageStatus};

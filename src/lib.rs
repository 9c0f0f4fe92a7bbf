//! hybridkv: an embeddable key-value engine over a hybrid log.
//!
//! The engine combines an append-only, partially-memory-resident log with a
//! lock-free hash index. The tail of the log is mutable in place, the middle
//! is immutable in memory, and the oldest portion lives only on a backing
//! device. Epoch protection coordinates reclamation and the CPR phase/version
//! state machine produces consistent snapshots without stopping the world.
//!
//! ```no_run
//! use hybridkv::config::StoreConfig;
//! use hybridkv::device::MemoryDevice;
//! use hybridkv::store::{HybridKv, SimpleFunctions};
//!
//! let config = StoreConfig::default();
//! let store: HybridKv<u64, u64, _, _> =
//!     HybridKv::new(config, MemoryDevice::new(), SimpleFunctions::new()).unwrap();
//! let mut session = store.start_session();
//! session.upsert(&1, &2).unwrap();
//! assert_eq!(session.read(&1).unwrap(), 2);
//! ```

pub mod address;
pub mod alloc;
pub mod cache;
pub mod compaction;
pub mod config;
pub mod device;
pub mod epoch;
pub mod index;
pub mod record;
pub mod scan;
pub mod status;
pub mod store;
pub mod utility;

/// Cache line size assumed throughout (bucket and epoch entry alignment).
pub const CACHE_LINE_BYTES: usize = 64;

/// Maximum number of threads that may be simultaneously registered with an
/// epoch instance.
pub const MAX_THREADS: usize = 96;

pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::StoreConfig;
    pub use crate::device::{FileDevice, MemoryDevice, StorageDevice};
    pub use crate::record::{Key, RecordInfo, Value};
    pub use crate::status::Status;
    pub use crate::store::{HybridKv, Session, SimpleFunctions, StoreFunctions};
}

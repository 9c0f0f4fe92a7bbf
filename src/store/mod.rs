//! The store: sessions, the CPR state machine, and the four record
//! operations stitched over the index, the log, and the read cache.

mod functions;
mod kv;
mod latches;
mod pending;
mod session;
mod state;

pub use functions::{SimpleFunctions, StoreFunctions};
pub use kv::{CheckpointResult, HybridKv, StoreStats};
pub use session::{CompletedOp, Session};
pub use state::{Action, Phase, SystemState};

pub(crate) use kv::OpResult;

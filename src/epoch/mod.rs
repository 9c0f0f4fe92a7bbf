//! Epoch-based protection.
//!
//! Threads announce membership in a global epoch so that reclamation and
//! barrier-style actions ("run this once every active thread has moved past
//! the current epoch") can proceed without locks.

mod light_epoch;

pub use light_epoch::LightEpoch;

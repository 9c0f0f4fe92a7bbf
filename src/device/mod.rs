//! Backing devices for the hybrid log.
//!
//! The engine is device-agnostic: anything implementing [`StorageDevice`]
//! can back the on-disk region. A segmented file device and an in-memory
//! device are provided.

mod file_device;
mod memory_device;
mod traits;

pub use file_device::FileDevice;
pub use memory_device::MemoryDevice;
pub use traits::{IoFuture, StorageDevice};

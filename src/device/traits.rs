//! The asynchronous block-device interface.

use std::future::Future;
use std::io;
use std::pin::Pin;

/// Boxed future returned by device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// A byte-addressable, offset-oriented backing store.
///
/// Offsets are logical log addresses; the device decides how they map onto
/// files or memory. All calls are asynchronous; callers that need
/// synchronous semantics (the flush path, the scan prefetcher) drive these
/// futures on a runtime of their own.
pub trait StorageDevice: Send + Sync + 'static {
    /// Write `data` at `offset`. Resolves to the number of bytes written.
    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> IoFuture<'a, usize>;

    /// Read `length` bytes at `offset`. Short reads past the written extent
    /// are zero-filled up to `length`.
    fn read(&self, offset: u64, length: u32) -> IoFuture<'_, Vec<u8>>;

    /// Durably persist previous writes.
    fn sync(&self) -> IoFuture<'_, ()>;

    /// Discard storage wholly below `offset`. Subsequent reads below the
    /// truncation point may return zeroes.
    fn truncate_until(&self, offset: u64) -> IoFuture<'_, ()>;

    /// Device sector size; record I/O does not depend on it but callers may
    /// align bulk transfers to it.
    fn sector_size(&self) -> usize {
        512
    }
}

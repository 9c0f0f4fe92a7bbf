//! In-memory device, for tests and for compaction's temporary engine.

use parking_lot::Mutex;

use super::traits::{IoFuture, StorageDevice};

/// A device backed by one growable byte vector.
pub struct MemoryDevice {
    bytes: Mutex<Vec<u8>>,
    truncated_until: Mutex<u64>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        MemoryDevice {
            bytes: Mutex::new(Vec::new()),
            truncated_until: Mutex::new(0),
        }
    }

    /// Bytes currently held (capacity grows to the highest written offset).
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDevice for MemoryDevice {
    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move {
            let mut bytes = self.bytes.lock();
            let end = offset as usize + data.len();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[offset as usize..end].copy_from_slice(data);
            Ok(data.len())
        })
    }

    fn read(&self, offset: u64, length: u32) -> IoFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let bytes = self.bytes.lock();
            let mut out = vec![0u8; length as usize];
            let start = offset as usize;
            if start < bytes.len() {
                let end = (start + length as usize).min(bytes.len());
                out[..end - start].copy_from_slice(&bytes[start..end]);
            }
            Ok(out)
        })
    }

    fn sync(&self) -> IoFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn truncate_until(&self, offset: u64) -> IoFuture<'_, ()> {
        Box::pin(async move {
            let mut bytes = self.bytes.lock();
            let mut truncated = self.truncated_until.lock();
            let end = (offset as usize).min(bytes.len());
            for b in &mut bytes[..end] {
                *b = 0;
            }
            *truncated = (*truncated).max(offset);
            Ok(())
        })
    }
}

//! Per-frame flush/close bookkeeping, packed into one atomic word.

use std::sync::atomic::{AtomicU32, Ordering};

/// Flush state of the page currently occupying a frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FlushStatus {
    /// All bytes written so far are on the device.
    Flushed = 0,
    /// The page has unflushed bytes.
    Dirty = 1,
    /// A flush covering this page is being issued.
    InProgress = 2,
}

/// Whether the frame's page is still readable in memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CloseStatus {
    Open = 0,
    /// Evicted; the frame may be recycled for a future page.
    Closed = 1,
}

/// Packed (FlushStatus, CloseStatus).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FullPageStatus(u32);

impl FullPageStatus {
    pub const fn new(flush: FlushStatus, close: CloseStatus) -> Self {
        FullPageStatus((flush as u32) | ((close as u32) << 8))
    }

    pub fn flush(self) -> FlushStatus {
        match self.0 & 0xff {
            0 => FlushStatus::Flushed,
            1 => FlushStatus::Dirty,
            _ => FlushStatus::InProgress,
        }
    }

    pub fn close(self) -> CloseStatus {
        if (self.0 >> 8) & 0xff == 0 {
            CloseStatus::Open
        } else {
            CloseStatus::Closed
        }
    }

    const fn control(self) -> u32 {
        self.0
    }
}

impl Default for FullPageStatus {
    fn default() -> Self {
        FullPageStatus::new(FlushStatus::Flushed, CloseStatus::Closed)
    }
}

#[derive(Debug)]
pub struct AtomicFullPageStatus(AtomicU32);

impl AtomicFullPageStatus {
    pub fn new(status: FullPageStatus) -> Self {
        AtomicFullPageStatus(AtomicU32::new(status.control()))
    }

    pub fn load(&self, order: Ordering) -> FullPageStatus {
        FullPageStatus(self.0.load(order))
    }

    pub fn store(&self, status: FullPageStatus, order: Ordering) {
        self.0.store(status.control(), order);
    }
}

impl Default for AtomicFullPageStatus {
    fn default() -> Self {
        Self::new(FullPageStatus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let s = FullPageStatus::new(FlushStatus::InProgress, CloseStatus::Open);
        assert_eq!(s.flush(), FlushStatus::InProgress);
        assert_eq!(s.close(), CloseStatus::Open);

        let s = FullPageStatus::new(FlushStatus::Dirty, CloseStatus::Closed);
        assert_eq!(s.flush(), FlushStatus::Dirty);
        assert_eq!(s.close(), CloseStatus::Closed);
    }

    #[test]
    fn atomic_round_trip() {
        let a = AtomicFullPageStatus::default();
        assert_eq!(a.load(Ordering::Relaxed).close(), CloseStatus::Closed);
        a.store(
            FullPageStatus::new(FlushStatus::Dirty, CloseStatus::Open),
            Ordering::Relaxed,
        );
        assert_eq!(a.load(Ordering::Relaxed).flush(), FlushStatus::Dirty);
    }
}

//! Synchronous flush path.
//!
//! Flushes run on whichever thread drains the sealing epoch action (or on a
//! caller doing an explicit flush). FlushedUntil advances contiguously:
//! a failed page write leaves it un-advanced past the failure point and the
//! error is recorded for the next attempt to surface.

use std::io;
use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::device::StorageDevice;

use super::hybrid_log::HybridLog;

impl<D: StorageDevice> HybridLog<D> {
    /// Flush all pages up to (but not including) `until`, then advance
    /// FlushedUntil. Idempotent: a repeat call with no intervening writes
    /// does nothing.
    pub fn flush_until(&self, until: Address) -> io::Result<()> {
        // Surface any error recorded by a previous attempt.
        if let Some((page, error)) = self.flush_errors.lock().pop() {
            return Err(io::Error::new(
                error.kind(),
                format!("flush of page {page} failed earlier: {error}"),
            ));
        }

        let current = self.flushed_until_address.load(Ordering::Acquire);
        let Some(pages) = pages_to_flush(current, until) else {
            return Ok(());
        };

        // Dedicated runtime: this is a synchronous, blocking path and may be
        // reached from inside another runtime's worker.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        for page in pages {
            let data = self.page_slice(page);
            let offset = Address::new(page, 0).control();
            let written = match rt.block_on(self.device.write(offset, data)) {
                Ok(n) => n,
                Err(error) => {
                    tracing::error!(page, %error, "page flush failed");
                    self.flush_errors.lock().push((page, error));
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("flush stopped at page {page}"),
                    ));
                }
            };
            if written != data.len() {
                let error = io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("partial write to page {page}: {written} of {}", data.len()),
                );
                self.flush_errors.lock().push((page, io::Error::new(
                    io::ErrorKind::WriteZero,
                    "partial page write",
                )));
                return Err(error);
            }
            // FlushedUntil may advance to the end of each fully written page.
            self.flushed_until_address
                .bump_to(Address::new(page + 1, 0).min(until), Ordering::AcqRel);
        }

        self.flushed_until_address.bump_to(until, Ordering::AcqRel);
        rt.block_on(self.device.sync())?;
        Ok(())
    }
}

/// Whole pages covered by `(current, until]`, or `None` if nothing new.
fn pages_to_flush(current: Address, until: Address) -> Option<std::ops::RangeInclusive<u32>> {
    if until <= current {
        return None;
    }
    let begin_page = current.page();
    let mut last_page = until.page();
    if until.offset() == 0 {
        if last_page == 0 {
            return None;
        }
        last_page -= 1;
    }
    if last_page < begin_page {
        return None;
    }
    Some(begin_page..=last_page)
}

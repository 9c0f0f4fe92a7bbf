//! Address-ordered iteration over a log range.
//!
//! In-memory pages are read directly; pages below HeadAddress are fetched
//! from the device with one page of lookahead, so a sequential scan overlaps
//! I/O with record processing. Invalid records are skipped; tombstones are
//! yielded with no value so consumers can observe deletions.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::address::Address;
use crate::alloc::HybridLog;
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::record::{Key, Record, Value};

/// Half-open address range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub begin: Address,
    pub end: Address,
}

/// One live (or deleted) record produced by a scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanEntry<K, V> {
    pub address: Address,
    pub key: K,
    /// `None` for tombstones.
    pub value: Option<V>,
    pub version: u32,
}

pub struct LogScanIterator<K: Key, V: Value, D: StorageDevice> {
    log: Arc<HybridLog<D>>,
    epoch: Arc<LightEpoch>,
    current: Address,
    end: Address,
    /// Fetched disk page currently being consumed.
    resident: Option<(u32, Vec<u8>)>,
    /// Lookahead fetch for the following page.
    prefetch: Option<(u32, tokio::task::JoinHandle<io::Result<Vec<u8>>>)>,
    /// Device error that ended the scan before `end`, if any.
    failed: Option<io::Error>,
    rt: tokio::runtime::Runtime,
    /// Holds this thread's epoch slot; not Send.
    _marker: PhantomData<*const (K, V)>,
}

impl<K: Key, V: Value, D: StorageDevice> LogScanIterator<K, V, D> {
    pub(crate) fn new(log: Arc<HybridLog<D>>, range: ScanRange) -> io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let epoch = Arc::clone(log.epoch_handle());
        epoch.protect_and_drain();
        let begin = range.begin.max(log.begin_address());
        let end = range.end.min(log.tail_address());
        Ok(LogScanIterator {
            log,
            epoch,
            current: begin,
            end,
            resident: None,
            prefetch: None,
            failed: None,
            rt,
            _marker: PhantomData,
        })
    }

    /// Device error that terminated the scan, if any. A scan that stopped
    /// with a failure has not covered its full range.
    pub fn failure(&self) -> Option<&io::Error> {
        self.failed.as_ref()
    }

    fn fail(&mut self, page: u32, error: io::Error) -> Option<()> {
        tracing::error!(page, %error, "scan page fetch failed");
        self.failed = Some(error);
        None
    }

    /// Make `page` resident, consuming the lookahead if it matches and
    /// arming the next one.
    fn fetch_page(&mut self, page: u32) -> Option<()> {
        if matches!(&self.resident, Some((resident, _)) if *resident == page) {
            return Some(());
        }
        let page_size = self.log.page_size();
        let bytes = match self.prefetch.take() {
            Some((prefetched, handle)) if prefetched == page => {
                match self.rt.block_on(handle) {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(error)) => return self.fail(page, error),
                    Err(join_error) => {
                        return self.fail(page, io::Error::new(io::ErrorKind::Other, join_error))
                    }
                }
            }
            other => {
                if let Some((_, stale)) = other {
                    stale.abort();
                }
                let device = Arc::clone(&self.log.device);
                let offset = Address::new(page, 0).control();
                match self
                    .rt
                    .block_on(async move { device.read(offset, page_size).await })
                {
                    Ok(bytes) => bytes,
                    Err(error) => return self.fail(page, error),
                }
            }
        };
        self.resident = Some((page, bytes));

        let next_page = page + 1;
        let next_start = Address::new(next_page, 0);
        if next_start < self.end && next_start < self.log.head_address() {
            let device = Arc::clone(&self.log.device);
            let offset = next_start.control();
            self.prefetch = Some((
                next_page,
                self.rt
                    .spawn(async move { device.read(offset, page_size).await }),
            ));
        }
        Some(())
    }

    fn read_record(&mut self, address: Address) -> Option<Record<K, V>> {
        if address >= self.log.head_address() {
            if !self.log.contains(address) {
                return None;
            }
            // SAFETY: contains() bounds the address and the iterator holds
            // epoch protection for its lifetime.
            return Some(unsafe { Record::read_from(self.log.record_ptr(address)) });
        }
        self.fetch_page(address.page())?;
        let (_, bytes) = self.resident.as_ref()?;
        let offset = address.offset() as usize;
        if offset + Record::<K, V>::size() as usize > bytes.len() {
            return None;
        }
        // SAFETY: bounds checked; the page holds engine-written records.
        Some(unsafe { Record::read_from(bytes.as_ptr().add(offset)) })
    }
}

impl<K: Key, V: Value, D: StorageDevice> Iterator for LogScanIterator<K, V, D> {
    type Item = ScanEntry<K, V>;

    fn next(&mut self) -> Option<ScanEntry<K, V>> {
        let record_size = Record::<K, V>::size();
        loop {
            if self.failed.is_some() || self.current >= self.end {
                return None;
            }
            // Records never straddle pages; skip the slack at each page end.
            if self.current.offset() + record_size > self.log.page_size() {
                self.current = self.log.next_page_start(self.current);
                continue;
            }
            let address = self.current;
            self.current = Address::new(address.page(), address.offset() + record_size);

            let record = self.read_record(address)?;
            let info = record.info();
            if info.is_invalid() {
                continue;
            }
            return Some(ScanEntry {
                address,
                key: record.key,
                value: (!info.is_tombstone()).then_some(record.value),
                version: info.version(),
            });
        }
    }
}

impl<K: Key, V: Value, D: StorageDevice> Drop for LogScanIterator<K, V, D> {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.prefetch.take() {
            handle.abort();
        }
        self.epoch.unprotect();
    }
}

//! Compaction folds the cold log prefix through a scratch in-memory
//! instance: the prefix is replayed into the scratch store (so only the
//! newest version of each key survives), survivors the rest of the log has
//! not superseded are conditionally re-appended at the tail, and the prefix
//! is truncated.

use std::sync::Arc;

use crate::address::Address;
use crate::config::StoreConfig;
use crate::device::{MemoryDevice, StorageDevice};
use crate::record::{Key, Value};
use crate::scan::ScanRange;
use crate::status::Status;
use crate::store::{HybridKv, OpResult, Session, StoreFunctions};

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    pub records_scanned: u64,
    pub records_copied: u64,
    pub new_begin_address: Address,
}

impl<K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> HybridKv<K, V, F, D> {
    /// Compact the log prefix `[BeginAddress, until)`. Runs online: the
    /// caller's session keeps operating normally on other threads, and a
    /// record updated concurrently is never clobbered by its compacted copy.
    pub fn compact(
        &self,
        until: Address,
        session: &mut Session<'_, K, V, F, D>,
    ) -> Result<CompactionStats, Status> {
        let begin = self.hlog.begin_address();
        let until = until.min(self.hlog.safe_head_address());
        let mut stats = CompactionStats {
            records_scanned: 0,
            records_copied: 0,
            new_begin_address: begin,
        };
        if until <= begin {
            return Ok(stats);
        }

        let scratch: HybridKv<K, V, F, MemoryDevice> = HybridKv::with_shared(
            scratch_config(&self.config, begin, until),
            Arc::new(MemoryDevice::new()),
            Arc::clone(&self.funcs),
        )
        .map_err(|_| Status::OutOfMemory)?;
        let mut scratch_session = scratch.start_session();

        // Pass 1: replay the prefix. Later records overwrite earlier ones
        // and tombstones drop their key.
        let mut prefix = self
            .scan(ScanRange { begin, end: until })
            .map_err(|_| Status::IoError)?;
        while let Some(entry) = prefix.next() {
            stats.records_scanned += 1;
            match entry.value {
                Some(value) => scratch_session
                    .upsert(&entry.key, &value)
                    .map_err(|_| Status::OutOfMemory)?,
                None => match scratch_session.delete(&entry.key) {
                    Ok(()) | Err(Status::NotFound) => {}
                    Err(status) => return Err(status),
                },
            }
        }
        if let Some(error) = prefix.failure() {
            // A short replay must never reach truncation: dropping a prefix
            // that was not fully copied forward loses records.
            tracing::error!(%error, "compaction scan failed; prefix retained");
            return Err(Status::IoError);
        }
        drop(prefix);

        // Pass 2: conditionally re-append survivors.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|_| Status::IoError)?;
        let scratch_log = scratch.log_stats();
        let mut survivors = scratch
            .scan(ScanRange {
                begin: scratch_log.begin_address,
                end: scratch_log.tail_address,
            })
            .map_err(|_| Status::IoError)?;
        while let Some(entry) = survivors.next() {
            let Some(value) = entry.value else {
                continue;
            };
            if scratch.resident_record_address(&entry.key) != Some(entry.address) {
                // Superseded within the prefix itself.
                continue;
            }
            let mut attempts = 0u32;
            loop {
                session.refresh();
                match self.conditional_copy(&session.ctx, &entry.key, &value, until, &rt) {
                    OpResult::Done(copied) => {
                        if copied {
                            stats.records_copied += 1;
                        }
                        break;
                    }
                    _ => {
                        attempts += 1;
                        if attempts > 1_000 {
                            return Err(Status::OutOfMemory);
                        }
                    }
                }
            }
        }
        if let Some(error) = survivors.failure() {
            tracing::error!(%error, "compaction survivor scan failed; prefix retained");
            return Err(Status::IoError);
        }
        drop(survivors);
        drop(scratch_session);

        match self.shift_begin_address(until) {
            Status::Ok => {}
            status => return Err(status),
        }
        stats.new_begin_address = self.hlog.begin_address();
        tracing::info!(
            scanned = stats.records_scanned,
            copied = stats.records_copied,
            new_begin = ?stats.new_begin_address,
            "log compaction complete"
        );
        Ok(stats)
    }
}

/// Size the scratch instance so the whole prefix stays memory-resident.
fn scratch_config(config: &StoreConfig, begin: Address, until: Address) -> StoreConfig {
    let page_bits = config.log.page_size_bits;
    let pages = (until.page() - begin.page() + 1) as u64;
    let bytes = pages << page_bits;
    let memory_bits =
        (bytes.next_power_of_two().trailing_zeros() + 1).clamp(page_bits + 1, page_bits + 20);
    let mut scratch = StoreConfig::default()
        .with_table_size(config.index.table_size)
        .with_page_size_bits(page_bits)
        .with_memory_size_bits(memory_bits)
        .with_mutable_fraction(1.0);
    scratch.log.segment_size_bits = config.log.segment_size_bits.max(page_bits);
    scratch.read_cache = None;
    scratch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_sizing_covers_prefix() {
        let config = StoreConfig::default().with_page_size_bits(12);
        let scratch = scratch_config(&config, Address::new(0, 64), Address::new(7, 0));
        let ring_bytes = 1u64 << scratch.log.memory_size_bits;
        assert!(ring_bytes >= 8 << 12);
        assert!(scratch.read_cache.is_none());
        scratch.validate().unwrap();
    }
}

//! Background record fetches for operations that went below HeadAddress.
//!
//! One worker thread owns a small runtime and drives device reads; requests
//! and completions cross over crossbeam channels. Concurrent requests for
//! the same address are deduplicated so a hot cold key costs one read.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::address::Address;
use crate::device::StorageDevice;

/// A finished device read, keyed by the record address that was fetched.
pub struct ReadCompletion {
    pub address: Address,
    pub result: io::Result<Vec<u8>>,
}

enum IoMessage {
    Read { address: Address, length: u32 },
    Shutdown,
}

pub struct PendingIoManager {
    request_tx: Sender<IoMessage>,
    completion_rx: Receiver<ReadCompletion>,
    /// Addresses with a read already queued or running.
    inflight: Mutex<HashSet<u64>>,
    worker: Option<JoinHandle<()>>,
}

impl PendingIoManager {
    pub fn new<D: StorageDevice>(device: Arc<D>) -> io::Result<Self> {
        let (request_tx, request_rx) = unbounded::<IoMessage>();
        let (completion_tx, completion_rx) = unbounded::<ReadCompletion>();
        let worker = std::thread::Builder::new()
            .name("hybridkv-io".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(error) => {
                        tracing::error!(%error, "io worker runtime");
                        return;
                    }
                };
                while let Ok(message) = request_rx.recv() {
                    match message {
                        IoMessage::Read { address, length } => {
                            let result = rt.block_on(device.read(address.control(), length));
                            if let Err(error) = &result {
                                tracing::warn!(address = ?address, %error, "record fetch failed");
                            }
                            if completion_tx
                                .send(ReadCompletion { address, result })
                                .is_err()
                            {
                                break;
                            }
                        }
                        IoMessage::Shutdown => break,
                    }
                }
            })?;
        Ok(PendingIoManager {
            request_tx,
            completion_rx,
            inflight: Mutex::new(HashSet::new()),
            worker: Some(worker),
        })
    }

    /// Queue a record fetch. Returns false if an identical fetch is already
    /// in flight (the eventual completion serves both waiters).
    pub fn submit_read(&self, address: Address, length: u32) -> bool {
        if !self.inflight.lock().insert(address.control()) {
            return false;
        }
        if self
            .request_tx
            .send(IoMessage::Read { address, length })
            .is_err()
        {
            self.inflight.lock().remove(&address.control());
            return false;
        }
        true
    }

    /// Collect every completion available right now.
    pub fn drain(&self) -> Vec<ReadCompletion> {
        let completions: Vec<_> = self.completion_rx.try_iter().collect();
        if !completions.is_empty() {
            let mut inflight = self.inflight.lock();
            for completion in &completions {
                inflight.remove(&completion.address.control());
            }
        }
        completions
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether a fetch for `address` is queued or running.
    pub fn is_inflight(&self, address: Address) -> bool {
        self.inflight.lock().contains(&address.control())
    }
}

impl Drop for PendingIoManager {
    fn drop(&mut self) {
        let _ = self.request_tx.send(IoMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

//! Sessions: the per-thread handle through which all record operations run.
//!
//! A session owns this thread's epoch slot, its CPR context (observed phase
//! and version), its pending disk fetches, and its retry queue. Sessions are
//! deliberately not `Send`: the epoch slot is thread-local.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;

use uuid::Uuid;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::index::HashBucketEntry;
use crate::record::{Key, Record, Value};
use crate::status::{OperationType, Status};

use super::functions::StoreFunctions;
use super::kv::{HybridKv, OpResult};
use super::state::Phase;

/// Attempts before an operation gives up with `Aborted`/`OutOfMemory`.
const RETRY_LIMIT: u32 = 100_000;
/// Attempts between forced refreshes inside a retry loop.
const REFRESH_INTERVAL: u32 = 64;
/// Inline retries of a fuzzy-region RMW before it parks on the retry queue.
const FUZZY_RETRY_LIMIT: u32 = 256;

/// Thread-local CPR context.
pub(crate) struct ThreadContext {
    pub phase: Phase,
    pub version: u32,
    pub serial: u64,
}

/// An operation waiting on a disk fetch (or parked for retry).
pub(crate) struct PendingContext<K, I> {
    pub op: OperationType,
    pub key: K,
    pub input: Option<I>,
    /// CPR version the operation was issued under; WAIT_PENDING drains by
    /// this stamp.
    pub version: u32,
    pub serial: u64,
    pub awaiting: Address,
    /// Index entry snapshot at issue time (promotion and continuation guard).
    pub entry: HashBucketEntry,
}

/// A formerly pending operation resolved by `complete_pending`.
pub struct CompletedOp<T> {
    pub serial: u64,
    pub op: OperationType,
    pub status: Status,
    pub output: Option<T>,
}

pub struct Session<'a, K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> {
    store: &'a HybridKv<K, V, F, D>,
    id: Uuid,
    pub(crate) ctx: ThreadContext,
    pending: HashMap<u64, PendingContext<K, F::Input>>,
    retry: VecDeque<PendingContext<K, F::Input>>,
    /// Epoch slots are thread-local; keep the session on its thread.
    _not_send: PhantomData<*const ()>,
}

impl<'a, K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> Session<'a, K, V, F, D> {
    pub(crate) fn new(store: &'a HybridKv<K, V, F, D>, phase: Phase, version: u32) -> Self {
        Session {
            store,
            id: Uuid::new_v4(),
            ctx: ThreadContext {
                phase,
                version,
                serial: 0,
            },
            pending: HashMap::new(),
            retry: VecDeque::new(),
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serial number of the most recently issued operation.
    pub fn serial(&self) -> u64 {
        self.ctx.serial
    }

    /// Number of operations awaiting `complete_pending`.
    pub fn pending_count(&self) -> usize {
        self.pending.len() + self.retry.len()
    }

    /// Re-observe the epoch and the CPR state. Long-running sessions call
    /// this between batches so maintenance operations can progress.
    pub fn refresh(&mut self) {
        self.store.refresh_session(&mut self.ctx);
    }

    /// Read the value for `key`. `Err(Status::Pending)` means the record is
    /// on disk; resolve it with [`Session::complete_pending`].
    pub fn read(&mut self, key: &K) -> Result<F::Output, Status> {
        self.ctx.serial += 1;
        let serial = self.ctx.serial;
        self.read_internal(key, serial)
    }

    /// Insert or blindly overwrite the value for `key`.
    pub fn upsert(&mut self, key: &K, value: &V) -> Result<(), Status> {
        self.ctx.serial += 1;
        let store = self.store;
        let mut attempts = 0u32;
        let mut exhausted_memory = false;
        loop {
            match store.upsert_attempt(&self.ctx, key, value) {
                OpResult::Done(()) => return Ok(()),
                OpResult::CprShift => store.refresh_session(&mut self.ctx),
                OpResult::NoSpace => {
                    exhausted_memory = true;
                    store.refresh_session(&mut self.ctx);
                }
                OpResult::RetryNow => std::hint::spin_loop(),
                _ => return Err(Status::Aborted),
            }
            attempts += 1;
            if attempts % REFRESH_INTERVAL == 0 {
                store.refresh_session(&mut self.ctx);
            }
            if attempts > RETRY_LIMIT {
                return Err(if exhausted_memory {
                    Status::OutOfMemory
                } else {
                    Status::Aborted
                });
            }
        }
    }

    /// Read-modify-write `key` with `input`. May go pending if the current
    /// record is on disk.
    pub fn rmw(&mut self, key: &K, input: &F::Input) -> Result<(), Status> {
        self.ctx.serial += 1;
        let serial = self.ctx.serial;
        self.rmw_internal(key, input, serial)
    }

    /// Delete `key`. Never goes pending: a tombstone is appended even when
    /// the chain continues on disk.
    pub fn delete(&mut self, key: &K) -> Result<(), Status> {
        self.ctx.serial += 1;
        let store = self.store;
        let mut attempts = 0u32;
        let mut exhausted_memory = false;
        loop {
            match store.delete_attempt(&self.ctx, key) {
                OpResult::Done(()) => return Ok(()),
                OpResult::NotFound => return Err(Status::NotFound),
                OpResult::CprShift => store.refresh_session(&mut self.ctx),
                OpResult::NoSpace => {
                    exhausted_memory = true;
                    store.refresh_session(&mut self.ctx);
                }
                OpResult::RetryNow => std::hint::spin_loop(),
                _ => return Err(Status::Aborted),
            }
            attempts += 1;
            if attempts % REFRESH_INTERVAL == 0 {
                store.refresh_session(&mut self.ctx);
            }
            if attempts > RETRY_LIMIT {
                return Err(if exhausted_memory {
                    Status::OutOfMemory
                } else {
                    Status::Aborted
                });
            }
        }
    }

    /// Drive pending and parked operations to completion. With `wait` the
    /// call loops until none remain; otherwise it resolves what is ready.
    pub fn complete_pending(&mut self, wait: bool) -> Vec<CompletedOp<F::Output>> {
        let store = self.store;
        let mut completed = Vec::new();
        loop {
            store.absorb_completions();

            let parked: Vec<_> = self.retry.drain(..).collect();
            for ctx in parked {
                store.refresh_session(&mut self.ctx);
                self.rerun(ctx, &mut completed, false);
            }

            let serials: Vec<u64> = self.pending.keys().copied().collect();
            for serial in serials {
                let Some(ctx) = self.pending.remove(&serial) else {
                    continue;
                };
                match store.take_fetched(ctx.awaiting) {
                    None => {
                        // The completion may have been consumed by a racing
                        // deduplicated request; re-issue if nothing is
                        // running for this address.
                        if !store.io.is_inflight(ctx.awaiting) {
                            store.reissue_fetch(ctx.awaiting);
                        }
                        self.pending.insert(serial, ctx);
                    }
                    Some(Err(status)) => {
                        store.retire_pending(&ctx);
                        completed.push(CompletedOp {
                            serial,
                            op: ctx.op,
                            status,
                            output: None,
                        });
                    }
                    Some(Ok(bytes)) => self.resolve_fetch(ctx, &bytes, &mut completed),
                }
            }

            if !wait || (self.pending.is_empty() && self.retry.is_empty()) {
                break;
            }
            store.refresh_session(&mut self.ctx);
            std::thread::yield_now();
        }
        completed
    }

    fn read_internal(&mut self, key: &K, serial: u64) -> Result<F::Output, Status> {
        let store = self.store;
        let mut attempts = 0u32;
        loop {
            match store.read_attempt(&self.ctx, key) {
                OpResult::Done(output) => return Ok(output),
                OpResult::NotFound => return Err(Status::NotFound),
                OpResult::OnDisk { address, entry } => {
                    let ctx = PendingContext {
                        op: OperationType::Read,
                        key: *key,
                        input: None,
                        version: self.ctx.version,
                        serial,
                        awaiting: address,
                        entry,
                    };
                    store.issue_fetch(&ctx);
                    self.pending.insert(serial, ctx);
                    return Err(Status::Pending);
                }
                OpResult::CprShift => store.refresh_session(&mut self.ctx),
                _ => std::hint::spin_loop(),
            }
            attempts += 1;
            if attempts % REFRESH_INTERVAL == 0 {
                store.refresh_session(&mut self.ctx);
            }
            if attempts > RETRY_LIMIT {
                return Err(Status::Aborted);
            }
        }
    }

    fn rmw_internal(&mut self, key: &K, input: &F::Input, serial: u64) -> Result<(), Status> {
        let store = self.store;
        let mut attempts = 0u32;
        let mut fuzzy_attempts = 0u32;
        let mut exhausted_memory = false;
        loop {
            match store.rmw_attempt(&self.ctx, key, input) {
                OpResult::Done(()) => return Ok(()),
                OpResult::OnDisk { address, entry } => {
                    let ctx = PendingContext {
                        op: OperationType::Rmw,
                        key: *key,
                        input: Some(input.clone()),
                        version: self.ctx.version,
                        serial,
                        awaiting: address,
                        entry,
                    };
                    store.issue_fetch(&ctx);
                    self.pending.insert(serial, ctx);
                    return Err(Status::Pending);
                }
                OpResult::RetryLater => {
                    fuzzy_attempts += 1;
                    store.refresh_session(&mut self.ctx);
                    if fuzzy_attempts > FUZZY_RETRY_LIMIT {
                        // The fuzzy boundary is not moving; park the
                        // operation for the next complete_pending.
                        self.retry.push_back(PendingContext {
                            op: OperationType::Rmw,
                            key: *key,
                            input: Some(input.clone()),
                            version: self.ctx.version,
                            serial,
                            awaiting: Address::INVALID,
                            entry: HashBucketEntry::UNUSED,
                        });
                        return Err(Status::Pending);
                    }
                }
                OpResult::CprShift => store.refresh_session(&mut self.ctx),
                OpResult::NoSpace => {
                    exhausted_memory = true;
                    store.refresh_session(&mut self.ctx);
                }
                OpResult::RetryNow => std::hint::spin_loop(),
                OpResult::NotFound => return Err(Status::Aborted),
            }
            attempts += 1;
            if attempts % REFRESH_INTERVAL == 0 {
                store.refresh_session(&mut self.ctx);
            }
            if attempts > RETRY_LIMIT {
                return Err(if exhausted_memory {
                    Status::OutOfMemory
                } else {
                    Status::Aborted
                });
            }
        }
    }

    /// Resolve one fetched record against its context.
    fn resolve_fetch(
        &mut self,
        mut ctx: PendingContext<K, F::Input>,
        bytes: &[u8],
        completed: &mut Vec<CompletedOp<F::Output>>,
    ) {
        let store = self.store;
        if bytes.len() < Record::<K, V>::size() as usize {
            store.retire_pending(&ctx);
            completed.push(CompletedOp {
                serial: ctx.serial,
                op: ctx.op,
                status: Status::Corruption,
                output: None,
            });
            return;
        }
        // SAFETY: length checked; the device round-trips engine-written
        // record bytes.
        let record = unsafe { Record::<K, V>::read_from(bytes.as_ptr()) };
        let info = record.info();

        if info.is_invalid() || record.key != ctx.key {
            // Not our record: walk one hop further down the chain.
            let previous = info.previous_address();
            if previous >= store.hlog.head_address()
                || previous < store.hlog.begin_address()
            {
                // The chain re-enters memory (or ends); re-run in full.
                self.rerun(ctx, completed, true);
            } else {
                ctx.awaiting = previous;
                store.reissue_fetch(previous);
                self.pending.insert(ctx.serial, ctx);
            }
            return;
        }

        match ctx.op {
            OperationType::Read => {
                store.retire_pending(&ctx);
                if info.is_tombstone() {
                    completed.push(CompletedOp {
                        serial: ctx.serial,
                        op: ctx.op,
                        status: Status::NotFound,
                        output: None,
                    });
                } else {
                    let output = store.funcs.single_reader(&ctx.key, &record.value);
                    store.try_promote(&ctx.key, &record.value, ctx.version, ctx.entry);
                    completed.push(CompletedOp {
                        serial: ctx.serial,
                        op: ctx.op,
                        status: Status::Ok,
                        output: Some(output),
                    });
                }
            }
            OperationType::Rmw => {
                let Some(input) = ctx.input.clone() else {
                    store.retire_pending(&ctx);
                    completed.push(CompletedOp {
                        serial: ctx.serial,
                        op: ctx.op,
                        status: Status::Aborted,
                        output: None,
                    });
                    return;
                };
                let source = (!info.is_tombstone()).then_some(record.value);
                let mut attempts = 0u32;
                loop {
                    match store.rmw_disk_continue(
                        &self.ctx,
                        &ctx.key,
                        &input,
                        source.as_ref(),
                        ctx.entry,
                    ) {
                        OpResult::Done(()) => {
                            store.retire_pending(&ctx);
                            completed.push(CompletedOp {
                                serial: ctx.serial,
                                op: ctx.op,
                                status: Status::Ok,
                                output: None,
                            });
                            return;
                        }
                        OpResult::RetryNow => {
                            // The chain moved since the fetch; start over.
                            self.rerun(ctx, completed, true);
                            return;
                        }
                        OpResult::NoSpace | OpResult::CprShift => {
                            store.refresh_session(&mut self.ctx);
                        }
                        _ => {
                            store.retire_pending(&ctx);
                            completed.push(CompletedOp {
                                serial: ctx.serial,
                                op: ctx.op,
                                status: Status::Aborted,
                                output: None,
                            });
                            return;
                        }
                    }
                    attempts += 1;
                    if attempts > RETRY_LIMIT {
                        store.retire_pending(&ctx);
                        completed.push(CompletedOp {
                            serial: ctx.serial,
                            op: ctx.op,
                            status: Status::OutOfMemory,
                            output: None,
                        });
                        return;
                    }
                }
            }
            _ => {
                // Upserts and deletes never go pending.
                store.retire_pending(&ctx);
                completed.push(CompletedOp {
                    serial: ctx.serial,
                    op: ctx.op,
                    status: Status::Aborted,
                    output: None,
                });
            }
        }
    }

    /// Re-execute an operation from the top. `counted` says whether the
    /// context still holds a WAIT_PENDING slot to release first.
    fn rerun(
        &mut self,
        ctx: PendingContext<K, F::Input>,
        completed: &mut Vec<CompletedOp<F::Output>>,
        counted: bool,
    ) {
        let store = self.store;
        if counted {
            store.retire_pending(&ctx);
        }
        let resolution = match ctx.op {
            OperationType::Read => match self.read_internal(&ctx.key, ctx.serial) {
                Ok(output) => Some((Status::Ok, Some(output))),
                Err(Status::Pending) => None,
                Err(status) => Some((status, None)),
            },
            OperationType::Rmw => {
                let Some(input) = ctx.input.clone() else {
                    completed.push(CompletedOp {
                        serial: ctx.serial,
                        op: ctx.op,
                        status: Status::Aborted,
                        output: None,
                    });
                    return;
                };
                match self.rmw_internal(&ctx.key, &input, ctx.serial) {
                    Ok(()) => Some((Status::Ok, None)),
                    Err(Status::Pending) => None,
                    Err(status) => Some((status, None)),
                }
            }
            _ => Some((Status::Aborted, None)),
        };
        if let Some((status, output)) = resolution {
            completed.push(CompletedOp {
                serial: ctx.serial,
                op: ctx.op,
                status,
                output,
            });
        }
    }
}

impl<K: Key, V: Value, F: StoreFunctions<K, V>, D: StorageDevice> Drop
    for Session<'_, K, V, F, D>
{
    fn drop(&mut self) {
        for ctx in self.pending.values() {
            self.store.retire_pending(ctx);
        }
        self.store.session_closed();
    }
}

//! Operation status codes.
//!
//! `Status` is the public result of every store operation. Transient
//! outcomes (lost CAS races, CPR shifts) are resolved inside the engine
//! and never escape to callers.

use std::fmt;

/// Public status returned by store operations and maintenance calls.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    /// The operation completed.
    Ok,
    /// The operation requires a disk fetch; call `complete_pending` to
    /// resolve it.
    Pending,
    /// The key does not exist (or was deleted).
    NotFound,
    /// The operation could not start (e.g. conflicting maintenance already
    /// in progress).
    Aborted,
    /// Log memory is exhausted and could not be reclaimed in time.
    OutOfMemory,
    /// The backing device reported an error.
    IoError,
    /// On-disk bytes failed validation.
    Corruption,
}

impl Status {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    #[inline]
    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Pending => "pending",
            Status::NotFound => "not found",
            Status::Aborted => "aborted",
            Status::OutOfMemory => "out of memory",
            Status::IoError => "io error",
            Status::Corruption => "corruption",
        };
        f.write_str(s)
    }
}

/// The four record operations, used to tag pending and retried contexts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperationType {
    Read,
    Upsert,
    Rmw,
    Delete,
}

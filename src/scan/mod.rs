//! Forward log scans with disk prefetch.

mod log_iterator;

pub use log_iterator::{LogScanIterator, ScanEntry, ScanRange};

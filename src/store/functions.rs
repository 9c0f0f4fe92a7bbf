//! The caller-supplied functions object.
//!
//! Every store instance carries one of these; it defines how values are
//! read out, written, and merged. The single/concurrent split mirrors the
//! log regions: records below ReadOnly can only be touched by one thread
//! (the reader of an immutable or on-disk copy), records in the mutable
//! region may be raced on and the concurrent variants must tolerate that.

use std::marker::PhantomData;

use crate::record::{Key, Value};

/// User callbacks for the four record operations.
///
/// `Input` is the RMW operand; `Output` is what a read produces. All
/// callbacks must be cheap and non-blocking: they run inside epoch-protected
/// traversals.
pub trait StoreFunctions<K: Key, V: Value>: Send + Sync + 'static {
    type Input: Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    /// Read a record no other thread can be mutating (immutable region,
    /// read cache, or a copy fetched from the device).
    fn single_reader(&self, key: &K, value: &V) -> Self::Output;

    /// Read a record in the mutable region; a concurrent in-place update may
    /// be racing this read.
    fn concurrent_reader(&self, key: &K, value: &V) -> Self::Output {
        self.single_reader(key, value)
    }

    /// Populate a freshly allocated record during upsert.
    fn single_writer(&self, key: &K, src: &V, dst: &mut V) {
        let _ = key;
        *dst = *src;
    }

    /// Overwrite a live mutable-region record in place. Return false to
    /// force a copy to the tail instead.
    fn concurrent_writer(&self, key: &K, src: &V, dst: &mut V) -> bool {
        let _ = key;
        *dst = *src;
        true
    }

    /// Build the value for an RMW whose key has no live record.
    fn initial_updater(&self, key: &K, input: &Self::Input) -> V;

    /// Merge `input` into a live mutable-region record. Return false to
    /// force a copy-update to the tail instead.
    fn in_place_updater(&self, key: &K, input: &Self::Input, value: &mut V) -> bool;

    /// Build the successor value from an immutable (or on-disk) record.
    fn copy_updater(&self, key: &K, input: &Self::Input, old_value: &V) -> V;
}

/// Blind-write semantics: reads return the value, upserts overwrite, RMW
/// replaces the value with the input. Enough for most tests and for callers
/// that only need a plain key-value map.
pub struct SimpleFunctions<K, V> {
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> SimpleFunctions<K, V> {
    pub fn new() -> Self {
        SimpleFunctions {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for SimpleFunctions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> StoreFunctions<K, V> for SimpleFunctions<K, V> {
    type Input = V;
    type Output = V;

    fn single_reader(&self, _key: &K, value: &V) -> V {
        *value
    }

    fn initial_updater(&self, _key: &K, input: &V) -> V {
        *input
    }

    fn in_place_updater(&self, _key: &K, input: &V, value: &mut V) -> bool {
        *value = *input;
        true
    }

    fn copy_updater(&self, _key: &K, input: &V, _old_value: &V) -> V {
        *input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_functions_are_blind_writes() {
        let f = SimpleFunctions::<u64, u64>::new();
        assert_eq!(f.single_reader(&1, &10), 10);
        assert_eq!(f.initial_updater(&1, &5), 5);
        assert_eq!(f.copy_updater(&1, &5, &10), 5);
        let mut v = 10;
        assert!(f.in_place_updater(&1, &7, &mut v));
        assert_eq!(v, 7);
        let mut dst = 0;
        f.single_writer(&1, &3, &mut dst);
        assert_eq!(dst, 3);
        assert!(f.concurrent_writer(&1, &4, &mut dst));
        assert_eq!(dst, 4);
    }
}

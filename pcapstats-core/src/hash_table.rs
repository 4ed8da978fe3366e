//! Keyed byte-string hash table with separate chaining.
//!
//! This table OWNS its values. A value is dropped exactly once, either by
//! `remove`, by iterating-and-dropping during `destroy`, or by the
//! aging-queue sweep task that calls `remove`. There is no caller-side
//! free step to forget.
//!
//! Keys are arbitrary byte strings: callers are expected to serialize
//! their key type to a canonical byte representation rather than relying
//! on a fixed-layout struct comparison.

use crate::digest::fnv1a_32;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("key already present in table")]
pub struct DuplicateKey;

pub struct Table<V> {
    buckets: Vec<Vec<(Vec<u8>, V)>>,
    len: usize,
}

impl<V> Table<V> {
    pub fn with_buckets(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self { buckets: (0..buckets).map(|_| Vec::new()).collect(), len: 0 }
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        (fnv1a_32(key) as usize) % self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fails with `DuplicateKey` if an entry with the same key bytes
    /// already exists. Memory-budget refusal is the caller's
    /// responsibility (see `flow`/`host`/`fragment`, which reserve from a
    /// `Memcap` before calling this).
    pub fn insert(&mut self, key: Vec<u8>, value: V) -> Result<(), DuplicateKey> {
        let idx = self.bucket_index(&key);
        let chain = &mut self.buckets[idx];
        if chain.iter().any(|(k, _)| k == &key) {
            return Err(DuplicateKey);
        }
        chain.push((key, value));
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let idx = self.bucket_index(key);
        self.buckets[idx].iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let idx = self.bucket_index(key);
        self.buckets[idx].iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Detaches and returns the value; the caller now owns it (it is no
    /// longer tracked by this table, so dropping it is the caller's job —
    /// typically immediate).
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let idx = self.bucket_index(key);
        let chain = &mut self.buckets[idx];
        let pos = chain.iter().position(|(k, _)| k == key)?;
        self.len -= 1;
        Some(chain.swap_remove(pos).1)
    }

    /// Whole-table iteration. Order is implementation-defined but stable
    /// across non-mutating calls.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.buckets.iter().flatten().map(|(k, v)| (k.as_slice(), v))
    }

    /// Walks all chains and releases bucket storage. Since this table
    /// owns its values, any remaining entries are dropped along with it —
    /// callers that want per-entry teardown logic (memcap release, aging
    /// queue removal) must drain first via `remove`.
    pub fn destroy(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut t: Table<u32> = Table::with_buckets(8);
        t.insert(b"a".to_vec(), 1).unwrap();
        t.insert(b"b".to_vec(), 2).unwrap();
        assert_eq!(t.get(b"a"), Some(&1));
        assert_eq!(t.remove(b"a"), Some(1));
        assert_eq!(t.get(b"a"), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut t: Table<u32> = Table::with_buckets(4);
        t.insert(b"x".to_vec(), 1).unwrap();
        assert!(t.insert(b"x".to_vec(), 2).is_err());
    }

    #[test]
    fn iteration_sees_every_entry_exactly_once() {
        let mut t: Table<u32> = Table::with_buckets(4);
        for i in 0..50u32 {
            t.insert(format!("k{i}").into_bytes(), i).unwrap();
        }
        let mut seen: Vec<u32> = t.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
}

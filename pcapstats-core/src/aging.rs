//! Time queue / aging queue.
//!
//! Ordered by deadline with O(log n) bump/delete and O(1) find by key: a
//! `BTreeMap` keyed by `(deadline, sequence)` paired with a reverse index
//! from key to that pair. The sequence number breaks ties between
//! entries sharing a deadline so the map retains a well-defined head
//! even when `age_limit` is zero.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Sentinel for the per-entry insertion order, used only to keep
/// same-deadline entries in FIFO order within the `BTreeMap`.
type Seq = u64;

pub struct AgingQueue<K> {
    age_limit: u64,
    next_seq: Seq,
    by_deadline: BTreeMap<(u64, Seq), K>,
    by_key: HashMap<K, (u64, Seq)>,
}

impl<K: Eq + Hash + Clone> AgingQueue<K> {
    pub fn new(age_limit: u64) -> Self {
        Self { age_limit, next_seq: 0, by_deadline: BTreeMap::new(), by_key: HashMap::new() }
    }

    pub fn age_limit(&self) -> u64 {
        self.age_limit
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn detach(&mut self, key: &K) -> Option<(u64, Seq)> {
        let slot = self.by_key.remove(key)?;
        self.by_deadline.remove(&slot);
        Some(slot)
    }

    fn attach(&mut self, key: K, deadline: u64) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.by_deadline.insert((deadline, seq), key.clone());
        self.by_key.insert(key, (deadline, seq));
    }

    /// Append with deadline = `now + age_limit`. If `key` is already
    /// tracked, its prior slot is detached first so the queue never holds
    /// two entries for the same key.
    pub fn insert(&mut self, key: K, now: u64) {
        self.detach(&key);
        self.attach(key, now.saturating_add(self.age_limit));
    }

    pub fn find(&self, key: &K) -> Option<u64> {
        self.by_key.get(key).map(|(deadline, _)| *deadline)
    }

    /// Deadline of the current head, if any. Lets a sweeper block until
    /// exactly this point rather than polling.
    pub fn next_deadline(&self) -> Option<u64> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Detach and re-append with a fresh deadline. Used on every
    /// successful lookup, implementing LRU-by-recency.
    pub fn bump(&mut self, key: &K, now: u64) -> bool {
        if self.detach(key).is_some() {
            self.attach(key.clone(), now.saturating_add(self.age_limit));
            true
        } else {
            false
        }
    }

    pub fn delete(&mut self, key: &K) -> bool {
        self.detach(key).is_some()
    }

    /// From the head, while `deadline <= now`, detach and invoke `task`
    /// with the expired key. `task` is expected to remove the
    /// corresponding hash-table entry and let its value drop.
    pub fn sweep(&mut self, now: u64, mut task: impl FnMut(&K)) {
        loop {
            let Some((&(deadline, _), _)) = self.by_deadline.iter().next() else { break };
            if deadline > now {
                break;
            }
            let (_, key) = self.by_deadline.pop_first().expect("checked non-empty above");
            self.by_key.remove(&key);
            task(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_moves_entry_to_tail() {
        let mut q: AgingQueue<&str> = AgingQueue::new(60);
        q.insert("a", 0);
        q.insert("b", 0);
        // a and b share a deadline of 60; a was inserted first so it is
        // the current head.
        assert!(q.bump(&"a", 30)); // a's new deadline is 90, now after b's 60
        let order: Vec<_> = q.by_deadline.values().copied().collect();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn sweep_removes_only_expired_entries_p4() {
        let mut q: AgingQueue<u32> = AgingQueue::new(60);
        q.insert(1, 0); // deadline 60
        q.insert(2, 0); // deadline 60
        q.bump(&1, 30); // deadline 90

        let mut expired = Vec::new();
        q.sweep(80, |k| expired.push(*k));
        assert_eq!(expired, vec![2]);
        assert!(q.find(&1).is_some());
        assert!(q.find(&2).is_none());

        let mut expired2 = Vec::new();
        q.sweep(95, |k| expired2.push(*k));
        assert_eq!(expired2, vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn queue_stays_sorted_by_deadline() {
        let mut q: AgingQueue<u32> = AgingQueue::new(10);
        for (i, t) in [0u64, 5, 2, 8, 1].into_iter().enumerate() {
            q.insert(i as u32, t);
        }
        let deadlines: Vec<u64> = q.by_deadline.keys().map(|(d, _)| *d).collect();
        let mut sorted = deadlines.clone();
        sorted.sort_unstable();
        assert_eq!(deadlines, sorted);
    }
}

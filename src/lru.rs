//! Size-bounded LRU core with an eviction callback.
//!
//! [`CacheCore`] pairs an [`OrderedIndex`] with a running byte total. Every
//! value is weighed on insertion by a caller-supplied `Fn(&V) -> u64`, and
//! any insertion that grows the total runs [`CacheCore::trim_to_size`], which
//! pops from the LRU end until the total fits the budget.
//!
//! The core knows nothing about disks. Evicted entries are handed to the
//! caller's `on_evict(key, value)` closure, which is where the disk layer
//! deletes artifacts and journals removals.
//!
//! ```text
//!   max_size = 25, get(A) already moved A to the MRU end
//!
//!   put(D, 10):  [B:10] [A:10] [D:10]        current = 30
//!                 LRU                MRU
//!   trim:        pop B → on_evict("B", ..)   current = 20
//!   after:       [A:10] [D:10]
//! ```

use std::borrow::Borrow;
use std::hash::Hash;

use crate::ds::ordered_index::{AccessOrder, Iter, OrderedIndex, RecencyMode};

/// A single value larger than the whole budget was offered to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("entry of {size} bytes exceeds maximum cache size of {max_size} bytes")]
pub struct EntryTooLarge {
    pub size: u64,
    pub max_size: u64,
}

/// Size-accounted LRU index.
///
/// Invariant: `current_size` equals the sum of the weights of all indexed
/// values, and is `<= max_size` whenever no call is in progress.
pub struct CacheCore<K, V, F, M = AccessOrder>
where
    F: Fn(&V) -> u64,
{
    index: OrderedIndex<K, V, M>,
    current_size: u64,
    max_size: u64,
    weigher: F,
}

impl<K, V, F, M> CacheCore<K, V, F, M>
where
    K: Eq + Hash + Clone,
    F: Fn(&V) -> u64,
    M: RecencyMode,
{
    /// Creates an empty core with the given byte budget and weigher.
    pub fn new(max_size: u64, weigher: F) -> Self {
        Self {
            index: OrderedIndex::new(),
            current_size: 0,
            max_size,
            weigher,
        }
    }

    /// Sum of the weights of all entries.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Configured byte budget.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Looks up `key`, refreshing its recency in access order.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key)
    }

    /// Looks up `key` without touching recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.peek(key)
    }

    /// Moves `key` to the MRU end; returns `false` on miss.
    pub fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.touch(key)
    }

    /// Inserts or replaces `key`, then trims.
    ///
    /// Values heavier than `max_size` are rejected before the index is
    /// touched. Returns the replaced value, if any. The replaced value is not
    /// passed to `on_evict`; only entries removed by trimming are.
    pub fn put(
        &mut self,
        key: K,
        value: V,
        on_evict: impl FnMut(K, V),
    ) -> Result<Option<V>, EntryTooLarge> {
        let weight = (self.weigher)(&value);
        if weight > self.max_size {
            return Err(EntryTooLarge {
                size: weight,
                max_size: self.max_size,
            });
        }

        let previous = self.index.put(key, value);
        if let Some(old) = &previous {
            self.current_size = self.current_size.saturating_sub((self.weigher)(old));
        }
        self.current_size += weight;
        self.trim_to_size(on_evict);
        Ok(previous)
    }

    /// Removes `key` and subtracts its weight.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.index.remove(key)?;
        self.current_size = self.current_size.saturating_sub((self.weigher)(&value));
        Some(value)
    }

    /// Evicts from the LRU end until `current_size <= max_size`.
    ///
    /// Re-reads the LRU end after every removal. Returns the number of
    /// evicted entries; a second call with no mutation in between evicts
    /// nothing.
    pub fn trim_to_size(&mut self, mut on_evict: impl FnMut(K, V)) -> usize {
        let mut evicted = 0;
        while self.current_size > self.max_size {
            let Some((key, value)) = self.index.pop_lru() else {
                break;
            };
            self.current_size = self.current_size.saturating_sub((self.weigher)(&value));
            on_evict(key, value);
            evicted += 1;
        }
        evicted
    }

    /// Changes the budget and trims to it.
    pub fn set_max_size(&mut self, max_size: u64, on_evict: impl FnMut(K, V)) -> usize {
        self.max_size = max_size;
        self.trim_to_size(on_evict)
    }

    /// Iterates `(key, value)` from LRU to MRU.
    pub fn iter(&self) -> Iter<'_, K, V, M> {
        self.index.iter()
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        self.index.debug_validate_invariants();
        let total: u64 = self.index.iter().map(|(_, v)| (self.weigher)(v)).sum();
        assert_eq!(total, self.current_size, "size accumulator drifted");
    }
}

impl<K, V, F, M> std::fmt::Debug for CacheCore<K, V, F, M>
where
    F: Fn(&V) -> u64,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("current_size", &self.current_size)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight(value: &u64) -> u64 {
        *value
    }

    fn core(max_size: u64) -> CacheCore<&'static str, u64, fn(&u64) -> u64> {
        CacheCore::new(max_size, weight)
    }

    #[test]
    fn put_tracks_size() {
        let mut cache = core(100);
        assert_eq!(cache.put("a", 10, |_, _| {}), Ok(None));
        assert_eq!(cache.put("b", 20, |_, _| {}), Ok(None));
        assert_eq!(cache.current_size(), 30);
        assert_eq!(cache.put("a", 5, |_, _| {}), Ok(Some(10)));
        assert_eq!(cache.current_size(), 25);
        assert_eq!(cache.remove("b"), Some(20));
        assert_eq!(cache.current_size(), 5);
        cache.debug_validate_invariants();
    }

    #[test]
    fn eviction_prefers_least_recently_used() {
        let mut cache = core(25);
        let mut evicted = Vec::new();
        cache.put("A", 10, |k, _| evicted.push(k)).unwrap();
        cache.put("B", 10, |k, _| evicted.push(k)).unwrap();
        cache.put("C", 10, |k, _| evicted.push(k)).unwrap();
        // Budget is 25, so inserting C already evicted A.
        assert_eq!(evicted, vec!["A"]);

        evicted.clear();
        let mut cache = core(25);
        cache.put("A", 10, |_, _| {}).unwrap();
        cache.put("B", 10, |_, _| {}).unwrap();
        assert!(cache.get("A").is_some());
        cache.put("D", 10, |k, _| evicted.push(k)).unwrap();
        assert_eq!(evicted, vec!["B"]);
        assert!(cache.contains_key("A"));
        assert!(cache.contains_key("D"));
        assert!(cache.current_size() <= cache.max_size());
    }

    #[test]
    fn oversized_entry_is_rejected_without_side_effects() {
        let mut cache = core(10);
        cache.put("a", 4, |_, _| {}).unwrap();
        let err = cache.put("big", 11, |_, _| panic!("no eviction expected"));
        assert_eq!(
            err,
            Err(EntryTooLarge {
                size: 11,
                max_size: 10
            })
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 4);
    }

    #[test]
    fn entry_equal_to_budget_evicts_everything_else() {
        let mut cache = core(10);
        cache.put("a", 3, |_, _| {}).unwrap();
        cache.put("b", 3, |_, _| {}).unwrap();
        let mut evicted = Vec::new();
        cache.put("c", 10, |k, _| evicted.push(k)).unwrap();
        assert_eq!(evicted, vec!["a", "b"]);
        assert_eq!(cache.current_size(), 10);
    }

    #[test]
    fn trim_to_size_is_idempotent() {
        let mut cache = core(100);
        for (key, size) in [("a", 30), ("b", 30), ("c", 30)] {
            cache.put(key, size, |_, _| {}).unwrap();
        }
        assert_eq!(cache.set_max_size(50, |_, _| {}), 2);
        assert_eq!(cache.trim_to_size(|_, _| panic!("nothing to evict")), 0);
        assert_eq!(cache.trim_to_size(|_, _| panic!("nothing to evict")), 0);
        assert_eq!(cache.current_size(), 30);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Put(u8, u64),
            Get(u8),
            Remove(u8),
            Resize(u64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0u8..32, 0u64..80).prop_map(|(k, w)| Op::Put(k, w)),
                2 => (0u8..32).prop_map(Op::Get),
                1 => (0u8..32).prop_map(Op::Remove),
                1 => (1u64..200).prop_map(Op::Resize),
            ]
        }

        proptest! {
            #[test]
            fn size_never_exceeds_budget(ops in prop::collection::vec(op_strategy(), 0..300)) {
                let mut cache: CacheCore<u8, u64, fn(&u64) -> u64> = CacheCore::new(100, weight);
                for op in ops {
                    match op {
                        Op::Put(k, w) => {
                            let result = cache.put(k, w, |_, _| {});
                            prop_assert_eq!(result.is_err(), w > cache.max_size());
                        }
                        Op::Get(k) => { cache.get(&k); }
                        Op::Remove(k) => { cache.remove(&k); }
                        Op::Resize(max) => { cache.set_max_size(max, |_, _| {}); }
                    }
                    prop_assert!(cache.current_size() <= cache.max_size());
                    let total: u64 = cache.iter().map(|(_, v)| *v).sum();
                    prop_assert_eq!(total, cache.current_size());
                }
            }
        }
    }
}

//! Hash-indexed recency list with O(1) reordering.
//!
//! Nodes live in a slot arena and are linked by `SlotId` rather than by
//! pointer, so the structure has no ownership cycles and no `unsafe`. A
//! `FxHashMap<K, SlotId>` resolves keys to nodes.
//!
//! ## Architecture
//!
//! ```text
//!   map (FxHashMap<K, SlotId>)          slots (Vec<Option<Node<K, V>>>)
//!   ┌─────────┬────────┐               ┌────────┬──────────────────────────────────┐
//!   │  "a"    │ id_0   │ ────────────► │ id_0   │ { a, prev: None,     next: id_2 }│
//!   │  "b"    │ id_2   │ ────────────► │ id_2   │ { b, prev: id_0,     next: id_1 }│
//!   │  "c"    │ id_1   │ ────────────► │ id_1   │ { c, prev: id_2,     next: None }│
//!   └─────────┴────────┘               └────────┴──────────────────────────────────┘
//!
//!   head ─► [a] ◄──► [b] ◄──► [c] ◄── tail
//!           LRU                MRU
//! ```
//!
//! ## Ordering modes
//!
//! The reordering rule is fixed at construction through the `M` type
//! parameter rather than a runtime flag:
//!
//! | Mode               | `put` new key | `put` existing key | `get` hit        |
//! |--------------------|---------------|--------------------|------------------|
//! | [`AccessOrder`]    | append at MRU | update, move MRU   | move to MRU      |
//! | [`InsertionOrder`] | append at MRU | update in place    | no reordering    |
//!
//! ## Iteration
//!
//! [`OrderedIndex::iter`] yields `(key, value)` from LRU to MRU and is
//! double-ended, so [`OrderedIndex::iter_descending`] is exactly its reverse.
//! Iterators borrow the index immutably; eviction loops must re-query
//! [`OrderedIndex::peek_lru`] after each removal instead of holding one.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::iter::{FusedIterator, Rev};
use std::marker::PhantomData;

use rustc_hash::FxHashMap;

/// Stable handle to a node slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(usize);

/// Reordering rule for an [`OrderedIndex`].
pub trait RecencyMode {
    /// Whether reads and in-place updates move a node to the MRU end.
    const REORDER_ON_ACCESS: bool;
}

/// True LRU: reads and updates refresh recency.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessOrder;

impl RecencyMode for AccessOrder {
    const REORDER_ON_ACCESS: bool = true;
}

/// Insertion order: only new keys change the order.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertionOrder;

impl RecencyMode for InsertionOrder {
    const REORDER_ON_ACCESS: bool = false;
}

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Recency-ordered map: LRU at the head, MRU at the tail.
pub struct OrderedIndex<K, V, M = AccessOrder> {
    map: FxHashMap<K, SlotId>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    _mode: PhantomData<M>,
}

impl<K, V, M> OrderedIndex<K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty index with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            _mode: PhantomData,
        }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns `true` if `key` is present. Never reorders.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Looks up `key`; in access order a hit moves the entry to the MRU end.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = *self.map.get(key)?;
        if M::REORDER_ON_ACCESS {
            self.move_to_back(id);
        }
        self.node(id).map(|node| &node.value)
    }

    /// Looks up `key` without touching recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = *self.map.get(key)?;
        self.node(id).map(|node| &node.value)
    }

    /// Mutable lookup without touching recency.
    pub fn peek_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = *self.map.get(key)?;
        self.node_mut(id).map(|node| &mut node.value)
    }

    /// Inserts or updates `key`, returning the previous value.
    ///
    /// New keys are appended at the MRU end. An existing key is updated in
    /// place and, in access order, moved to the MRU end.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&id) = self.map.get(&key) {
            let previous = self
                .node_mut(id)
                .map(|node| std::mem::replace(&mut node.value, value));
            if M::REORDER_ON_ACCESS {
                self.move_to_back(id);
            }
            return previous;
        }

        let id = self.alloc(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.attach_back(id);
        self.map.insert(key, id);
        None
    }

    /// Moves `key` to the MRU end regardless of mode; returns `false` on miss.
    pub fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get(key) {
            Some(&id) => {
                self.move_to_back(id);
                true
            },
            None => false,
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = self.map.remove(key)?;
        self.release(id).map(|node| node.value)
    }

    /// Returns the least recently used entry.
    pub fn peek_lru(&self) -> Option<(&K, &V)> {
        self.head
            .and_then(|id| self.node(id))
            .map(|node| (&node.key, &node.value))
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let id = self.head?;
        let node = self.release(id)?;
        self.map.remove(&node.key);
        Some((node.key, node.value))
    }

    /// Iterates `(key, value)` from LRU to MRU.
    pub fn iter(&self) -> Iter<'_, K, V, M> {
        Iter {
            index: self,
            front: self.head,
            back: self.tail,
            remaining: self.len(),
        }
    }

    /// Alias for [`iter`](Self::iter).
    pub fn iter_ascending(&self) -> Iter<'_, K, V, M> {
        self.iter()
    }

    /// Iterates `(key, value)` from MRU to LRU.
    pub fn iter_descending(&self) -> Rev<Iter<'_, K, V, M>> {
        self.iter().rev()
    }

    /// Iterates keys from LRU to MRU.
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }


    fn node(&self, id: SlotId) -> Option<&Node<K, V>> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    fn alloc(&mut self, node: Node<K, V>) -> SlotId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            SlotId(idx)
        } else {
            self.slots.push(Some(node));
            SlotId(self.slots.len() - 1)
        }
    }

    fn release(&mut self, id: SlotId) -> Option<Node<K, V>> {
        self.detach(id)?;
        let node = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(node)
    }

    fn move_to_back(&mut self, id: SlotId) {
        if self.tail == Some(id) {
            return;
        }
        if self.detach(id).is_some() {
            self.attach_back(id);
        }
    }

    fn detach(&mut self, id: SlotId) -> Option<()> {
        let (prev, next) = {
            let node = self.node(id)?;
            (node.prev, node.next)
        };

        match prev {
            Some(prev_id) => {
                if let Some(prev_node) = self.node_mut(prev_id) {
                    prev_node.next = next;
                }
            },
            None => self.head = next,
        }

        match next {
            Some(next_id) => {
                if let Some(next_node) = self.node_mut(next_id) {
                    next_node.prev = prev;
                }
            },
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = None;
        }
        Some(())
    }

    fn attach_back(&mut self, id: SlotId) {
        let old_tail = self.tail;
        if let Some(node) = self.node_mut(id) {
            node.prev = old_tail;
            node.next = None;
        } else {
            return;
        }
        match old_tail {
            Some(tail_id) => {
                if let Some(tail_node) = self.node_mut(tail_id) {
                    tail_node.next = Some(id);
                }
            },
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        if self.head.is_none() || self.tail.is_none() {
            assert!(self.head.is_none());
            assert!(self.tail.is_none());
            assert!(self.map.is_empty());
            return;
        }

        let mut count = 0usize;
        let mut prev = None;
        let mut current = self.head;
        while let Some(id) = current {
            let node = self.node(id).expect("linked slot is empty");
            assert_eq!(node.prev, prev);
            assert_eq!(self.map.get(&node.key), Some(&id));
            prev = Some(id);
            current = node.next;
            count += 1;
            assert!(count <= self.map.len(), "cycle in recency list");
        }
        assert_eq!(prev, self.tail);
        assert_eq!(count, self.map.len());
        assert_eq!(self.slots.len() - self.free.len(), self.map.len());
    }
}

impl<K, V, M> Default for OrderedIndex<K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, M> fmt::Debug for OrderedIndex<K, V, M>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: fmt::Debug,
    M: RecencyMode,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Double-ended iterator over an [`OrderedIndex`], LRU first.
pub struct Iter<'a, K, V, M> {
    index: &'a OrderedIndex<K, V, M>,
    front: Option<SlotId>,
    back: Option<SlotId>,
    remaining: usize,
}

impl<'a, K, V, M> Iterator for Iter<'a, K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.front?;
        let node = self.index.node(id)?;
        self.front = node.next;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V, M> DoubleEndedIterator for Iter<'_, K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.back?;
        let node = self.index.node(id)?;
        self.back = node.prev;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }
}

impl<K, V, M> ExactSizeIterator for Iter<'_, K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
}

impl<K, V, M> FusedIterator for Iter<'_, K, V, M>
where
    K: Eq + Hash + Clone,
    M: RecencyMode,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of<M: RecencyMode>(index: &OrderedIndex<&'static str, i32, M>) -> Vec<&'static str> {
        index.keys().copied().collect()
    }

    #[test]
    fn put_appends_at_mru_end() {
        let mut index: OrderedIndex<&str, i32> = OrderedIndex::new();
        assert_eq!(index.put("a", 1), None);
        assert_eq!(index.put("b", 2), None);
        assert_eq!(index.put("c", 3), None);

        assert_eq!(keys_of(&index), vec!["a", "b", "c"]);
        assert_eq!(index.peek_lru(), Some((&"a", &1)));
        assert_eq!(index.iter_descending().next(), Some((&"c", &3)));
        index.debug_validate_invariants();
    }

    #[test]
    fn access_order_get_moves_to_mru() {
        let mut index: OrderedIndex<&str, i32, AccessOrder> = OrderedIndex::new();
        index.put("a", 1);
        index.put("b", 2);
        index.put("c", 3);

        assert_eq!(index.get("a"), Some(&1));
        assert_eq!(keys_of(&index), vec!["b", "c", "a"]);

        assert_eq!(index.put("b", 20), Some(2));
        assert_eq!(keys_of(&index), vec!["c", "a", "b"]);
        index.debug_validate_invariants();
    }

    #[test]
    fn insertion_order_ignores_reads_and_updates() {
        let mut index: OrderedIndex<&str, i32, InsertionOrder> = OrderedIndex::new();
        index.put("a", 1);
        index.put("b", 2);
        index.put("c", 3);

        assert_eq!(index.get("a"), Some(&1));
        assert_eq!(index.put("b", 20), Some(2));
        assert_eq!(keys_of(&index), vec!["a", "b", "c"]);
        assert_eq!(index.peek("b"), Some(&20));

        assert!(index.touch("a"));
        assert_eq!(keys_of(&index), vec!["b", "c", "a"]);
    }

    #[test]
    fn peek_never_reorders() {
        let mut index: OrderedIndex<&str, i32> = OrderedIndex::new();
        index.put("a", 1);
        index.put("b", 2);
        assert_eq!(index.peek("a"), Some(&1));
        assert_eq!(keys_of(&index), vec!["a", "b"]);
        assert!(index.contains_key("a"));
        assert!(!index.contains_key("z"));
    }

    #[test]
    fn remove_unlinks_head_middle_and_tail() {
        let mut index: OrderedIndex<&str, i32> = OrderedIndex::new();
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            index.put(key, i as i32);
        }

        assert_eq!(index.remove("b"), Some(1));
        assert_eq!(keys_of(&index), vec!["a", "c", "d"]);
        assert_eq!(index.remove("a"), Some(0));
        assert_eq!(keys_of(&index), vec!["c", "d"]);
        assert_eq!(index.remove("d"), Some(3));
        assert_eq!(keys_of(&index), vec!["c"]);
        assert_eq!(index.remove("d"), None);
        index.debug_validate_invariants();

        assert_eq!(index.remove("c"), Some(2));
        assert!(index.is_empty());
        assert_eq!(index.peek_lru(), None);
        index.debug_validate_invariants();
    }

    #[test]
    fn pop_lru_drains_in_recency_order() {
        let mut index: OrderedIndex<&str, i32> = OrderedIndex::new();
        index.put("a", 1);
        index.put("b", 2);
        index.put("c", 3);
        index.get("a");

        assert_eq!(index.pop_lru(), Some(("b", 2)));
        assert_eq!(index.pop_lru(), Some(("c", 3)));
        assert_eq!(index.pop_lru(), Some(("a", 1)));
        assert_eq!(index.pop_lru(), None);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let mut index: OrderedIndex<u32, u32> = OrderedIndex::new();
        for i in 0..8 {
            index.put(i, i);
        }
        for i in 0..4 {
            index.remove(&i);
        }
        for i in 100..104 {
            index.put(i, i);
        }
        assert_eq!(index.slots.len(), 8);
        assert_eq!(index.len(), 8);
        index.debug_validate_invariants();
    }

    #[test]
    fn descending_is_reverse_of_ascending() {
        let mut index: OrderedIndex<&str, i32> = OrderedIndex::new();
        index.put("a", 1);
        index.put("b", 2);
        index.put("c", 3);
        index.get("b");

        let ascending: Vec<_> = index.iter_ascending().map(|(k, _)| *k).collect();
        let mut descending: Vec<_> = index.iter_descending().map(|(k, _)| *k).collect();
        assert_eq!(ascending, vec!["a", "c", "b"]);
        descending.reverse();
        assert_eq!(ascending, descending);
    }

    #[test]
    fn iterator_is_restartable_and_exact_size() {
        let mut index: OrderedIndex<u8, u8> = OrderedIndex::new();
        index.put(1, 1);
        index.put(2, 2);
        let it = index.iter();
        assert_eq!(it.len(), 2);
        assert_eq!(index.iter().count(), 2);
        assert_eq!(index.iter().count(), 2);

        let mut mixed = index.iter();
        assert_eq!(mixed.next(), Some((&1, &1)));
        assert_eq!(mixed.next_back(), Some((&2, &2)));
        assert_eq!(mixed.next(), None);
        assert_eq!(mixed.next_back(), None);
    }

    #[test]
    fn string_keys_are_looked_up_by_str() {
        let mut index: OrderedIndex<String, u64> = OrderedIndex::new();
        index.put("alpha".to_string(), 1);
        assert_eq!(index.get("alpha"), Some(&1));
        assert_eq!(index.remove("alpha"), Some(1));
    }


    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Put(u8, u16),
            Get(u8),
            Remove(u8),
            PopLru,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..16, any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
                (0u8..16).prop_map(Op::Get),
                (0u8..16).prop_map(Op::Remove),
                Just(Op::PopLru),
            ]
        }

        proptest! {
            #[test]
            fn matches_vec_model_in_access_order(ops in prop::collection::vec(op_strategy(), 0..200)) {
                let mut index: OrderedIndex<u8, u16> = OrderedIndex::new();
                // LRU first
                let mut model: Vec<(u8, u16)> = Vec::new();

                for op in ops {
                    match op {
                        Op::Put(k, v) => {
                            let prev = model.iter().position(|(mk, _)| *mk == k).map(|pos| model.remove(pos).1);
                            model.push((k, v));
                            prop_assert_eq!(index.put(k, v), prev);
                        }
                        Op::Get(k) => {
                            let expected = model.iter().position(|(mk, _)| *mk == k).map(|pos| {
                                let entry = model.remove(pos);
                                model.push(entry);
                                entry.1
                            });
                            prop_assert_eq!(index.get(&k).copied(), expected);
                        }
                        Op::Remove(k) => {
                            let expected = model.iter().position(|(mk, _)| *mk == k).map(|pos| model.remove(pos).1);
                            prop_assert_eq!(index.remove(&k), expected);
                        }
                        Op::PopLru => {
                            let expected = if model.is_empty() { None } else { Some(model.remove(0)) };
                            prop_assert_eq!(index.pop_lru(), expected);
                        }
                    }
                    index.debug_validate_invariants();
                }

                let actual: Vec<_> = index.iter().map(|(k, v)| (*k, *v)).collect();
                prop_assert_eq!(actual, model);
            }

            #[test]
            fn descending_reverses_ascending(ops in prop::collection::vec(op_strategy(), 0..200)) {
                let mut index: OrderedIndex<u8, u16> = OrderedIndex::new();
                for op in ops {
                    match op {
                        Op::Put(k, v) => { index.put(k, v); }
                        Op::Get(k) => { index.get(&k); }
                        Op::Remove(k) => { index.remove(&k); }
                        Op::PopLru => { index.pop_lru(); }
                    }
                }
                let ascending: Vec<_> = index.iter_ascending().map(|(k, _)| *k).collect();
                let mut descending: Vec<_> = index.iter_descending().map(|(k, _)| *k).collect();
                descending.reverse();
                prop_assert_eq!(ascending, descending);
            }
        }
    }
}

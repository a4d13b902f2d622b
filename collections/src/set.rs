use crate::ref_store::Ref;
use fixedbitset::FixedBitSet;

/// A set of dense indices that remembers insertion order.
///
/// Membership is a bitmap, iteration and `drain` walk the insertion sequence.
/// This is the shape needed by the inconsistent-entry stash of a repairing
/// search: cheap dedup on insert, then a bulk drain back into the open list.
#[derive(Clone)]
pub struct IterSet<K> {
    items: Vec<K>,
    member: FixedBitSet,
}

impl<K: Ref> Default for IterSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ref> IterSet<K> {
    pub fn new() -> IterSet<K> {
        IterSet {
            items: Vec::new(),
            member: FixedBitSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, k: K) -> bool {
        self.member.contains(k.into())
    }

    /// Inserts the key, ignoring duplicates.
    pub fn insert(&mut self, k: K) {
        let idx: usize = k.into();
        if idx >= self.member.len() {
            self.member.grow(idx + 1);
        }
        if !self.member.put(idx) {
            self.items.push(k);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.items.iter().copied()
    }

    /// Empties the set, yielding the keys in insertion order.
    pub fn drain(&mut self) -> impl Iterator<Item = K> + '_ {
        self.member.clear();
        self.items.drain(..)
    }

    pub fn clear(&mut self) {
        self.member.clear();
        self.items.clear();
    }
}

use crate::ref_store::Ref;

/// Slot of an enqueued key inside the heap vector, kept in a dense side table
/// so that membership tests and in-place priority updates are O(1)/O(log n).
const ABSENT: u32 = u32::MAX;

/// An index-keyed binary min-heap: the entry with the *smallest* priority is popped first.
///
/// Keys are dense indices (see [`Ref`]); every key carries its position in the
/// heap vector, which is what allows the `contains`, `adjust` and `erase`
/// operations a repairing search needs on its open list.
pub struct OpenList<K, P> {
    heap: Vec<(K, P)>,
    slots: Vec<u32>,
}

impl<K: Ref, P: PartialOrd + Copy> Default for OpenList<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ref, P: PartialOrd + Copy> OpenList<K, P> {
    pub fn new() -> Self {
        OpenList {
            heap: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.slots.get(key.into()).copied().unwrap_or(ABSENT) != ABSENT
    }

    /// Priority of an enqueued key. Panics if the key is not enqueued.
    pub fn priority(&self, key: K) -> P {
        let slot = self.slot(key);
        self.heap[slot].1
    }

    pub fn peek(&self) -> Option<(K, P)> {
        self.heap.first().copied()
    }

    pub fn push(&mut self, key: K, priority: P) {
        debug_assert!(!self.contains(key), "Key already enqueued");
        let idx = key.into();
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, ABSENT);
        }
        let place = self.heap.len();
        self.heap.push((key, priority));
        self.sift_up(place);
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.heap.is_empty() {
            return None;
        }
        let (key, prio) = self.heap.swap_remove(0);
        self.slots[key.into()] = ABSENT;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some((key, prio))
    }

    /// Re-prioritizes an enqueued key in place.
    pub fn adjust(&mut self, key: K, priority: P) {
        let slot = self.slot(key);
        self.heap[slot].1 = priority;
        self.sift_down(slot);
        self.sift_up(slot);
    }

    /// Removes an enqueued key from anywhere in the heap.
    pub fn erase(&mut self, key: K) {
        let slot = self.slot(key);
        self.slots[key.into()] = ABSENT;
        if slot == self.heap.len() - 1 {
            self.heap.pop();
        } else {
            self.heap.swap_remove(slot);
            self.slots[self.heap[slot].0.into()] = slot as u32;
            self.sift_down(slot);
            self.sift_up(slot);
        }
    }

    /// Recomputes the priority of every enqueued key and restores the heap
    /// property in one bottom-up pass. O(n), for bulk re-keying (e.g. after a
    /// change of the heuristic inflation).
    pub fn rebuild(&mut self, mut priority_of: impl FnMut(K) -> P) {
        for entry in self.heap.iter_mut() {
            entry.1 = priority_of(entry.0);
        }
        let n = self.heap.len();
        for i in (0..n / 2).rev() {
            self.sift_down(i);
        }
        // sift_down only re-records slots it moves through
        for (place, (key, _)) in self.heap.iter().enumerate() {
            self.slots[(*key).into()] = place as u32;
        }
    }

    pub fn clear(&mut self) {
        for (key, _) in self.heap.drain(..) {
            self.slots[key.into()] = ABSENT;
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.heap.iter().map(|e| e.0)
    }

    fn slot(&self, key: K) -> usize {
        let slot = self.slots[key.into()];
        debug_assert!(slot != ABSENT, "Key not enqueued");
        slot as usize
    }

    fn sift_up(&mut self, mut i: usize) {
        let (key, prio) = self.heap[i];
        while i > 0 {
            let p = (i - 1) >> 1;
            let (above_key, above_prio) = self.heap[p];
            if prio < above_prio {
                self.slots[above_key.into()] = i as u32;
                self.heap.swap(i, p);
                i = p;
            } else {
                break;
            }
        }
        self.slots[key.into()] = i as u32;
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        let (key, prio) = self.heap[i];
        loop {
            let c = {
                let l = i * 2 + 1;
                if l >= len {
                    break;
                }
                let r = i * 2 + 2;
                if r < len && self.heap[r].1 < self.heap[l].1 {
                    r
                } else {
                    l
                }
            };

            if self.heap[c].1 < prio {
                self.slots[self.heap[c].0.into()] = i as u32;
                self.heap.swap(c, i);
                i = c;
            } else {
                break;
            }
        }

        self.slots[key.into()] = i as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn drain(h: &mut OpenList<usize, u64>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some((_, p)) = h.pop() {
            out.push(p);
        }
        out
    }

    #[test]
    fn pops_in_ascending_priority_order() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut h = OpenList::new();
        let mut reference: Vec<u64> = (0..500).map(|_| rng.random_range(0..10_000)).collect();
        for (k, &p) in reference.iter().enumerate() {
            h.push(k, p);
            assert!(h.contains(k));
        }
        reference.sort_unstable();
        assert_eq!(drain(&mut h), reference);
    }

    #[test]
    fn adjust_moves_entries_both_ways() {
        let mut h = OpenList::new();
        for k in 0..10usize {
            h.push(k, k as u64 * 10);
        }
        h.adjust(9, 1); // to the front
        h.adjust(0, 1000); // to the back
        assert_eq!(h.pop(), Some((9, 1)));
        let rest = drain(&mut h);
        assert_eq!(*rest.last().unwrap(), 1000);
    }

    #[test]
    fn erase_removes_from_the_middle() {
        let mut h = OpenList::new();
        for k in 0..100usize {
            h.push(k, (k as u64 * 7919) % 101);
        }
        for k in (0..100).step_by(3) {
            h.erase(k);
            assert!(!h.contains(k));
        }
        let drained = drain(&mut h);
        assert_eq!(drained.len(), 66);
        assert!(drained.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rebuild_restores_order_after_bulk_rekey() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut h = OpenList::new();
        let prios: Vec<u64> = (0..200).map(|_| rng.random_range(0..1_000)).collect();
        for (k, &p) in prios.iter().enumerate() {
            h.push(k, p);
        }
        // invert the ordering wholesale
        h.rebuild(|k| 1_000 - prios[k]);
        let mut expected: Vec<u64> = prios.iter().map(|p| 1_000 - p).collect();
        expected.sort_unstable();
        assert_eq!(drain(&mut h), expected);
    }

    #[test]
    fn random_interleaving_matches_reference() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut h: OpenList<usize, u64> = OpenList::new();
        let mut model: std::collections::HashMap<usize, u64> = Default::default();
        for step in 0..5_000 {
            let key = rng.random_range(0..64usize);
            match rng.random_range(0..4u8) {
                0 => {
                    if !model.contains_key(&key) {
                        let p = rng.random_range(0..1_000);
                        h.push(key, p);
                        model.insert(key, p);
                    }
                }
                1 => {
                    if model.contains_key(&key) {
                        let p = rng.random_range(0..1_000);
                        h.adjust(key, p);
                        model.insert(key, p);
                    }
                }
                2 => {
                    if model.remove(&key).is_some() {
                        h.erase(key);
                    }
                }
                _ => {
                    if let Some((k, p)) = h.pop() {
                        let min = *model.values().min().unwrap();
                        assert_eq!(p, min, "step {step}");
                        assert_eq!(model.remove(&k), Some(p));
                    } else {
                        assert!(model.is_empty());
                    }
                }
            }
            assert_eq!(h.len(), model.len());
        }
    }
}

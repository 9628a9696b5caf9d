//! Hash-consed points-to sets.
//!
//! A points-to set is an immutable sorted set of memory-object ids, interned
//! in a [`PtsSetPool`] so that id equality implies set equality. All set
//! operations return (possibly new) ids; the underlying storage lives until
//! the pool is dropped. Id 0 is the distinguished empty set.

use super::super::memory::MemObjId;
use fnv::FnvHashMap;
use std::sync::Arc;

/// An interned points-to set. Id 0 is the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PtsSetId(pub u32);

impl PtsSetId {
    pub const EMPTY: PtsSetId = PtsSetId(0);

    pub fn is_empty(self) -> bool {
        self == PtsSetId::EMPTY
    }
}

/// The interning pool for points-to sets.
pub struct PtsSetPool {
    sets: Vec<Arc<[MemObjId]>>,
    intern: FnvHashMap<Arc<[MemObjId]>, PtsSetId>,
}

impl Default for PtsSetPool {
    fn default() -> Self {
        PtsSetPool::new()
    }
}

impl PtsSetPool {
    pub fn new() -> Self {
        let empty: Arc<[MemObjId]> = Arc::from(Vec::new().into_boxed_slice());
        let mut intern = FnvHashMap::default();
        intern.insert(empty.clone(), PtsSetId::EMPTY);
        PtsSetPool {
            sets: vec![empty],
            intern,
        }
    }

    fn intern_sorted(&mut self, elems: Vec<MemObjId>) -> PtsSetId {
        debug_assert!(elems.windows(2).all(|w| w[0] < w[1]));
        let key: Arc<[MemObjId]> = Arc::from(elems.into_boxed_slice());
        if let Some(existing) = self.intern.get(&key) {
            return *existing;
        }
        let id = PtsSetId(self.sets.len() as u32);
        self.sets.push(key.clone());
        self.intern.insert(key, id);
        id
    }

    /// The set containing exactly one object.
    pub fn singleton(&mut self, obj: MemObjId) -> PtsSetId {
        self.intern_sorted(vec![obj])
    }

    /// Insert an object into a set, returning the (possibly new) result set.
    pub fn insert(&mut self, set: PtsSetId, obj: MemObjId) -> PtsSetId {
        let elems = self.elements(set);
        if elems.binary_search(&obj).is_ok() {
            return set;
        }
        let mut new_elems = Vec::with_capacity(elems.len() + 1);
        new_elems.extend_from_slice(elems);
        let pos = new_elems.binary_search(&obj).unwrap_err();
        new_elems.insert(pos, obj);
        self.intern_sorted(new_elems)
    }

    /// The union of two sets.
    pub fn merge(&mut self, a: PtsSetId, b: PtsSetId) -> PtsSetId {
        if a == b || b.is_empty() {
            return a;
        }
        if a.is_empty() {
            return b;
        }
        let left = self.elements(a).to_vec();
        let right = self.elements(b).to_vec();
        let mut merged = Vec::with_capacity(left.len() + right.len());
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(left[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(right[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(left[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);
        self.intern_sorted(merged)
    }

    /// The union of many sets.
    pub fn merge_all(&mut self, sets: &[PtsSetId]) -> PtsSetId {
        let mut result = PtsSetId::EMPTY;
        for set in sets {
            result = self.merge(result, *set);
        }
        result
    }

    /// Build a set from an arbitrary (unsorted, possibly duplicated) list.
    pub fn from_objects(&mut self, mut objs: Vec<MemObjId>) -> PtsSetId {
        objs.sort_unstable();
        objs.dedup();
        self.intern_sorted(objs)
    }

    /// The elements of a set, sorted ascending.
    pub fn elements(&self, set: PtsSetId) -> &[MemObjId] {
        &self.sets[set.0 as usize]
    }

    pub fn contains(&self, set: PtsSetId, obj: MemObjId) -> bool {
        self.elements(set).binary_search(&obj).is_ok()
    }

    pub fn len(&self, set: PtsSetId) -> usize {
        self.elements(set).len()
    }

    /// Number of distinct sets in the pool (including the empty set).
    pub fn pool_size(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_consing() {
        let mut pool = PtsSetPool::new();
        let a = pool.from_objects(vec![MemObjId(3), MemObjId(1)]);
        let b = pool.from_objects(vec![MemObjId(1), MemObjId(3), MemObjId(1)]);
        assert_eq!(a, b);
        assert_eq!(pool.elements(a), &[MemObjId(1), MemObjId(3)]);
    }

    #[test]
    fn insert_returns_same_id_when_present() {
        let mut pool = PtsSetPool::new();
        let a = pool.singleton(MemObjId(5));
        assert_eq!(pool.insert(a, MemObjId(5)), a);
        let b = pool.insert(a, MemObjId(2));
        assert_ne!(a, b);
        assert_eq!(pool.elements(b), &[MemObjId(2), MemObjId(5)]);
    }

    #[test]
    fn merge_behaves_like_union() {
        let mut pool = PtsSetPool::new();
        let a = pool.from_objects(vec![MemObjId(1), MemObjId(3)]);
        let b = pool.from_objects(vec![MemObjId(2), MemObjId(3)]);
        let ab = pool.merge(a, b);
        assert_eq!(pool.elements(ab), &[MemObjId(1), MemObjId(2), MemObjId(3)]);
        assert_eq!(pool.merge(ab, PtsSetId::EMPTY), ab);
        assert_eq!(pool.merge(PtsSetId::EMPTY, ab), ab);
    }
}

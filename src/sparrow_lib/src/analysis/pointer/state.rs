//! The pointer analysis state: environment, store and memo.
//!
//! The environment maps top-level pointers to points-to sets; it is global
//! and monotone (entries only grow). The store maps memory objects to
//! points-to sets; one store value lives per program point in the memo and
//! flows along the memory-level edges of the semi-sparse program.

use super::pointer_manager::PointerId;
use super::pts_set::{PtsSetId, PtsSetPool};
use super::semi_sparse::SsProgramPoint;
use crate::analysis::memory::MemObjId;
use fnv::FnvHashMap;

/// The top-level environment: pointer -> points-to set.
#[derive(Debug, Clone, Default)]
pub struct Env {
    map: FnvHashMap<PointerId, PtsSetId>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    pub fn lookup(&self, ptr: PointerId) -> PtsSetId {
        self.map.get(&ptr).copied().unwrap_or(PtsSetId::EMPTY)
    }

    /// Join `set` into the entry of `ptr`. Returns true if the entry grew.
    pub fn weak_update(&mut self, ptr: PointerId, set: PtsSetId, pool: &mut PtsSetPool) -> bool {
        if set.is_empty() {
            return false;
        }
        let old = self.lookup(ptr);
        let merged = pool.merge(old, set);
        if merged == old {
            return false;
        }
        self.map.insert(ptr, merged);
        true
    }

    /// Replace the entry of `ptr`. Only used when seeding the environment
    /// (globals, function addresses); fixpoint updates are always weak.
    pub fn strong_update(&mut self, ptr: PointerId, set: PtsSetId) -> bool {
        let old = self.map.insert(ptr, set);
        old != Some(set)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PointerId, PtsSetId)> + '_ {
        self.map.iter().map(|(p, s)| (*p, *s))
    }
}

/// A memory store: memory object -> points-to set.
#[derive(Debug, Clone, Default)]
pub struct Store {
    map: FnvHashMap<MemObjId, PtsSetId>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub fn lookup(&self, obj: MemObjId) -> PtsSetId {
        self.map.get(&obj).copied().unwrap_or(PtsSetId::EMPTY)
    }

    /// Replace the binding of `obj` with `set`.
    pub fn strong_update(&mut self, obj: MemObjId, set: PtsSetId) -> bool {
        let old = self.map.insert(obj, set);
        old != Some(set)
    }

    /// Join `set` into the binding of `obj`.
    pub fn weak_update(&mut self, obj: MemObjId, set: PtsSetId, pool: &mut PtsSetPool) -> bool {
        if set.is_empty() {
            return false;
        }
        let old = self.lookup(obj);
        let merged = pool.merge(old, set);
        if merged == old {
            return false;
        }
        self.map.insert(obj, merged);
        true
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemObjId, PtsSetId)> + '_ {
        self.map.iter().map(|(o, s)| (*o, *s))
    }
}

/// The memo: one store per program point.
#[derive(Debug, Clone, Default)]
pub struct Memo {
    map: FnvHashMap<SsProgramPoint, Store>,
}

impl Memo {
    pub fn new() -> Self {
        Memo::default()
    }

    pub fn lookup(&self, pp: SsProgramPoint) -> Option<&Store> {
        self.map.get(&pp)
    }

    /// Join `store` into the memo entry of `pp`, object by object. Returns
    /// true if any binding grew.
    pub fn update(&mut self, pp: SsProgramPoint, store: &Store, pool: &mut PtsSetPool) -> bool {
        let entry = self.map.entry(pp).or_default();
        let mut changed = false;
        for (obj, set) in store.iter() {
            changed |= entry.weak_update(obj, set, pool);
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SsProgramPoint, &Store)> + '_ {
        self.map.iter().map(|(pp, s)| (*pp, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_updates_are_monotone() {
        let mut pool = PtsSetPool::new();
        let mut env = Env::new();
        let a = pool.singleton(MemObjId(1));
        let b = pool.singleton(MemObjId(2));
        let p = PointerId(0);
        assert!(env.weak_update(p, a, &mut pool));
        assert!(!env.weak_update(p, a, &mut pool));
        assert!(env.weak_update(p, b, &mut pool));
        assert_eq!(pool.len(env.lookup(p)), 2);
        // Joining the empty set never changes anything.
        assert!(!env.weak_update(p, PtsSetId::EMPTY, &mut pool));
    }

    #[test]
    fn store_strong_vs_weak() {
        let mut pool = PtsSetPool::new();
        let mut store = Store::new();
        let a = pool.singleton(MemObjId(1));
        let b = pool.singleton(MemObjId(2));
        let obj = MemObjId(7);
        store.weak_update(obj, a, &mut pool);
        store.weak_update(obj, b, &mut pool);
        assert_eq!(pool.len(store.lookup(obj)), 2);
        store.strong_update(obj, b);
        assert_eq!(store.lookup(obj), b);
    }

    #[test]
    fn memo_detects_changes() {
        let mut pool = PtsSetPool::new();
        let mut memo = Memo::new();
        let mut store = Store::new();
        let a = pool.singleton(MemObjId(1));
        store.weak_update(MemObjId(3), a, &mut pool);
        let pp = SsProgramPoint::new(
            crate::context::CtxId::GLOBAL,
            super::super::semi_sparse::NodeId(0),
        );
        assert!(memo.update(pp, &store, &mut pool));
        assert!(!memo.update(pp, &store, &mut pool));
    }
}

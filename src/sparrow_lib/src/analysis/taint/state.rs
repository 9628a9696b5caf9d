//! The taint analysis state: environment, store and memo.

use super::lattice::TaintLattice;
use crate::analysis::def_use::TaintProgramPoint;
use crate::analysis::memory::MemObjId;
use crate::context::CtxId;
use crate::intermediate_representation::ValueId;
use fnv::FnvHashMap;

/// A value observed in a calling context; the key of the taint environment.
pub type TaintValue = (CtxId, ValueId);

/// The top-level taint environment: (context, value) -> lattice point.
#[derive(Debug, Clone, Default)]
pub struct TaintEnv {
    map: FnvHashMap<TaintValue, TaintLattice>,
}

impl TaintEnv {
    pub fn new() -> Self {
        TaintEnv::default()
    }

    pub fn lookup(&self, tv: TaintValue) -> TaintLattice {
        self.map.get(&tv).copied().unwrap_or(TaintLattice::Unknown)
    }

    /// Replace the entry. Returns true if the stored value changed.
    pub fn strong_update(&mut self, tv: TaintValue, value: TaintLattice) -> bool {
        if value == TaintLattice::Unknown {
            return false;
        }
        self.map.insert(tv, value) != Some(value)
    }

    /// Join into the entry. Returns true if the stored value grew.
    pub fn weak_update(&mut self, tv: TaintValue, value: TaintLattice) -> bool {
        let old = self.lookup(tv);
        let merged = old.merge(value);
        if merged == old {
            return false;
        }
        self.map.insert(tv, merged);
        true
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaintValue, TaintLattice)> + '_ {
        self.map.iter().map(|(k, v)| (*k, *v))
    }
}

/// A taint store: memory object -> lattice point.
#[derive(Debug, Clone, Default)]
pub struct TaintStore {
    map: FnvHashMap<MemObjId, TaintLattice>,
}

impl TaintStore {
    pub fn new() -> Self {
        TaintStore::default()
    }

    pub fn lookup(&self, obj: MemObjId) -> TaintLattice {
        self.map.get(&obj).copied().unwrap_or(TaintLattice::Unknown)
    }

    pub fn strong_update(&mut self, obj: MemObjId, value: TaintLattice) -> bool {
        if value == TaintLattice::Unknown {
            return false;
        }
        self.map.insert(obj, value) != Some(value)
    }

    pub fn weak_update(&mut self, obj: MemObjId, value: TaintLattice) -> bool {
        let old = self.lookup(obj);
        let merged = old.merge(value);
        if merged == old {
            return false;
        }
        self.map.insert(obj, merged);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemObjId, TaintLattice)> + '_ {
        self.map.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// The memo: one taint store per program point, with per-object change
/// detection to prune the work list.
#[derive(Debug, Clone, Default)]
pub struct TaintMemo {
    map: FnvHashMap<TaintProgramPoint, TaintStore>,
}

impl TaintMemo {
    pub fn new() -> Self {
        TaintMemo::default()
    }

    pub fn lookup(&self, pp: TaintProgramPoint) -> Option<&TaintStore> {
        self.map.get(&pp)
    }

    /// Join one binding into the memo entry of `pp`. Unknown never changes
    /// anything. Returns true if the binding grew.
    pub fn insert(&mut self, pp: TaintProgramPoint, obj: MemObjId, value: TaintLattice) -> bool {
        if value == TaintLattice::Unknown {
            return false;
        }
        self.map.entry(pp).or_default().weak_update(obj, value)
    }

    /// Join a whole store into the memo entry of `pp`.
    pub fn update(&mut self, pp: TaintProgramPoint, store: &TaintStore) -> bool {
        let entry = self.map.entry(pp).or_default();
        let mut changed = false;
        for (obj, value) in store.iter() {
            changed |= entry.weak_update(obj, value);
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::def_use::DuId;
    use crate::analysis::ProgramPoint;

    #[test]
    fn env_join_goes_up_only() {
        let mut env = TaintEnv::new();
        let tv = (CtxId::GLOBAL, ValueId(0));
        assert!(env.weak_update(tv, TaintLattice::Untainted));
        assert!(!env.weak_update(tv, TaintLattice::Untainted));
        assert!(env.weak_update(tv, TaintLattice::Tainted));
        assert_eq!(env.lookup(tv), TaintLattice::Either);
        assert!(!env.weak_update(tv, TaintLattice::Unknown));
    }

    #[test]
    fn memo_change_detection() {
        let mut memo = TaintMemo::new();
        let pp = ProgramPoint::new(CtxId::GLOBAL, DuId(0));
        let obj = MemObjId(3);
        assert!(!memo.insert(pp, obj, TaintLattice::Unknown));
        assert!(memo.insert(pp, obj, TaintLattice::Tainted));
        assert!(!memo.insert(pp, obj, TaintLattice::Tainted));
        assert!(memo.insert(pp, obj, TaintLattice::Untainted));
        assert_eq!(memo.lookup(pp).unwrap().lookup(obj), TaintLattice::Either);
    }
}

//! Pointer interning.
//!
//! A [`Pointer`] is an SSA value observed in a calling context. Pointers are
//! interned: each (context, value) pair has exactly one [`PointerId`],
//! created lazily on first use. A policy flag decides whether global-valued
//! pointers keep their observation context or are collapsed to the global
//! context (they denote the same storage in every context, so collapsing
//! them trades a little precision bookkeeping for a much smaller
//! environment).

use crate::context::CtxId;
use crate::intermediate_representation::{Module, ValueId};
use fnv::FnvHashMap;

/// An interned (context, value) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointerId(pub u32);

/// The pair a [`PointerId`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub ctx: CtxId,
    pub value: ValueId,
}

/// Interns pointers and indexes them by value.
pub struct PointerManager {
    pointers: Vec<Pointer>,
    intern: FnvHashMap<Pointer, PointerId>,
    by_value: FnvHashMap<ValueId, Vec<PointerId>>,
    collapse_globals: bool,
}

impl PointerManager {
    pub fn new(collapse_globals: bool) -> Self {
        PointerManager {
            pointers: Vec::new(),
            intern: FnvHashMap::default(),
            by_value: FnvHashMap::default(),
            collapse_globals,
        }
    }

    /// The context a value is actually tracked under: global values may be
    /// collapsed to the global context.
    fn effective_ctx(&self, ctx: CtxId, value: ValueId, module: &Module) -> CtxId {
        if self.collapse_globals && module.is_global_value(value) {
            CtxId::GLOBAL
        } else {
            ctx
        }
    }

    /// Intern the pointer for a value at a context, creating it on first use.
    pub fn get_or_create(&mut self, ctx: CtxId, value: ValueId, module: &Module) -> PointerId {
        let ptr = Pointer {
            ctx: self.effective_ctx(ctx, value, module),
            value,
        };
        if let Some(existing) = self.intern.get(&ptr) {
            return *existing;
        }
        let id = PointerId(self.pointers.len() as u32);
        self.pointers.push(ptr);
        self.intern.insert(ptr, id);
        self.by_value.entry(value).or_default().push(id);
        id
    }

    /// Look up a pointer without creating it.
    pub fn get(&self, ctx: CtxId, value: ValueId, module: &Module) -> Option<PointerId> {
        let ptr = Pointer {
            ctx: self.effective_ctx(ctx, value, module),
            value,
        };
        self.intern.get(&ptr).copied()
    }

    pub fn pointer(&self, id: PointerId) -> Pointer {
        self.pointers[id.0 as usize]
    }

    /// All contexts in which a value has been observed, as pointer ids in
    /// creation order.
    pub fn pointers_with_value(&self, value: ValueId) -> &[PointerId] {
        self.by_value
            .get(&value)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Iterate over all interned pointers.
    pub fn iter(&self) -> impl Iterator<Item = (PointerId, Pointer)> + '_ {
        self.pointers
            .iter()
            .enumerate()
            .map(|(i, p)| (PointerId(i as u32), *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate_representation::builder::ModuleBuilder;

    #[test]
    fn interning_and_by_value_index() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let f = b.begin_function("f", &[i32_ty], i32_ty);
        let arg = b.param(f, 0);
        b.ret(Some(arg));
        b.end_function(f);
        let module = b.finish();

        let mut mgr = PointerManager::new(true);
        let mut ctx_mgr = crate::context::ContextManager::new();
        let ctx = ctx_mgr.push(
            CtxId::GLOBAL,
            crate::intermediate_representation::InstRef {
                func: f,
                block: crate::intermediate_representation::BlockId(0),
                index: 0,
            },
        );
        let p1 = mgr.get_or_create(CtxId::GLOBAL, arg, &module);
        let p2 = mgr.get_or_create(ctx, arg, &module);
        let p3 = mgr.get_or_create(ctx, arg, &module);
        assert_ne!(p1, p2);
        assert_eq!(p2, p3);
        assert_eq!(mgr.pointers_with_value(arg), &[p1, p2]);
        assert_eq!(mgr.get(ctx, arg, &module), Some(p2));
    }

    #[test]
    fn global_values_collapse_to_global_context() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let g = b.add_global("g", i32_ty);
        let f = b.begin_function("f", &[], i32_ty);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(f);
        let module = b.finish();
        let gval = module.global(g).value;

        let mut ctx_mgr = crate::context::ContextManager::new();
        let ctx = ctx_mgr.push(
            CtxId::GLOBAL,
            crate::intermediate_representation::InstRef {
                func: f,
                block: crate::intermediate_representation::BlockId(0),
                index: 0,
            },
        );

        let mut collapsing = PointerManager::new(true);
        let a = collapsing.get_or_create(CtxId::GLOBAL, gval, &module);
        let b2 = collapsing.get_or_create(ctx, gval, &module);
        assert_eq!(a, b2);

        let mut preserving = PointerManager::new(false);
        let a = preserving.get_or_create(CtxId::GLOBAL, gval, &module);
        let b2 = preserving.get_or_create(ctx, gval, &module);
        assert_ne!(a, b2);
    }
}

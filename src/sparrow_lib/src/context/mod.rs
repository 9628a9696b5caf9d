//! Interned calling contexts.
//!
//! A context is an ordered sequence of call-site identities abstracting the
//! call stack. Contexts are interned by the [`ContextManager`]: two contexts
//! are equal iff their [`CtxId`]s are equal. The empty context is the global
//! context and always has id [`CtxId::GLOBAL`]. Contexts are never mutated or
//! destroyed for the lifetime of the analysis.
//!
//! How contexts grow is decided by a pluggable [policy](policies); the
//! manager itself only provides the raw, unbounded push operation.

use crate::intermediate_representation::InstRef;
use fnv::FnvHashMap;
use std::fmt;

pub mod policies;

/// An interned context. Id 0 is the global (empty) context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtxId(pub u32);

impl CtxId {
    /// The empty context.
    pub const GLOBAL: CtxId = CtxId(0);

    pub fn is_global(self) -> bool {
        self == CtxId::GLOBAL
    }
}

#[derive(Debug, Clone, Copy)]
struct CtxFrame {
    parent: CtxId,
    site: InstRef,
    depth: u32,
}

/// The interning table for contexts.
///
/// Entry 0 is reserved for the global context; all other entries are created
/// on demand by [`ContextManager::push`]. Pushing the same call site onto the
/// same parent always returns the same id, which makes context creation
/// reproducible across runs.
pub struct ContextManager {
    frames: Vec<Option<CtxFrame>>,
    intern: FnvHashMap<(CtxId, InstRef), CtxId>,
}

impl Default for ContextManager {
    fn default() -> Self {
        ContextManager::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager {
            frames: vec![None],
            intern: FnvHashMap::default(),
        }
    }

    /// The number of call sites on the context's stack.
    pub fn depth(&self, ctx: CtxId) -> u32 {
        match self.frames[ctx.0 as usize] {
            None => 0,
            Some(frame) => frame.depth,
        }
    }

    /// Push a call site onto a context, unconditionally. Policies decide
    /// whether to call this; they never bypass the interning table.
    pub fn push(&mut self, parent: CtxId, site: InstRef) -> CtxId {
        if let Some(existing) = self.intern.get(&(parent, site)) {
            return *existing;
        }
        let depth = self.depth(parent) + 1;
        let id = CtxId(self.frames.len() as u32);
        self.frames.push(Some(CtxFrame {
            parent,
            site,
            depth,
        }));
        self.intern.insert((parent, site), id);
        id
    }

    /// The call-site stack of a context, innermost call site last.
    pub fn call_string(&self, ctx: CtxId) -> Vec<InstRef> {
        let mut sites = Vec::new();
        let mut cur = ctx;
        while let Some(frame) = self.frames[cur.0 as usize] {
            sites.push(frame.site);
            cur = frame.parent;
        }
        sites.reverse();
        sites
    }

    /// Total number of interned contexts, including the global one.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the global context always exists
    }

    /// Iterate over all interned context ids.
    pub fn iter(&self) -> impl Iterator<Item = CtxId> {
        (0..self.frames.len() as u32).map(CtxId)
    }

    /// Render a context as `[site1, site2, ...]` for diagnostics.
    pub fn display(&self, ctx: CtxId) -> ContextDisplay<'_> {
        ContextDisplay { mgr: self, ctx }
    }

    /// The distribution of context depths, as (depth, count) pairs sorted by
    /// depth. Useful for judging how much a policy actually refines.
    pub fn depth_distribution(&self) -> Vec<(u32, usize)> {
        let mut counts: std::collections::BTreeMap<u32, usize> = std::collections::BTreeMap::new();
        for ctx in self.iter() {
            *counts.entry(self.depth(ctx)).or_insert(0) += 1;
        }
        counts.into_iter().collect()
    }
}

/// Display adapter returned by [`ContextManager::display`].
pub struct ContextDisplay<'a> {
    mgr: &'a ContextManager,
    ctx: CtxId,
}

impl fmt::Display for ContextDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ctx.is_global() {
            return write!(f, "[global]");
        }
        write!(f, "[")?;
        for (i, site) in self.mgr.call_string(self.ctx).iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{site}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate_representation::{BlockId, FuncId};

    fn site(func: u32, index: u32) -> InstRef {
        InstRef {
            func: FuncId(func),
            block: BlockId(0),
            index,
        }
    }

    #[test]
    fn global_context_is_unique() {
        let mgr = ContextManager::new();
        assert_eq!(mgr.depth(CtxId::GLOBAL), 0);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn push_is_interned() {
        let mut mgr = ContextManager::new();
        let a = mgr.push(CtxId::GLOBAL, site(0, 1));
        let b = mgr.push(CtxId::GLOBAL, site(0, 1));
        let c = mgr.push(CtxId::GLOBAL, site(0, 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(mgr.depth(a), 1);
        let d = mgr.push(a, site(1, 0));
        assert_eq!(mgr.depth(d), 2);
        assert_eq!(mgr.call_string(d), vec![site(0, 1), site(1, 0)]);
    }
}

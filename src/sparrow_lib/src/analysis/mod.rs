//! The analysis engines and their supporting data structures.
//!
//! The pointer analysis (see [`pointer`]) runs first and produces the
//! points-to solution everything else consumes: the [`mod_ref`] and
//! [`reaching_def`] analyses use it to build the [`def_use`] module, and the
//! [`taint`] analysis runs over that module.

use crate::context::CtxId;
use crate::intermediate_representation::FuncId;
use fnv::{FnvHashMap, FnvHashSet};
use std::hash::Hash;

pub mod def_use;
pub mod memory;
pub mod mod_ref;
pub mod pointer;
pub mod reaching_def;
pub mod taint;
pub mod worklist;

#[cfg(test)]
mod tests;

/// A program point: a calling context paired with a node. The node type
/// differs between the pointer engine (semi-sparse nodes) and the taint
/// engine (def-use nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramPoint<N> {
    pub ctx: CtxId,
    pub node: N,
}

impl<N> ProgramPoint<N> {
    pub fn new(ctx: CtxId, node: N) -> Self {
        ProgramPoint { ctx, node }
    }
}

/// A function instantiated in a calling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionContext {
    pub ctx: CtxId,
    pub func: FuncId,
}

/// The dynamic, context-sensitive call graph.
///
/// Maps a function context to the call-site program points that have been
/// observed calling it. The graph only grows during a fixpoint; inserting a
/// previously unknown edge counts as a change and re-enqueues the callee.
#[derive(Debug, Clone)]
pub struct CallGraph<P> {
    callers: FnvHashMap<FunctionContext, Vec<P>>,
    edges: FnvHashSet<(P, FunctionContext)>,
}

impl<P: Copy + Eq + Hash> Default for CallGraph<P> {
    fn default() -> Self {
        CallGraph {
            callers: FnvHashMap::default(),
            edges: FnvHashSet::default(),
        }
    }
}

impl<P: Copy + Eq + Hash> CallGraph<P> {
    pub fn new() -> Self {
        CallGraph::default()
    }

    /// Record a call edge. Returns true if the edge is new.
    pub fn insert_edge(&mut self, caller: P, callee: FunctionContext) -> bool {
        if !self.edges.insert((caller, callee)) {
            return false;
        }
        self.callers.entry(callee).or_default().push(caller);
        true
    }

    /// The call sites that call the given function context, in insertion
    /// order.
    pub fn callers(&self, callee: FunctionContext) -> &[P] {
        self.callers
            .get(&callee)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate over all function contexts that have at least one caller.
    pub fn function_contexts(&self) -> impl Iterator<Item = FunctionContext> + '_ {
        self.callers.keys().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod call_graph_tests {
    use super::*;

    #[test]
    fn edges_are_deduplicated() {
        let mut cg: CallGraph<u32> = CallGraph::new();
        let fc = FunctionContext {
            ctx: CtxId::GLOBAL,
            func: FuncId(1),
        };
        assert!(cg.insert_edge(7, fc));
        assert!(!cg.insert_edge(7, fc));
        assert!(cg.insert_edge(8, fc));
        assert_eq!(cg.callers(fc), &[7, 8]);
        assert_eq!(cg.edge_count(), 2);
    }
}

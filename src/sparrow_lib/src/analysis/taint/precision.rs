//! Backward tracking of precision loss.
//!
//! A sink violation whose actual taint is `Either` may be a real flow or an
//! artifact of merged calling contexts. Starting from such violations, the
//! tracker walks the def-use graph backwards, following `Either` values
//! through operands, loads and calls. Wherever values that are individually
//! precise (`Tainted` or `Untainted`) merge into `Either` — at a call entry
//! whose callers disagree, at a phi over disagreeing paths, at a memory
//! read over disagreeing writers — the merge point's contributors are
//! reported as "demanding precision": raising the context limit at exactly
//! those call sites is what the introspective refinement loop does next.

use super::super::def_use::{DefUseModule, DuKind, TaintProgramPoint};
use super::super::pointer::PointerAnalysisData;
use super::super::{CallGraph, FunctionContext};
use super::lattice::TaintLattice;
use super::sink::SinkViolation;
use super::state::{TaintEnv, TaintMemo};
use crate::analysis::memory::MemObjId;
use crate::annotation::TClass;
use crate::intermediate_representation::{InstKind, Module, ValueId, ValueKind};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;

/// What the tracker is following at a program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Tracked {
    Value(ValueId),
    Object(MemObjId),
}

/// The backward tracker.
pub struct PrecisionLossTracker<'a> {
    module: &'a Module,
    du: &'a DefUseModule,
    pa: &'a PointerAnalysisData,
    env: &'a TaintEnv,
    memo: &'a TaintMemo,
    call_graph: &'a CallGraph<TaintProgramPoint>,
    /// Callee contexts per call site, derived from the call graph.
    callees_of: FnvHashMap<TaintProgramPoint, Vec<FunctionContext>>,
    worklist: VecDeque<(TaintProgramPoint, Tracked)>,
    visited: FnvHashSet<(TaintProgramPoint, Tracked)>,
    demanders: Vec<TaintProgramPoint>,
}

impl<'a> PrecisionLossTracker<'a> {
    pub fn new(
        module: &'a Module,
        du: &'a DefUseModule,
        pa: &'a PointerAnalysisData,
        env: &'a TaintEnv,
        memo: &'a TaintMemo,
        call_graph: &'a CallGraph<TaintProgramPoint>,
    ) -> Self {
        let mut callees_of: FnvHashMap<TaintProgramPoint, Vec<FunctionContext>> =
            FnvHashMap::default();
        for fc in call_graph.function_contexts() {
            for caller in call_graph.callers(fc) {
                callees_of.entry(*caller).or_default().push(fc);
            }
        }
        for callees in callees_of.values_mut() {
            callees.sort_unstable();
        }
        PrecisionLossTracker {
            module,
            du,
            pa,
            env,
            memo,
            call_graph,
            callees_of,
            worklist: VecDeque::new(),
            visited: FnvHashSet::default(),
            demanders: Vec::new(),
        }
    }

    /// Track the imprecision behind the given violations. Returns the
    /// program points that demand more context precision, in discovery
    /// order.
    pub fn track_imprecision(mut self, violations: &[SinkViolation]) -> Vec<TaintProgramPoint> {
        for violation in violations {
            if violation.actual != TaintLattice::Either {
                continue;
            }
            let Some(site) = self.du.node(violation.pp.node).inst() else {
                continue;
            };
            let InstKind::Call { args, .. } = &self.module.inst(site).kind else {
                continue;
            };
            let Some(arg) = args.get(violation.arg_pos as usize).copied() else {
                continue;
            };
            match violation.class {
                TClass::ValueOnly => self.enqueue(violation.pp, Tracked::Value(arg)),
                TClass::DirectMemory | TClass::ReachableMemory => {
                    let set = self.pa.pts_of_value(violation.pp.ctx, arg, self.module);
                    for obj in self.pa.pts.elements(set) {
                        self.enqueue(violation.pp, Tracked::Object(*obj));
                    }
                }
            }
        }

        while let Some((pp, tracked)) = self.worklist.pop_front() {
            match tracked {
                Tracked::Value(value) => self.track_value(pp, value),
                Tracked::Object(obj) => self.track_object(pp, obj),
            }
        }
        self.demanders
    }

    fn enqueue(&mut self, pp: TaintProgramPoint, tracked: Tracked) {
        if self.visited.insert((pp, tracked)) {
            self.worklist.push_back((pp, tracked));
        }
    }

    fn demand(&mut self, pp: TaintProgramPoint) {
        if !self.demanders.contains(&pp) {
            self.demanders.push(pp);
        }
    }

    fn taint_of(&self, ctx: crate::context::CtxId, value: ValueId) -> TaintLattice {
        if self.module.is_constant_value(value) {
            TaintLattice::Untainted
        } else {
            self.env.lookup((ctx, value))
        }
    }

    /// Did individually precise inputs merge into `Either` here?
    fn is_merge_of_precise(values: &[TaintLattice]) -> bool {
        let has_tainted = values.contains(&TaintLattice::Tainted);
        let has_untainted = values.contains(&TaintLattice::Untainted);
        let has_either = values.contains(&TaintLattice::Either);
        has_tainted && has_untainted && !has_either
    }

    /// Follow an `Either` value backwards through its definition.
    fn track_value(&mut self, pp: TaintProgramPoint, value: ValueId) {
        let node = self.du.node(pp.node);
        match node.kind {
            DuKind::Entry { func } => {
                // The value is a parameter: compare what the callers pass.
                let Some(index) = self
                    .module
                    .func(func)
                    .params
                    .iter()
                    .position(|p| *p == value)
                else {
                    return;
                };
                let fc = FunctionContext { ctx: pp.ctx, func };
                let callers: Vec<TaintProgramPoint> = self.call_graph.callers(fc).to_vec();
                let mut caller_taints = Vec::with_capacity(callers.len());
                for caller in &callers {
                    let Some(site) = self.du.node(caller.node).inst() else {
                        continue;
                    };
                    let InstKind::Call { args, .. } = &self.module.inst(site).kind else {
                        continue;
                    };
                    let Some(actual) = args.get(index).copied() else {
                        continue;
                    };
                    let taint = self.taint_of(caller.ctx, actual);
                    caller_taints.push((*caller, actual, taint));
                }
                let taints: Vec<TaintLattice> =
                    caller_taints.iter().map(|(_, _, t)| *t).collect();
                if Self::is_merge_of_precise(&taints) {
                    // Joining differently-precise arguments introduced the
                    // imprecision: these call sites need deeper contexts.
                    for (caller, _, _) in &caller_taints {
                        self.demand(*caller);
                    }
                    return;
                }
                for (caller, actual, taint) in caller_taints {
                    if taint == TaintLattice::Either {
                        self.enqueue(caller, Tracked::Value(actual));
                    }
                }
            }
            DuKind::Inst(site) => {
                let inst = self.module.inst(site);
                if inst.result != Some(value) {
                    // The tracked value is defined elsewhere; walk to its
                    // definition among the top-level predecessors.
                    self.track_to_definition(pp, value);
                    return;
                }
                match &inst.kind {
                    InstKind::Compute { .. }
                    | InstKind::Phi { .. }
                    | InstKind::Select { .. }
                    | InstKind::Gep { .. } => {
                        let operands = inst.kind.operands();
                        let taints: Vec<TaintLattice> = operands
                            .iter()
                            .map(|op| self.taint_of(pp.ctx, *op))
                            .collect();
                        if Self::is_merge_of_precise(&taints) {
                            // A value-level join introduced the imprecision.
                            self.demand(pp);
                            return;
                        }
                        for (op, taint) in operands.iter().zip(taints) {
                            if taint == TaintLattice::Either {
                                self.track_to_definition(pp, *op);
                            }
                        }
                    }
                    InstKind::Load { address } => {
                        let set = self.pa.pts_of_value(pp.ctx, *address, self.module);
                        let store = self.memo.lookup(pp);
                        let objs: Vec<MemObjId> = self.pa.pts.elements(set).to_vec();
                        let taints: Vec<TaintLattice> = objs
                            .iter()
                            .map(|obj| {
                                store
                                    .map(|s| s.lookup(*obj))
                                    .unwrap_or(TaintLattice::Unknown)
                            })
                            .collect();
                        if Self::is_merge_of_precise(&taints) {
                            self.demand(pp);
                            return;
                        }
                        for (obj, taint) in objs.iter().zip(taints) {
                            if taint == TaintLattice::Either {
                                self.track_object_at_preds(pp, *obj);
                            }
                        }
                    }
                    InstKind::Call { .. } => {
                        // The call result merges the callee returns.
                        let callees: Vec<FunctionContext> = self
                            .callees_of
                            .get(&pp)
                            .cloned()
                            .unwrap_or_default();
                        let mut returns = Vec::new();
                        for fc in callees {
                            let Some(du_func) = self.du.function(fc.func) else {
                                continue;
                            };
                            let Some(exit) = du_func.exit else {
                                continue;
                            };
                            let Some(ret_site) = self.du.node(exit).inst() else {
                                continue;
                            };
                            let InstKind::Return { value: Some(ret_val) } =
                                &self.module.inst(ret_site).kind
                            else {
                                continue;
                            };
                            let ret_val = *ret_val;
                            let taint = self.taint_of(fc.ctx, ret_val);
                            returns.push((TaintProgramPoint::new(fc.ctx, exit), ret_val, taint));
                        }
                        let taints: Vec<TaintLattice> =
                            returns.iter().map(|(_, _, t)| *t).collect();
                        if Self::is_merge_of_precise(&taints) {
                            self.demand(pp);
                            return;
                        }
                        for (ret_pp, ret_val, taint) in returns {
                            if taint == TaintLattice::Either {
                                self.enqueue(ret_pp, Tracked::Value(ret_val));
                            }
                        }
                    }
                    _ => (),
                }
            }
        }
    }

    /// Walk a tracked value to its defining node among the top-level
    /// predecessors of `pp`.
    fn track_to_definition(&mut self, pp: TaintProgramPoint, value: ValueId) {
        if self.module.is_constant_value(value) {
            return;
        }
        let node = self.du.node(pp.node);
        for pred in node.top_preds.clone() {
            let pred_node = self.du.node(pred);
            let defines = match pred_node.kind {
                DuKind::Entry { func } => self.module.func(func).params.contains(&value),
                DuKind::Inst(site) => self.module.inst(site).result == Some(value),
            };
            if defines {
                self.enqueue(TaintProgramPoint::new(pp.ctx, pred), Tracked::Value(value));
            }
        }
        // A parameter used directly: its definition is the entry even if it
        // is not a direct top-level predecessor of this node.
        if let ValueKind::Argument { func, .. } = self.module.value(value).kind {
            if let Some(du_func) = self.du.function(func) {
                self.enqueue(
                    TaintProgramPoint::new(pp.ctx, du_func.entry),
                    Tracked::Value(value),
                );
            }
        }
    }

    /// Enqueue the writers of `obj` that reach `pp`.
    fn track_object_at_preds(&mut self, pp: TaintProgramPoint, obj: MemObjId) {
        let node = self.du.node(pp.node);
        if let Some(preds) = node.mem_preds.get(&obj) {
            for pred in preds.clone() {
                self.enqueue(TaintProgramPoint::new(pp.ctx, pred), Tracked::Object(obj));
            }
        }
    }

    /// Follow an `Either` memory binding backwards through its writer.
    fn track_object(&mut self, pp: TaintProgramPoint, obj: MemObjId) {
        let node = self.du.node(pp.node);
        match node.kind {
            DuKind::Entry { func } => {
                // The binding came from the callers' memory states.
                let fc = FunctionContext { ctx: pp.ctx, func };
                let callers: Vec<TaintProgramPoint> = self.call_graph.callers(fc).to_vec();
                let mut caller_taints = Vec::with_capacity(callers.len());
                for caller in &callers {
                    let taint = self
                        .memo
                        .lookup(*caller)
                        .map(|s| s.lookup(obj))
                        .unwrap_or(TaintLattice::Unknown);
                    caller_taints.push((*caller, taint));
                }
                let taints: Vec<TaintLattice> = caller_taints.iter().map(|(_, t)| *t).collect();
                if Self::is_merge_of_precise(&taints) {
                    for (caller, _) in &caller_taints {
                        self.demand(*caller);
                    }
                    return;
                }
                for (caller, taint) in caller_taints {
                    if taint == TaintLattice::Either {
                        self.enqueue(caller, Tracked::Object(obj));
                    }
                }
            }
            DuKind::Inst(site) => {
                match &self.module.inst(site).kind {
                    InstKind::Store { value, .. } => {
                        let taint = self.taint_of(pp.ctx, *value);
                        if taint == TaintLattice::Either {
                            self.track_to_definition(pp, *value);
                        } else {
                            // The stored value is precise; the imprecision
                            // came from other writers merged at the reader.
                            self.track_object_at_preds(pp, obj);
                        }
                    }
                    InstKind::Call { .. } => {
                        // The binding was produced inside a callee; follow
                        // it through the callee's return.
                        let callees: Vec<FunctionContext> = self
                            .callees_of
                            .get(&pp)
                            .cloned()
                            .unwrap_or_default();
                        for fc in callees {
                            if let Some(exit) = self.du.function(fc.func).and_then(|f| f.exit) {
                                self.enqueue(
                                    TaintProgramPoint::new(fc.ctx, exit),
                                    Tracked::Object(obj),
                                );
                            }
                        }
                        self.track_object_at_preds(pp, obj);
                    }
                    InstKind::Return { .. } | InstKind::Load { .. } => {
                        self.track_object_at_preds(pp, obj);
                    }
                    _ => (),
                }
            }
        }
    }
}

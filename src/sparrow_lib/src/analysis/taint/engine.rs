//! The taint fixpoint engine.
//!
//! Runs over the def-use module with the same priority-work-list discipline
//! as the pointer engine. Top-level taint moves along SSA def-use edges;
//! memory taint moves directly from each writer of an object to its readers
//! along the per-object memory edges, with the memo pruning propagation when
//! a binding did not actually change.

use super::super::def_use::{DefUseModule, DuKind, TaintProgramPoint};
use super::super::pointer::PointerAnalysisData;
use super::super::worklist::PriorityWorkList;
use super::super::{CallGraph, FunctionContext};
use super::lattice::TaintLattice;
use super::sink::SinkSignature;
use super::state::{TaintEnv, TaintMemo, TaintStore};
use crate::analysis::memory::MemObjId;
use crate::annotation::ExternalTaintTable;
use crate::context::CtxId;
use crate::intermediate_representation::{FuncId, InstKind, InstRef, Module, ValueId};
use crate::prelude::*;
use crate::utils::log::LogMessage;
use crate::AnalysisConfig;
use fnv::FnvHashSet;

/// The outcome of one taint transfer evaluation.
#[derive(Default)]
pub(super) struct EvalResult {
    pub store: Option<TaintStore>,
    pub top_succs: Vec<TaintProgramPoint>,
    /// Memory successors, keyed by the object whose binding should flow.
    pub mem_succs: Vec<(TaintProgramPoint, MemObjId)>,
}

/// The engine state of one taint analysis run.
pub struct TaintEngine<'a> {
    pub(super) module: &'a Module,
    pub(super) du: &'a DefUseModule,
    pub(super) pa: &'a mut PointerAnalysisData,
    pub(super) table: &'a ExternalTaintTable,
    pub(super) config: &'a AnalysisConfig,
    pub(super) env: TaintEnv,
    pub(super) memo: TaintMemo,
    pub(super) call_graph: CallGraph<TaintProgramPoint>,
    pub(super) sinks: Vec<SinkSignature>,
    pub(super) sink_set: FnvHashSet<(TaintProgramPoint, FuncId)>,
    pub(super) logs: Vec<LogMessage>,
    pub(super) warned_externals: FnvHashSet<FuncId>,
}

impl<'a> TaintEngine<'a> {
    pub fn new(
        module: &'a Module,
        du: &'a DefUseModule,
        pa: &'a mut PointerAnalysisData,
        table: &'a ExternalTaintTable,
        config: &'a AnalysisConfig,
    ) -> Self {
        TaintEngine {
            module,
            du,
            pa,
            table,
            config,
            env: TaintEnv::new(),
            memo: TaintMemo::new(),
            call_graph: CallGraph::new(),
            sinks: Vec::new(),
            sink_set: FnvHashSet::default(),
            logs: Vec::new(),
            warned_externals: FnvHashSet::default(),
        }
    }

    /// Run the taint fixpoint until the work list empties.
    pub fn run(&mut self) -> Result<()> {
        let entry_func = self.du.entry_function();
        let entry_node = self
            .du
            .function(entry_func)
            .ok_or_else(|| anyhow!("entry function has no def-use graph"))?
            .entry;
        let entry_pp = TaintProgramPoint::new(CtxId::GLOBAL, entry_node);

        let init_store = self.initial_store(entry_func);
        self.memo.update(entry_pp, &init_store);

        let mut worklist = PriorityWorkList::new();
        worklist.enqueue(entry_pp, usize::MAX);

        let mut steps = 0u64;
        while let Some(pp) = worklist.dequeue() {
            steps += 1;
            if let Some(budget) = self.config.iteration_budget {
                if steps > budget {
                    bail!("taint analysis exceeded its iteration budget of {budget} steps");
                }
            }

            let result = self.eval(pp);
            for succ in &result.top_succs {
                worklist.enqueue(*succ, self.priority(*succ));
            }
            if let Some(store) = &result.store {
                for (succ, obj) in &result.mem_succs {
                    if self.memo.insert(*succ, *obj, store.lookup(*obj)) {
                        worklist.enqueue(*succ, self.priority(*succ));
                    }
                }
            }
        }

        self.logs.push(
            LogMessage::new_debug(format!(
                "taint fixpoint reached after {steps} steps: {} env entries, {} sink sites",
                self.env.len(),
                self.sinks.len()
            ))
            .source("taint"),
        );
        Ok(())
    }

    /// The initial taint state: argc is attacker-controlled, the argv/envp
    /// pointers themselves are clean but the memory they reach is tainted,
    /// globals start untainted and unknown memory is both.
    fn initial_store(&mut self, entry_func: FuncId) -> TaintStore {
        let mut store = TaintStore::new();
        let params = self.module.func(entry_func).params.clone();
        if let Some(argc) = params.first() {
            self.env
                .strong_update((CtxId::GLOBAL, *argc), TaintLattice::Tainted);
        }
        if let Some(argv) = params.get(1) {
            self.env
                .strong_update((CtxId::GLOBAL, *argv), TaintLattice::Untainted);
            store.strong_update(self.pa.mem_mgr.argv_object(), TaintLattice::Tainted);
        }
        if let Some(envp) = params.get(2) {
            self.env
                .strong_update((CtxId::GLOBAL, *envp), TaintLattice::Untainted);
            store.strong_update(self.pa.mem_mgr.envp_object(), TaintLattice::Tainted);
        }

        for global in &self.module.globals {
            let set = self
                .pa
                .pts_of_value(CtxId::GLOBAL, global.value, self.module);
            for obj in self.pa.pts.elements(set).to_vec() {
                if !self.pa.mem_mgr.is_special(obj) {
                    store.strong_update(obj, TaintLattice::Untainted);
                }
            }
        }
        store.strong_update(self.pa.mem_mgr.null_object(), TaintLattice::Untainted);
        store.strong_update(self.pa.mem_mgr.universal_object(), TaintLattice::Either);
        store
    }

    pub(super) fn priority(&self, pp: TaintProgramPoint) -> usize {
        self.du.node(pp.node).priority
    }

    /// The taint of a value at a context. Constants never carry taint of
    /// their own.
    pub(super) fn taint_of_value(&self, ctx: CtxId, value: ValueId) -> TaintLattice {
        if self.module.is_constant_value(value) {
            TaintLattice::Untainted
        } else {
            self.env.lookup((ctx, value))
        }
    }

    pub(super) fn add_top_succs(&self, pp: TaintProgramPoint, result: &mut EvalResult) {
        for succ in &self.du.node(pp.node).top_succs {
            result.top_succs.push(TaintProgramPoint::new(pp.ctx, *succ));
        }
    }

    /// Add the memory successors of `pp` through one object.
    pub(super) fn add_mem_succs_of(
        &self,
        pp: TaintProgramPoint,
        obj: MemObjId,
        result: &mut EvalResult,
    ) {
        for succ in self.du.node(pp.node).mem_succs_of(obj) {
            result
                .mem_succs
                .push((TaintProgramPoint::new(pp.ctx, *succ), obj));
        }
    }

    /// Add all memory successors of `pp`.
    pub(super) fn add_all_mem_succs(&self, pp: TaintProgramPoint, result: &mut EvalResult) {
        let node = self.du.node(pp.node);
        let mut keys: Vec<MemObjId> = node.mem_succs.keys().copied().collect();
        keys.sort_unstable();
        for obj in keys {
            for succ in node.mem_succs_of(obj) {
                result
                    .mem_succs
                    .push((TaintProgramPoint::new(pp.ctx, *succ), obj));
            }
        }
    }

    /// Evaluate one program point.
    fn eval(&mut self, pp: TaintProgramPoint) -> EvalResult {
        let mut result = EvalResult::default();
        let node = self.du.node(pp.node);
        match node.kind {
            DuKind::Entry { .. } => {
                let local = self.memo.lookup(pp).cloned();
                self.add_top_succs(pp, &mut result);
                self.add_all_mem_succs(pp, &mut result);
                result.store = local;
            }
            DuKind::Inst(site) => self.eval_inst(pp, site, &mut result),
        }
        result
    }

    fn eval_inst(&mut self, pp: TaintProgramPoint, site: InstRef, result: &mut EvalResult) {
        let inst_kind = self.module.inst(site).kind.clone();
        let inst_result = self.module.inst(site).result;
        match inst_kind {
            InstKind::Alloca { .. } => {
                let dest = inst_result.unwrap();
                if self.env.strong_update((pp.ctx, dest), TaintLattice::Untainted) {
                    self.add_top_succs(pp, result);
                }
            }
            InstKind::Compute { .. }
            | InstKind::Phi { .. }
            | InstKind::Select { .. }
            | InstKind::Gep { .. } => {
                let Some(dest) = inst_result else {
                    return;
                };
                let value = self.merge_operand_taint(pp.ctx, &inst_kind.operands());
                if value != TaintLattice::Unknown
                    && self.env.strong_update((pp.ctx, dest), value)
                {
                    self.add_top_succs(pp, result);
                }
            }
            InstKind::Load { address } => {
                self.eval_load(pp, inst_result.unwrap(), address, result);
            }
            InstKind::Store { address, value } => {
                self.eval_store(pp, address, value, result);
            }
            InstKind::Call { callee, args } => {
                self.eval_call(pp, site, inst_result, callee, &args, result);
            }
            InstKind::Return { value } => {
                self.eval_return(pp, site, value, result);
            }
            InstKind::Branch { .. } | InstKind::Unreachable => (),
        }
    }

    /// The merged taint of an operand list. Any unknown operand makes the
    /// whole result unknown: the instruction is not ready yet and will be
    /// re-evaluated once its inputs arrive.
    pub(super) fn merge_operand_taint(&self, ctx: CtxId, operands: &[ValueId]) -> TaintLattice {
        let mut merged = TaintLattice::Unknown;
        for op in operands {
            let value = self.taint_of_value(ctx, *op);
            if value == TaintLattice::Unknown {
                return TaintLattice::Unknown;
            }
            merged = merged.merge(value);
        }
        merged
    }

    /// The taint read through a points-to set: the merge of the per-object
    /// bindings, with the universal object contributing `Either`.
    pub(super) fn load_taint_from_pts(
        &self,
        set: crate::analysis::pointer::pts_set::PtsSetId,
        store: &TaintStore,
    ) -> TaintLattice {
        let mut merged = TaintLattice::Unknown;
        for obj in self.pa.pts.elements(set) {
            if *obj == self.pa.mem_mgr.universal_object() {
                return TaintLattice::Either;
            }
            merged = merged.merge(store.lookup(*obj));
        }
        merged
    }

    fn eval_load(
        &mut self,
        pp: TaintProgramPoint,
        dest: ValueId,
        address: ValueId,
        result: &mut EvalResult,
    ) {
        let Some(local) = self.memo.lookup(pp) else {
            return;
        };
        let set = self.pa.pts_of_value(pp.ctx, address, self.module);
        let value = self.load_taint_from_pts(set, local);
        if value != TaintLattice::Unknown && self.env.strong_update((pp.ctx, dest), value) {
            self.add_top_succs(pp, result);
        }
    }

    fn eval_store(
        &mut self,
        pp: TaintProgramPoint,
        address: ValueId,
        value: ValueId,
        result: &mut EvalResult,
    ) {
        let mut store = self.memo.lookup(pp).cloned().unwrap_or_default();
        let taint = self.taint_of_value(pp.ctx, value);
        if taint == TaintLattice::Unknown {
            return;
        }
        let set = self.pa.pts_of_value(pp.ctx, address, self.module);
        if set.is_empty() {
            return;
        }
        let objs: Vec<MemObjId> = self.pa.pts.elements(set).to_vec();
        let single = objs.len() == 1;
        for obj in &objs {
            if self.pa.mem_mgr.is_special(*obj) {
                continue;
            }
            if single && !self.pa.mem_mgr.is_summary(*obj) {
                store.strong_update(*obj, taint);
            } else {
                store.weak_update(*obj, taint);
            }
        }
        for obj in objs {
            self.add_mem_succs_of(pp, obj, result);
        }
        result.store = Some(store);
    }

    fn eval_call(
        &mut self,
        pp: TaintProgramPoint,
        site: InstRef,
        call_result: Option<ValueId>,
        callee: ValueId,
        args: &[ValueId],
        result: &mut EvalResult,
    ) {
        let local = self.memo.lookup(pp).cloned();
        let callees = self.pa.callees_of_call(pp.ctx, callee, self.module);
        for target in callees {
            if self.module.func(target).is_declaration() {
                self.eval_external_call(pp, target, args, call_result, local.clone(), result);
            } else {
                self.eval_internal_call(pp, site, target, args, local.clone(), result);
            }
        }
    }

    fn eval_internal_call(
        &mut self,
        pp: TaintProgramPoint,
        site: InstRef,
        target: FuncId,
        args: &[ValueId],
        local: Option<TaintStore>,
        result: &mut EvalResult,
    ) {
        let new_ctx = self
            .config
            .policy
            .push(&mut self.pa.ctx_mgr, pp.ctx, site);
        let fc = FunctionContext {
            ctx: new_ctx,
            func: target,
        };
        let edge_added = self.call_graph.insert_edge(pp, fc);

        let params = self.module.func(target).params.clone();
        let num_params = params.len().min(args.len());
        let mut arg_taints = Vec::with_capacity(num_params);
        for arg in args.iter().take(num_params) {
            let value = self.taint_of_value(pp.ctx, *arg);
            if value == TaintLattice::Unknown {
                // Not all actuals are ready; the call re-runs later.
                return;
            }
            arg_taints.push(value);
        }

        let mut env_changed = false;
        for (param, value) in params.iter().zip(arg_taints) {
            env_changed |= self.env.weak_update((new_ctx, *param), value);
        }

        let Some(entry) = self.du.function(target).map(|f| f.entry) else {
            return;
        };
        let entry_pp = TaintProgramPoint::new(new_ctx, entry);
        if env_changed || edge_added {
            self.add_top_succs(entry_pp, result);
        }
        self.add_all_mem_succs(entry_pp, result);
        if let Some(store) = local {
            result.store.get_or_insert(store);
        }
    }

    fn eval_return(
        &mut self,
        pp: TaintProgramPoint,
        site: InstRef,
        value: Option<ValueId>,
        result: &mut EvalResult,
    ) {
        let func = site.func;
        if func == self.du.entry_function() && pp.ctx.is_global() {
            return;
        }
        let local = self.memo.lookup(pp).cloned();

        let ret_taint = match value {
            Some(v) => self.taint_of_value(pp.ctx, v),
            None => TaintLattice::Unknown,
        };

        let fc = FunctionContext { ctx: pp.ctx, func };
        let callers: Vec<TaintProgramPoint> = self.call_graph.callers(fc).to_vec();
        for caller in callers {
            let caller_site = self.du.node(caller.node).inst().unwrap();
            if ret_taint != TaintLattice::Unknown {
                if let Some(dest) = self.module.inst(caller_site).result {
                    if self.env.weak_update((caller.ctx, dest), ret_taint) {
                        self.add_top_succs(caller, result);
                    }
                }
            }
            self.add_all_mem_succs(caller, result);
        }
        if let Some(store) = local {
            result.store = Some(store);
        } else {
            result.mem_succs.clear();
        }
    }

    /// Record a call site as a sink to be checked after the fixpoint.
    pub(super) fn record_sink(&mut self, pp: TaintProgramPoint, callee: FuncId) {
        if self.sink_set.insert((pp, callee)) {
            self.sinks.push(SinkSignature { pp, callee });
        }
    }

    /// Warn (once per function) about an unannotated external call.
    pub(super) fn warn_missing_external(&mut self, pp: TaintProgramPoint, callee: FuncId) {
        if !self.warned_externals.insert(callee) {
            return;
        }
        let location = self
            .du
            .node(pp.node)
            .inst()
            .map(|site| self.module.display_site(site))
            .unwrap_or_default();
        self.logs.push(
            LogMessage::new_error(format!(
                "missing annotation for external function {}; treating the call as a no-op",
                self.module.func(callee).name
            ))
            .location(location)
            .source("taint"),
        );
    }
}

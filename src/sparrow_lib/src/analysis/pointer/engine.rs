//! The work-list fixpoint engine of the pointer analysis.
//!
//! One evaluation step takes the highest-priority program point, fetches its
//! current store from the memo, runs the transfer function and propagates:
//! top-level successors are enqueued when the environment actually changed,
//! memory-level successors when joining the produced store into their memo
//! entry changed some binding. All updates are monotone over finite lattices,
//! so the work list eventually empties.
//!
//! Update-before-propagate is the engine's one correctness-critical rule:
//! every transfer method first applies its environment/store updates and only
//! then emits the successors that should observe them.

use super::super::worklist::PriorityWorkList;
use super::super::CallGraph;
use super::super::FunctionContext;
use super::global_analysis;
use super::pointer_manager::PointerManager;
use super::pts_set::{PtsSetId, PtsSetPool};
use super::semi_sparse::{NodeId, OffsetKind, SemiSparseProgram, SsNodeKind, SsProgramPoint};
use super::state::{Env, Memo, Store};
use super::PointerAnalysisData;
use crate::analysis::memory::MemoryManager;
use crate::annotation::ExternalPointerTable;
use crate::context::{ContextManager, CtxId};
use crate::intermediate_representation::{FuncId, InstRef, Module, ValueId, ValueKind};
use crate::prelude::*;
use crate::utils::log::LogMessage;
use crate::AnalysisConfig;
use fnv::FnvHashSet;

/// The outcome of one transfer-function evaluation: an optional new store
/// and the successors to wake.
#[derive(Default)]
pub(super) struct EvalResult {
    pub store: Option<Store>,
    pub top_succs: Vec<SsProgramPoint>,
    pub mem_succs: Vec<SsProgramPoint>,
}

/// The engine state. Owns every interning table for the duration of the run
/// and hands them over to the [`PointerAnalysisData`] at the end.
pub struct PointerEngine<'a> {
    module: &'a Module,
    program: &'a SemiSparseProgram,
    config: &'a AnalysisConfig,
    pub(super) ext_table: &'a ExternalPointerTable,
    pub(super) ctx_mgr: ContextManager,
    pub(super) ptr_mgr: PointerManager,
    pub(super) mem_mgr: MemoryManager,
    pub(super) pts: PtsSetPool,
    pub(super) env: Env,
    memo: Memo,
    call_graph: CallGraph<SsProgramPoint>,
    pub(super) logs: Vec<LogMessage>,
    warned_externals: FnvHashSet<FuncId>,
    pub(super) null_set: PtsSetId,
    pub(super) universal_set: PtsSetId,
}

impl<'a> PointerEngine<'a> {
    pub fn new(
        module: &'a Module,
        program: &'a SemiSparseProgram,
        mem_mgr: MemoryManager,
        config: &'a AnalysisConfig,
        ext_table: &'a ExternalPointerTable,
    ) -> Self {
        let mut pts = PtsSetPool::new();
        let null_set = pts.singleton(mem_mgr.null_object());
        let universal_set = pts.singleton(mem_mgr.universal_object());
        PointerEngine {
            module,
            program,
            config,
            ext_table,
            ctx_mgr: ContextManager::new(),
            ptr_mgr: PointerManager::new(config.collapse_global_contexts),
            mem_mgr,
            pts,
            env: Env::new(),
            memo: Memo::new(),
            call_graph: CallGraph::new(),
            logs: Vec::new(),
            warned_externals: FnvHashSet::default(),
            null_set,
            universal_set,
        }
    }

    /// Run the fixpoint and hand the solution over.
    pub fn run(mut self) -> Result<PointerAnalysisData> {
        let init_store = global_analysis::run(
            self.module,
            &mut self.ptr_mgr,
            &mut self.mem_mgr,
            &mut self.pts,
            &mut self.env,
        );

        let entry_func = self
            .module
            .entry_function()
            .ok_or_else(|| anyhow!("module {} has no entry function `main`", self.module.name))?;
        let entry_node = self
            .program
            .entry(entry_func)
            .ok_or_else(|| anyhow!("entry function `main` is a declaration"))?;
        self.seed_main_params(entry_func);

        let entry_pp = SsProgramPoint::new(CtxId::GLOBAL, entry_node);
        self.memo.update(entry_pp, &init_store, &mut self.pts);

        let mut worklist = PriorityWorkList::new();
        worklist.enqueue(entry_pp, usize::MAX);

        let mut steps = 0u64;
        while let Some(pp) = worklist.dequeue() {
            steps += 1;
            if let Some(budget) = self.config.iteration_budget {
                if steps > budget {
                    bail!(
                        "pointer analysis exceeded its iteration budget of {budget} steps \
                         ({} contexts, {} pointers, {} objects)",
                        self.ctx_mgr.len(),
                        self.ptr_mgr.len(),
                        self.mem_mgr.object_count()
                    );
                }
            }

            let result = self.eval(pp);
            for succ in &result.top_succs {
                worklist.enqueue(*succ, self.priority(*succ));
            }
            if let Some(store) = &result.store {
                for succ in &result.mem_succs {
                    if self.memo.update(*succ, store, &mut self.pts) {
                        worklist.enqueue(*succ, self.priority(*succ));
                    }
                }
            }
        }

        self.logs.push(
            LogMessage::new_debug(format!(
                "fixpoint reached after {steps} steps: {} contexts, {} pointers, {} objects, \
                 {} interned sets, {} call edges",
                self.ctx_mgr.len(),
                self.ptr_mgr.len(),
                self.mem_mgr.object_count(),
                self.pts.pool_size(),
                self.call_graph.edge_count()
            ))
            .source("pointer"),
        );

        Ok(PointerAnalysisData {
            env: self.env,
            memo: self.memo,
            call_graph: self.call_graph,
            ctx_mgr: self.ctx_mgr,
            ptr_mgr: self.ptr_mgr,
            mem_mgr: self.mem_mgr,
            pts: self.pts,
            logs: self.logs,
            null_set: self.null_set,
            universal_set: self.universal_set,
        })
    }

    /// The parameters of `main` are supplied by the environment: argv and
    /// envp point into their sentinel summary regions.
    fn seed_main_params(&mut self, main: FuncId) {
        let params = &self.module.func(main).params;
        if let Some(argv) = params.get(1) {
            let ptr = self.ptr_mgr.get_or_create(CtxId::GLOBAL, *argv, self.module);
            let set = self.pts.singleton(self.mem_mgr.argv_object());
            self.env.weak_update(ptr, set, &mut self.pts);
        }
        if let Some(envp) = params.get(2) {
            let ptr = self.ptr_mgr.get_or_create(CtxId::GLOBAL, *envp, self.module);
            let set = self.pts.singleton(self.mem_mgr.envp_object());
            self.env.weak_update(ptr, set, &mut self.pts);
        }
    }

    fn priority(&self, pp: SsProgramPoint) -> usize {
        self.program.node(pp.node).priority
    }

    /// The points-to set of a value at a context, interning the pointer on
    /// first use. Non-pointer values have the empty set.
    pub(super) fn pts_of_value(&mut self, ctx: CtxId, value: ValueId) -> PtsSetId {
        if !self.module.is_pointer_value(value) {
            return PtsSetId::EMPTY;
        }
        match &self.module.value(value).kind {
            ValueKind::ConstantNull => self.null_set,
            ValueKind::Undef => self.universal_set,
            _ => {
                let ptr = self.ptr_mgr.get_or_create(ctx, value, self.module);
                self.env.lookup(ptr)
            }
        }
    }

    /// Join `set` into the environment entry of (ctx, value). Returns true
    /// if the entry grew.
    pub(super) fn update_env(&mut self, ctx: CtxId, value: ValueId, set: PtsSetId) -> bool {
        let ptr = self.ptr_mgr.get_or_create(ctx, value, self.module);
        self.env.weak_update(ptr, set, &mut self.pts)
    }

    fn add_top_succs(&self, pp: SsProgramPoint, result: &mut EvalResult) {
        for succ in &self.program.node(pp.node).top_succs {
            result.top_succs.push(SsProgramPoint::new(pp.ctx, *succ));
        }
    }

    fn add_mem_succs(&self, pp: SsProgramPoint, result: &mut EvalResult) {
        for succ in &self.program.node(pp.node).mem_succs {
            result.mem_succs.push(SsProgramPoint::new(pp.ctx, *succ));
        }
    }

    /// Evaluate one program point.
    fn eval(&mut self, pp: SsProgramPoint) -> EvalResult {
        let program = self.program;
        let kind = program.node(pp.node).kind.clone();
        let local = self.memo.lookup(pp).cloned();
        let mut result = EvalResult::default();

        match kind {
            SsNodeKind::Entry { .. } => {
                self.add_top_succs(pp, &mut result);
                self.forward_store(pp, local, &mut result);
            }
            SsNodeKind::Alloc { dest, ty } => {
                self.eval_alloc(pp, dest, ty, &mut result);
                self.forward_store(pp, local, &mut result);
            }
            SsNodeKind::Copy { dest, srcs } => {
                self.eval_copy(pp, dest, &srcs, &mut result);
                self.forward_store(pp, local, &mut result);
            }
            SsNodeKind::Offset { dest, base, offset } => {
                self.eval_offset(pp, dest, base, offset, &mut result);
                self.forward_store(pp, local, &mut result);
            }
            SsNodeKind::Load { dest, address } => {
                if let Some(store) = &local {
                    self.eval_load(pp, dest, address, store, &mut result);
                }
                self.forward_store(pp, local, &mut result);
            }
            SsNodeKind::Store { address, value } => {
                self.eval_store(pp, address, value, local, &mut result);
            }
            SsNodeKind::Call { dest, callee, args } => {
                self.eval_call(pp, dest, callee, &args, local, &mut result);
            }
            SsNodeKind::Return { value } => {
                self.eval_return(pp, value, local, &mut result);
            }
        }
        result
    }

    /// Pass the incoming store on to the CFG successors unchanged.
    fn forward_store(&self, pp: SsProgramPoint, local: Option<Store>, result: &mut EvalResult) {
        if let Some(store) = local {
            result.store = Some(store);
            self.add_mem_succs(pp, result);
        }
    }

    fn eval_alloc(&mut self, pp: SsProgramPoint, dest: ValueId, ty: crate::intermediate_representation::TypeId, result: &mut EvalResult) {
        let site = self.program.node(pp.node).inst.unwrap();
        let summary = self.config.policy.alloc_site_limit(site) == 0;
        let layout = self.mem_mgr.type_map().layout_of(ty);
        let obj = self
            .mem_mgr
            .allocate_stack(pp.ctx, site, dest, layout, summary);
        let set = self.pts.singleton(obj);
        if self.update_env(pp.ctx, dest, set) {
            self.add_top_succs(pp, result);
        }
    }

    fn eval_copy(&mut self, pp: SsProgramPoint, dest: ValueId, srcs: &[ValueId], result: &mut EvalResult) {
        let mut sets = Vec::new();
        let mut has_pointer_src = false;
        for src in srcs {
            if !self.module.is_pointer_value(*src) {
                continue;
            }
            has_pointer_src = true;
            let set = self.pts_of_value(pp.ctx, *src);
            if !set.is_empty() {
                sets.push(set);
            }
        }
        // A pointer produced entirely from non-pointer data (e.g. an
        // int-to-pointer cast) can point anywhere.
        let merged = if !has_pointer_src && !srcs.is_empty() {
            self.universal_set
        } else {
            self.pts.merge_all(&sets)
        };
        if self.update_env(pp.ctx, dest, merged) {
            self.add_top_succs(pp, result);
        }
    }

    fn eval_offset(
        &mut self,
        pp: SsProgramPoint,
        dest: ValueId,
        base: ValueId,
        offset: OffsetKind,
        result: &mut EvalResult,
    ) {
        let base_set = self.pts_of_value(pp.ctx, base);
        if base_set.is_empty() {
            return;
        }
        let objs: Vec<_> = self.pts.elements(base_set).to_vec();
        let mut shifted = Vec::with_capacity(objs.len());
        for obj in objs {
            let target = match offset {
                OffsetKind::Byte(delta) => self.mem_mgr.offset_memory(obj, delta),
                OffsetKind::UnknownIndex => self.mem_mgr.offset_memory_unknown_index(obj),
            };
            shifted.push(target);
        }
        let set = self.pts.from_objects(shifted);
        if self.update_env(pp.ctx, dest, set) {
            self.add_top_succs(pp, result);
        }
    }

    fn eval_load(
        &mut self,
        pp: SsProgramPoint,
        dest: ValueId,
        address: ValueId,
        store: &Store,
        result: &mut EvalResult,
    ) {
        if !self.module.is_pointer_value(dest) {
            return;
        }
        let addr_set = self.pts_of_value(pp.ctx, address);
        if addr_set.is_empty() {
            return;
        }
        let objs: Vec<_> = self.pts.elements(addr_set).to_vec();
        let mut sets = Vec::new();
        for obj in objs {
            if obj == self.mem_mgr.universal_object() {
                sets.push(self.universal_set);
            } else if obj == self.mem_mgr.null_object() {
                continue;
            } else {
                let set = store.lookup(obj);
                if !set.is_empty() {
                    sets.push(set);
                }
            }
        }
        let merged = self.pts.merge_all(&sets);
        if self.update_env(pp.ctx, dest, merged) {
            self.add_top_succs(pp, result);
        }
    }

    fn eval_store(
        &mut self,
        pp: SsProgramPoint,
        address: ValueId,
        value: ValueId,
        local: Option<Store>,
        result: &mut EvalResult,
    ) {
        let Some(mut store) = local else {
            return;
        };
        if !self.module.is_pointer_value(value) {
            // Nothing pointer-relevant is written; the store state still
            // flows on.
            result.store = Some(store);
            self.add_mem_succs(pp, result);
            return;
        }
        let src_set = self.pts_of_value(pp.ctx, value);
        let dst_set = self.pts_of_value(pp.ctx, address);
        if src_set.is_empty() || dst_set.is_empty() {
            result.store = Some(store);
            self.add_mem_succs(pp, result);
            return;
        }
        let dst_objs: Vec<_> = self.pts.elements(dst_set).to_vec();
        let single = dst_objs.len() == 1;
        for obj in dst_objs {
            if self.mem_mgr.is_special(obj) {
                continue;
            }
            if single && !self.mem_mgr.is_summary(obj) {
                store.strong_update(obj, src_set);
            } else {
                store.weak_update(obj, src_set, &mut self.pts);
            }
        }
        result.store = Some(store);
        self.add_mem_succs(pp, result);
    }

    fn eval_call(
        &mut self,
        pp: SsProgramPoint,
        dest: Option<ValueId>,
        callee: ValueId,
        args: &[ValueId],
        local: Option<Store>,
        result: &mut EvalResult,
    ) {
        let Some(mut store) = local else {
            // Without a store the call cannot be entered yet; wait for the
            // memory state to arrive.
            return;
        };

        let callees = self.resolve_callees(pp.ctx, callee);
        let mut all_exit = !callees.is_empty();

        for target in &callees {
            if self.module.func(*target).is_declaration() {
                let (_modified, exits) =
                    self.eval_external_call(pp, *target, args, dest, &mut store, result);
                all_exit &= exits;
            } else {
                all_exit = false;
                self.eval_internal_call(pp, *target, args, &store, result);
            }
        }

        // The after-call state of internal callees arrives through their
        // return transfer; externals modify the store in place.
        let has_external = callees
            .iter()
            .any(|f| self.module.func(*f).is_declaration());
        if has_external && !all_exit {
            result.store = Some(store);
            self.add_mem_succs(pp, result);
        }
    }

    /// The callees of a call at a context: the direct target, or the
    /// function objects in the callee pointer's points-to set.
    fn resolve_callees(&mut self, ctx: CtxId, callee: ValueId) -> Vec<FuncId> {
        if let ValueKind::Function(f) = &self.module.value(callee).kind {
            return vec![*f];
        }
        let set = self.pts_of_value(ctx, callee);
        let mut callees = Vec::new();
        for obj in self.pts.elements(set) {
            if let Some(f) = self.mem_mgr.as_function(*obj) {
                if !callees.contains(&f) {
                    callees.push(f);
                }
            }
        }
        callees
    }

    fn eval_internal_call(
        &mut self,
        pp: SsProgramPoint,
        callee: FuncId,
        args: &[ValueId],
        store: &Store,
        result: &mut EvalResult,
    ) {
        let site = self.program.node(pp.node).inst.unwrap();
        let new_ctx = self.config.policy.push(&mut self.ctx_mgr, pp.ctx, site);
        let fc = FunctionContext {
            ctx: new_ctx,
            func: callee,
        };
        let edge_added = self.call_graph.insert_edge(pp, fc);

        let params = self.module.func(callee).params.clone();
        let mut env_changed = false;
        for (param, actual) in params.iter().zip(args.iter()) {
            if !self.module.is_pointer_value(*param) {
                continue;
            }
            let actual_set = self.pts_of_value(pp.ctx, *actual);
            env_changed |= self.update_env(new_ctx, *param, actual_set);
        }

        let Some(entry) = self.program.entry(callee) else {
            return;
        };
        let entry_pp = SsProgramPoint::new(new_ctx, entry);
        if env_changed || edge_added {
            result.top_succs.push(entry_pp);
        }
        // The callee entry always receives the caller's memory state.
        result.store.get_or_insert_with(|| store.clone());
        result.mem_succs.push(entry_pp);
    }

    fn eval_return(
        &mut self,
        pp: SsProgramPoint,
        value: Option<ValueId>,
        local: Option<Store>,
        result: &mut EvalResult,
    ) {
        let program = self.program;
        let func = program.node(pp.node).func;
        if Some(func) == program.entry_function() && pp.ctx.is_global() {
            // Program end.
            return;
        }

        let fc = FunctionContext { ctx: pp.ctx, func };
        let callers: Vec<SsProgramPoint> = self.call_graph.callers(fc).to_vec();
        for caller in callers {
            let caller_node = program.node(caller.node);
            if let SsNodeKind::Call {
                dest: Some(dest), ..
            } = &caller_node.kind
            {
                let dest = *dest;
                if let Some(ret_val) = value {
                    if self.module.is_pointer_value(dest) && self.module.is_pointer_value(ret_val) {
                        let ret_set = self.pts_of_value(pp.ctx, ret_val);
                        if self.update_env(caller.ctx, dest, ret_set) {
                            for succ in &caller_node.top_succs {
                                result.top_succs.push(SsProgramPoint::new(caller.ctx, *succ));
                            }
                        }
                    }
                }
            }
            // The store at the return flows to the caller's CFG successors.
            for succ in &caller_node.mem_succs {
                result.mem_succs.push(SsProgramPoint::new(caller.ctx, *succ));
            }
        }
        if let Some(store) = local {
            result.store = Some(store);
        } else {
            result.mem_succs.clear();
        }
    }

    /// Warn (once per function) about a call to an external function that has
    /// no entry in the pointer annotation table.
    pub(super) fn warn_missing_external(&mut self, pp: SsProgramPoint, callee: FuncId) {
        if !self.warned_externals.insert(callee) {
            return;
        }
        let site = self.program.node(pp.node).inst.unwrap();
        self.logs.push(
            LogMessage::new_error(format!(
                "missing annotation for external function {}; treating the call as a no-op",
                self.module.func(callee).name
            ))
            .location(self.module.display_site(site))
            .source("pointer"),
        );
    }

    pub(super) fn module(&self) -> &'a Module {
        self.module
    }

    pub(super) fn program(&self) -> &'a SemiSparseProgram {
        self.program
    }

    pub(super) fn call_site(&self, node: NodeId) -> InstRef {
        self.program.node(node).inst.unwrap()
    }

    pub(super) fn policy_push(&mut self, ctx: CtxId, site: InstRef) -> CtxId {
        self.config.policy.push(&mut self.ctx_mgr, ctx, site)
    }

    pub(super) fn push_log(&mut self, msg: LogMessage) {
        self.logs.push(msg);
    }
}

//! External-call handling of the taint analysis.
//!
//! Calls to functions without a body are interpreted through the taint
//! table: sources inject lattice values, pipes copy taint between call
//! positions (the reachable-memory pairing performs a memcpy-style deep
//! transfer), sinks are recorded for the post-fixpoint check, and unknown
//! externals are reported once and treated as no-ops.

use super::engine::{EvalResult, TaintEngine};
use super::lattice::TaintLattice;
use super::state::TaintStore;
use crate::analysis::def_use::TaintProgramPoint;
use crate::analysis::memory::MemObjId;
use crate::annotation::taint::TaintEntry;
use crate::annotation::{APosition, TClass};
use crate::intermediate_representation::{FuncId, ValueId};
use crate::utils::log::LogMessage;

impl<'a> TaintEngine<'a> {
    /// Apply all annotated taint effects of an external callee.
    pub(super) fn eval_external_call(
        &mut self,
        pp: TaintProgramPoint,
        callee: FuncId,
        args: &[ValueId],
        call_result: Option<ValueId>,
        local: Option<TaintStore>,
        result: &mut EvalResult,
    ) {
        let name = &self.module.func(callee).name;
        let Some(summary) = self.table.lookup(name).cloned() else {
            self.warn_missing_external(pp, callee);
            return;
        };

        // Prefer the store accumulated by effects of earlier callees of the
        // same call site.
        let mut store = result.store.take().or(local).unwrap_or_default();
        let mut is_sink = false;
        for entry in &summary.entries {
            match *entry {
                TaintEntry::Source { pos, class, value } => {
                    self.eval_taint_source(pp, args, call_result, pos, class, value, &mut store, result);
                }
                TaintEntry::Pipe {
                    src,
                    src_class,
                    dst,
                    dst_class,
                } => {
                    self.eval_taint_pipe(
                        pp, args, call_result, src, src_class, dst, dst_class, &mut store, result,
                    );
                }
                TaintEntry::Sink { .. } => is_sink = true,
            }
        }
        if is_sink {
            self.record_sink(pp, callee);
        }
        result.store = Some(store);
    }

    /// `SOURCE`: inject a lattice value at a position.
    #[allow(clippy::too_many_arguments)]
    fn eval_taint_source(
        &mut self,
        pp: TaintProgramPoint,
        args: &[ValueId],
        call_result: Option<ValueId>,
        pos: APosition,
        class: TClass,
        value: TaintLattice,
        store: &mut TaintStore,
        result: &mut EvalResult,
    ) {
        // A return position can only carry value taint; other classes are
        // coerced.
        let class = if pos.is_return() && class != TClass::ValueOnly {
            self.logs.push(
                LogMessage::new_debug(
                    "source entry with a memory class at the return position; using V instead"
                        .to_string(),
                )
                .source("taint"),
            );
            TClass::ValueOnly
        } else {
            class
        };
        self.update_call_position(pp, args, call_result, pos, class, value, store, result);
    }

    /// `PIPE`: copy taint from one position to another.
    #[allow(clippy::too_many_arguments)]
    fn eval_taint_pipe(
        &mut self,
        pp: TaintProgramPoint,
        args: &[ValueId],
        call_result: Option<ValueId>,
        src: APosition,
        src_class: TClass,
        dst: APosition,
        dst_class: TClass,
        store: &mut TaintStore,
        result: &mut EvalResult,
    ) {
        if src.is_return() {
            self.warn_position(pp, "pipe source cannot be the return position");
            return;
        }
        let src_values = self.position_values(pp, args, call_result, src);
        if src_values.is_empty() {
            return;
        }

        if src_class == TClass::ReachableMemory && dst_class == TClass::ReachableMemory {
            // The memcpy case: transfer every reachable field.
            let dst_values = self.position_values(pp, args, call_result, dst);
            for src_value in &src_values {
                for dst_value in &dst_values {
                    self.eval_taint_memcpy(pp, *src_value, *dst_value, store, result);
                }
            }
            return;
        }

        let mut taint = TaintLattice::Unknown;
        for src_value in &src_values {
            taint = taint.merge(self.taint_by_class(pp, *src_value, src_class, store));
        }
        if taint == TaintLattice::Unknown {
            return;
        }
        let dst_class = if dst.is_return() && dst_class != TClass::ValueOnly {
            TClass::ValueOnly
        } else {
            dst_class
        };
        self.update_call_position(pp, args, call_result, dst, dst_class, taint, store, result);
    }

    /// Read the taint of a value under a class.
    pub(super) fn taint_by_class(
        &mut self,
        pp: TaintProgramPoint,
        value: ValueId,
        class: TClass,
        store: &TaintStore,
    ) -> TaintLattice {
        match class {
            TClass::ValueOnly => self.taint_of_value(pp.ctx, value),
            TClass::DirectMemory => {
                let set = self.pa.pts_of_value(pp.ctx, value, self.module);
                self.load_taint_from_pts(set, store)
            }
            TClass::ReachableMemory => {
                let set = self.pa.pts_of_value(pp.ctx, value, self.module);
                let objs: Vec<MemObjId> = self.pa.pts.elements(set).to_vec();
                let mut merged = TaintLattice::Unknown;
                for obj in objs {
                    if self.pa.mem_mgr.is_special(obj) {
                        if obj == self.pa.mem_mgr.universal_object() {
                            return TaintLattice::Either;
                        }
                        continue;
                    }
                    for field in self.pa.mem_mgr.reachable_memory_objects(obj) {
                        merged = merged.merge(store.lookup(field));
                        if merged == TaintLattice::Either {
                            return merged;
                        }
                    }
                }
                merged
            }
        }
    }

    /// Write a taint value at a call position under a class.
    #[allow(clippy::too_many_arguments)]
    fn update_call_position(
        &mut self,
        pp: TaintProgramPoint,
        args: &[ValueId],
        call_result: Option<ValueId>,
        pos: APosition,
        class: TClass,
        value: TaintLattice,
        store: &mut TaintStore,
        result: &mut EvalResult,
    ) {
        let targets = self.position_values(pp, args, call_result, pos);
        for target in targets {
            match class {
                TClass::ValueOnly => {
                    if self.env.strong_update((pp.ctx, target), value) {
                        self.add_top_succs(pp, result);
                    }
                }
                TClass::DirectMemory => {
                    let set = self.pa.pts_of_value(pp.ctx, target, self.module);
                    for obj in self.pa.pts.elements(set).to_vec() {
                        if self.pa.mem_mgr.is_special(obj) {
                            continue;
                        }
                        store.weak_update(obj, value);
                        self.add_mem_succs_of(pp, obj, result);
                    }
                }
                TClass::ReachableMemory => {
                    let set = self.pa.pts_of_value(pp.ctx, target, self.module);
                    for obj in self.pa.pts.elements(set).to_vec() {
                        if self.pa.mem_mgr.is_special(obj) {
                            continue;
                        }
                        for field in self.pa.mem_mgr.reachable_memory_objects(obj) {
                            if self.pa.mem_mgr.is_special(field) {
                                continue;
                            }
                            store.weak_update(field, value);
                            self.add_mem_succs_of(pp, field, result);
                        }
                    }
                }
            }
        }
    }

    /// The memcpy-style deep transfer: each reachable source field with a
    /// known taint is copied to the corresponding offset of the destination.
    /// Fields the source does not reach keep their prior value.
    fn eval_taint_memcpy(
        &mut self,
        pp: TaintProgramPoint,
        src_value: ValueId,
        dst_value: ValueId,
        store: &mut TaintStore,
        result: &mut EvalResult,
    ) {
        let src_set = self.pa.pts_of_value(pp.ctx, src_value, self.module);
        let dst_set = self.pa.pts_of_value(pp.ctx, dst_value, self.module);
        let src_objs: Vec<MemObjId> = self.pa.pts.elements(src_set).to_vec();
        let dst_objs: Vec<MemObjId> = self.pa.pts.elements(dst_set).to_vec();

        for src_obj in src_objs {
            if self.pa.mem_mgr.is_special(src_obj) {
                continue;
            }
            let base_offset = self.pa.mem_mgr.object(src_obj).offset;
            for field in self.pa.mem_mgr.reachable_memory_objects(src_obj) {
                let field_taint = if field == self.pa.mem_mgr.universal_object() {
                    TaintLattice::Either
                } else {
                    store.lookup(field)
                };
                if field_taint == TaintLattice::Unknown {
                    continue;
                }
                let delta = self.pa.mem_mgr.object(field).offset - base_offset;
                for dst_obj in &dst_objs {
                    let target = self.pa.mem_mgr.offset_memory(*dst_obj, delta);
                    if self.pa.mem_mgr.is_special(target) {
                        continue;
                    }
                    store.weak_update(target, field_taint);
                    self.add_mem_succs_of(pp, target, result);
                }
            }
        }
    }

    /// The values at a position of the call. `Ret` is the call result,
    /// `AfterArg` expands into the variadic tail. Out-of-range indices are
    /// reported and yield nothing.
    fn position_values(
        &mut self,
        pp: TaintProgramPoint,
        args: &[ValueId],
        call_result: Option<ValueId>,
        pos: APosition,
    ) -> Vec<ValueId> {
        match pos {
            APosition::Ret => call_result.into_iter().collect(),
            _ => {
                if !pos.in_range(args.len()) {
                    self.warn_position(
                        pp,
                        "annotation references an argument beyond the call's arity; \
                         skipping the effect",
                    );
                    return Vec::new();
                }
                pos.argument_indices(args.len())
                    .into_iter()
                    .map(|i| args[i])
                    .collect()
            }
        }
    }

    fn warn_position(&mut self, pp: TaintProgramPoint, message: &str) {
        let location = self
            .du
            .node(pp.node)
            .inst()
            .map(|site| self.module.display_site(site))
            .unwrap_or_default();
        self.logs.push(
            LogMessage::new_error(message.to_string())
                .location(location)
                .source("taint"),
        );
    }
}

//! External-call handling of the pointer analysis.
//!
//! Calls to functions without a body are interpreted through the external
//! pointer table: allocation effects create heap objects, copy effects move
//! points-to data between argument/return positions and the memory they
//! point to, and exit effects stop propagation. Unknown externals are
//! reported once and treated as no-ops.

use super::engine::{EvalResult, PointerEngine};
use super::semi_sparse::SsProgramPoint;
use super::state::Store;
use crate::analysis::memory::MemObjId;
use crate::annotation::pointer::{CopyDest, CopySource, PointerEffect};
use crate::annotation::APosition;
use crate::intermediate_representation::{FuncId, ValueId, ValueKind};
use crate::utils::log::LogMessage;

impl<'a> PointerEngine<'a> {
    /// Apply all annotated effects of an external callee. Returns whether the
    /// store was modified and whether the callee never returns.
    pub(super) fn eval_external_call(
        &mut self,
        pp: SsProgramPoint,
        callee: FuncId,
        args: &[ValueId],
        dest: Option<ValueId>,
        store: &mut Store,
        result: &mut EvalResult,
    ) -> (bool, bool) {
        let name = &self.module().func(callee).name;
        let Some(summary) = self.ext_table.lookup(name).map(|s| s.effects.clone()) else {
            self.warn_missing_external(pp, callee);
            return (false, false);
        };

        let mut modified = false;
        let mut exits = false;
        for effect in summary {
            match effect {
                PointerEffect::Alloc { size_position } => {
                    self.eval_external_alloc(pp, args, dest, size_position, result);
                }
                PointerEffect::Copy { src, dst } => {
                    modified |= self.eval_external_copy(pp, args, dest, src, dst, store, result);
                }
                PointerEffect::Exit => exits = true,
            }
        }
        (modified, exits)
    }

    /// The values at a position of the call. `Ret` resolves to the call
    /// result, `AfterArg` to the whole variadic tail. Out-of-range indices
    /// are reported and yield nothing.
    fn position_values(
        &mut self,
        pp: SsProgramPoint,
        args: &[ValueId],
        dest: Option<ValueId>,
        pos: APosition,
    ) -> Vec<ValueId> {
        match pos {
            APosition::Ret => dest.into_iter().collect(),
            _ => {
                if !pos.in_range(args.len()) {
                    let index = match pos {
                        APosition::Arg(i) | APosition::AfterArg(i) => i as usize,
                        APosition::Ret => unreachable!(),
                    };
                    self.warn_out_of_range(pp, index, args.len());
                    return Vec::new();
                }
                pos.argument_indices(args.len())
                    .into_iter()
                    .map(|i| args[i])
                    .collect()
            }
        }
    }

    fn warn_out_of_range(&mut self, pp: SsProgramPoint, index: usize, arity: usize) {
        let site = self.call_site(pp.node);
        let location = self.module().display_site(site);
        self.push_log(
            LogMessage::new_error(format!(
                "annotation references argument {index} but the call has only {arity} arguments; \
                 skipping the effect"
            ))
            .location(location)
            .source("pointer"),
        );
    }

    /// `FUNC ALLOC SIZE_POS?`: the call returns fresh heap memory. If the
    /// allocation size is a constant that matches the layout of the result's
    /// pointee type, the allocation is typed; otherwise it is a byte array.
    fn eval_external_alloc(
        &mut self,
        pp: SsProgramPoint,
        args: &[ValueId],
        dest: Option<ValueId>,
        size_position: Option<APosition>,
        result: &mut EvalResult,
    ) {
        let Some(dest) = dest else {
            return;
        };
        let site = self.call_site(pp.node);
        let alloc_ctx = self.policy_push(pp.ctx, site);

        let module = self.module();
        let pointee = module.types.pointee(module.value(dest).ty);
        let layout = match pointee {
            Some(pointee_ty) => {
                let layout = self.mem_mgr.type_map().layout_of(pointee_ty);
                let size_value = size_position
                    .and_then(|pos| self.position_values(pp, args, Some(dest), pos).first().copied());
                if self.is_single_alloc(layout, size_value) {
                    layout
                } else {
                    self.mem_mgr.type_map().byte_array()
                }
            }
            None => self.mem_mgr.type_map().byte_array(),
        };

        let obj = self.mem_mgr.allocate_heap(alloc_ctx, site, layout);
        let set = self.pts.singleton(obj);
        if self.update_env(pp.ctx, dest, set) {
            for succ in &self.program().node(pp.node).top_succs {
                result.top_succs.push(SsProgramPoint::new(pp.ctx, *succ));
            }
        }
    }

    /// Whether a constant allocation size covers exactly one cell of the
    /// layout.
    fn is_single_alloc(
        &self,
        layout: crate::analysis::memory::LayoutId,
        size_value: Option<ValueId>,
    ) -> bool {
        let Some(size_value) = size_value else {
            return false;
        };
        let ValueKind::ConstantInt(size) = self.module().value(size_value).kind else {
            return false;
        };
        let layout_size = self.mem_mgr.type_map().layout(layout).size;
        layout_size > 0 && size as u64 == layout_size
    }

    /// `FUNC COPY SRC DST`. Returns true if the store was modified.
    fn eval_external_copy(
        &mut self,
        pp: SsProgramPoint,
        args: &[ValueId],
        dest: Option<ValueId>,
        src: CopySource,
        dst: CopyDest,
        store: &mut Store,
        result: &mut EvalResult,
    ) -> bool {
        // The reachable-memory pairing is the deep-transfer (memcpy) case.
        if let (CopySource::ReachableMemory(src_pos), CopyDest::ReachableMemory(dst_pos)) =
            (src, dst)
        {
            return self.eval_external_memcpy(pp, args, dest, src_pos, dst_pos, store);
        }

        let src_set = match src {
            CopySource::Universal => self.universal_set,
            CopySource::Null => self.null_set,
            CopySource::Static => {
                // Memory owned by the external library, keyed by the call
                // site: an untyped summary region.
                let site = self.call_site(pp.node);
                let static_ctx = self.policy_push(pp.ctx, site);
                let byte_array = self.mem_mgr.type_map().byte_array();
                let obj = self.mem_mgr.allocate_heap(static_ctx, site, byte_array);
                self.pts.singleton(obj)
            }
            CopySource::Value(pos) => {
                let values = self.position_values(pp, args, dest, pos);
                let sets: Vec<_> = values
                    .iter()
                    .map(|value| self.pts_of_value(pp.ctx, *value))
                    .collect();
                self.pts.merge_all(&sets)
            }
            CopySource::DirectMemory(pos) => {
                let values = self.position_values(pp, args, dest, pos);
                let mut sets = Vec::new();
                for value in values {
                    let ptr_set = self.pts_of_value(pp.ctx, value);
                    let objs: Vec<MemObjId> = self.pts.elements(ptr_set).to_vec();
                    for obj in objs {
                        if obj == self.mem_mgr.universal_object() {
                            sets.push(self.universal_set);
                        } else if obj == self.mem_mgr.null_object() {
                            continue;
                        } else {
                            sets.push(store.lookup(obj));
                        }
                    }
                }
                self.pts.merge_all(&sets)
            }
            CopySource::ReachableMemory(_) => {
                // Only meaningful paired with a reachable-memory destination.
                return false;
            }
        };
        if src_set.is_empty() {
            return false;
        }

        match dst {
            CopyDest::Value(pos) => {
                let values = self.position_values(pp, args, dest, pos);
                let mut changed = false;
                for value in values {
                    changed |= self.update_env(pp.ctx, value, src_set);
                }
                if changed {
                    for succ in &self.program().node(pp.node).top_succs {
                        result.top_succs.push(SsProgramPoint::new(pp.ctx, *succ));
                    }
                }
                false
            }
            CopyDest::DirectMemory(pos) => {
                let values = self.position_values(pp, args, dest, pos);
                let mut modified = false;
                for value in values {
                    let dst_set = self.pts_of_value(pp.ctx, value);
                    let dst_objs: Vec<MemObjId> = self.pts.elements(dst_set).to_vec();
                    for obj in dst_objs {
                        if self.mem_mgr.is_special(obj) {
                            continue;
                        }
                        modified |= store.weak_update(obj, src_set, &mut self.pts);
                    }
                }
                modified
            }
            CopyDest::ReachableMemory(_) => false,
        }
    }

    /// The deep pointer transfer of `memcpy`-like functions: every reachable
    /// pointer field of the source region is copied into the corresponding
    /// offset of the destination region.
    fn eval_external_memcpy(
        &mut self,
        pp: SsProgramPoint,
        args: &[ValueId],
        dest: Option<ValueId>,
        src_pos: APosition,
        dst_pos: APosition,
        store: &mut Store,
    ) -> bool {
        let Some(src_value) = self.position_values(pp, args, dest, src_pos).first().copied()
        else {
            return false;
        };
        let Some(dst_value) = self.position_values(pp, args, dest, dst_pos).first().copied()
        else {
            return false;
        };
        let src_set = self.pts_of_value(pp.ctx, src_value);
        let dst_set = self.pts_of_value(pp.ctx, dst_value);
        if src_set.is_empty() || dst_set.is_empty() {
            return false;
        }

        let src_objs: Vec<MemObjId> = self.pts.elements(src_set).to_vec();
        let dst_objs: Vec<MemObjId> = self.pts.elements(dst_set).to_vec();
        let mut modified = false;
        for src_obj in src_objs {
            if self.mem_mgr.is_special(src_obj) {
                continue;
            }
            let fields = self.mem_mgr.reachable_pointer_objects(src_obj);
            let base_offset = self.mem_mgr.object(src_obj).offset;
            for field in fields {
                let field_set = store.lookup(field);
                if field_set.is_empty() {
                    continue;
                }
                let delta = self.mem_mgr.object(field).offset - base_offset;
                for dst_obj in &dst_objs {
                    let target = self.mem_mgr.offset_memory(*dst_obj, delta);
                    if self.mem_mgr.is_special(target) {
                        continue;
                    }
                    modified |= store.weak_update(target, field_set, &mut self.pts);
                }
            }
        }
        modified
    }
}

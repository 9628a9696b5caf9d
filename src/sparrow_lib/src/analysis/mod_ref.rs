//! Mod-ref summaries: which memory each function may read or write.
//!
//! For every defined function the analysis collects the memory objects its
//! loads, stores and calls touch, then propagates callee summaries to their
//! callers over the (context-insensitive) call graph until a fixed point is
//! reached. External calls contribute the effects listed in the mod-ref
//! annotation table. Objects that are local to a function's own stack are
//! filtered out when its summary is merged into a caller, and the null and
//! universal sentinels never appear in summaries at all.
//!
//! The reaching-definition analysis and the def-use builder are the only
//! consumers.

use super::memory::{AllocKind, MemObjId};
use super::pointer::PointerAnalysisData;
use super::worklist::FifoWorkList;
use crate::annotation::mod_ref::ExternalModRefTable;
use crate::annotation::APosition;
use crate::intermediate_representation::{FuncId, InstKind, Module, ValueId, ValueKind};
use crate::utils::log::LogMessage;
use fnv::{FnvHashMap, FnvHashSet};

/// The mod-ref summary of one function.
#[derive(Debug, Clone, Default)]
pub struct ModRefFunctionSummary {
    /// Global values the function reads directly.
    pub value_reads: FnvHashSet<ValueId>,
    /// Memory objects the function (or its callees) may read.
    pub mem_reads: FnvHashSet<MemObjId>,
    /// Memory objects the function (or its callees) may write.
    pub mem_writes: FnvHashSet<MemObjId>,
}

impl ModRefFunctionSummary {
    fn add_value_read(&mut self, v: ValueId) -> bool {
        self.value_reads.insert(v)
    }

    fn add_mem_read(&mut self, obj: MemObjId) -> bool {
        self.mem_reads.insert(obj)
    }

    fn add_mem_write(&mut self, obj: MemObjId) -> bool {
        self.mem_writes.insert(obj)
    }
}

/// The summaries of all defined functions.
#[derive(Debug, Clone, Default)]
pub struct ModRefModuleSummary {
    summaries: FnvHashMap<FuncId, ModRefFunctionSummary>,
}

impl ModRefModuleSummary {
    pub fn summary(&self, func: FuncId) -> Option<&ModRefFunctionSummary> {
        self.summaries.get(&func)
    }
}

/// Whether an object must not appear in the summary that gets propagated to
/// `caller`: sentinels never do, and a function's own stack slots are
/// invisible to its callers.
fn is_local_to(pa: &PointerAnalysisData, obj: MemObjId, caller: FuncId) -> bool {
    match pa.mem_mgr.site(pa.mem_mgr.object(obj).site).kind {
        AllocKind::Null | AllocKind::Universal => true,
        AllocKind::Stack { site, .. } => site.func == caller,
        _ => false,
    }
}

/// Compute mod-ref summaries for every defined function of the module.
pub fn run(
    module: &Module,
    pa: &mut PointerAnalysisData,
    table: &ExternalModRefTable,
    logs: &mut Vec<LogMessage>,
) -> ModRefModuleSummary {
    let mut result = ModRefModuleSummary::default();
    let mut reverse_calls: FnvHashMap<FuncId, FnvHashSet<FuncId>> = FnvHashMap::default();

    // Local pass: per-instruction effects, and the reverse call map.
    for (fidx, func) in module.functions.iter().enumerate() {
        if func.is_declaration() {
            continue;
        }
        let func_id = FuncId(fidx as u32);
        let mut summary = ModRefFunctionSummary::default();
        for block in &func.blocks {
            for inst in &block.insts {
                match &inst.kind {
                    InstKind::Load { address } => {
                        if module.is_global_value(*address) {
                            summary.add_value_read(*address);
                        }
                        let set = pa.pts_of_value_all_contexts(*address, module);
                        for obj in pa.pts.elements(set).to_vec() {
                            summary.add_mem_read(obj);
                        }
                    }
                    InstKind::Store { address, .. } => {
                        let set = pa.pts_of_value_all_contexts(*address, module);
                        for obj in pa.pts.elements(set).to_vec() {
                            summary.add_mem_write(obj);
                        }
                    }
                    InstKind::Call { callee, args } => {
                        let callees = pa.callees_of_call_all_contexts(*callee, module);
                        for target in callees {
                            if module.func(target).is_declaration() {
                                apply_external_effects(
                                    module, pa, table, target, args, inst.result, &mut summary,
                                    logs,
                                );
                            } else {
                                reverse_calls.entry(target).or_default().insert(func_id);
                            }
                        }
                    }
                    _ => (),
                }
            }
        }
        result.summaries.insert(func_id, summary);
    }

    // Propagation pass: push callee effects into callers until stable.
    let mut worklist: FifoWorkList<FuncId> = FifoWorkList::new();
    let mut order: Vec<FuncId> = result.summaries.keys().copied().collect();
    order.sort_unstable();
    for func in order {
        worklist.enqueue(func);
    }
    while let Some(callee) = worklist.dequeue() {
        let Some(callee_summary) = result.summaries.get(&callee).cloned() else {
            continue;
        };
        let callers: Vec<FuncId> = reverse_calls
            .get(&callee)
            .map(|s| {
                let mut v: Vec<FuncId> = s.iter().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default();
        for caller in callers {
            let caller_summary = result.summaries.entry(caller).or_default();
            let mut changed = false;
            for value in &callee_summary.value_reads {
                changed |= caller_summary.add_value_read(*value);
            }
            for obj in &callee_summary.mem_reads {
                if !is_local_to(pa, *obj, caller) {
                    changed |= caller_summary.add_mem_read(*obj);
                }
            }
            for obj in &callee_summary.mem_writes {
                if !is_local_to(pa, *obj, caller) {
                    changed |= caller_summary.add_mem_write(*obj);
                }
            }
            if changed {
                worklist.enqueue(caller);
            }
        }
    }

    result
}

/// Record the mod/ref effects of one external call into `summary`.
#[allow(clippy::too_many_arguments)]
fn apply_external_effects(
    module: &Module,
    pa: &mut PointerAnalysisData,
    table: &ExternalModRefTable,
    callee: FuncId,
    args: &[ValueId],
    call_result: Option<ValueId>,
    summary: &mut ModRefFunctionSummary,
    logs: &mut Vec<LogMessage>,
) {
    let name = &module.func(callee).name;
    let Some(effects) = table.lookup(name) else {
        logs.push(
            LogMessage::new_error(format!(
                "missing entry in mod-ref table for {name}; treating the call as effect-free"
            ))
            .source("mod-ref"),
        );
        return;
    };
    for effect in effects {
        let values: Vec<ValueId> = match effect.pos {
            APosition::Ret => call_result.into_iter().collect(),
            pos => {
                if !pos.in_range(args.len()) {
                    logs.push(
                        LogMessage::new_error(format!(
                            "mod-ref annotation for {name} references an argument beyond the \
                             call's arity; skipping the effect"
                        ))
                        .source("mod-ref"),
                    );
                    continue;
                }
                pos.argument_indices(args.len())
                    .into_iter()
                    .map(|i| args[i])
                    .collect()
            }
        };
        for value in values {
            let set = pa.pts_of_value_all_contexts(value, module);
            for obj in pa.pts.elements(set).to_vec() {
                let objs = if effect.reach {
                    pa.mem_mgr.reachable_memory_objects(obj)
                } else {
                    vec![obj]
                };
                for target in objs {
                    if effect.is_mod() {
                        summary.add_mem_write(target);
                    } else {
                        summary.add_mem_read(target);
                    }
                }
            }
        }
    }
    // A global passed directly to an annotated reader counts as a value read.
    for arg in args {
        if module.is_global_value(*arg) {
            if let ValueKind::Global(_) = module.value(*arg).kind {
                summary.add_value_read(*arg);
            }
        }
    }
}

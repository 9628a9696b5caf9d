//! Reaching definitions over memory objects.
//!
//! For every instruction of a function, compute which earlier instructions
//! may have last written each memory object. Stores mirror the pointer
//! analysis' update rule: a store through a singleton, non-summary
//! destination replaces the reaching set (strong update), anything else
//! inserts into it. Calls define whatever their callees may write, using the
//! mod-ref summaries for internal callees and the annotation table for
//! external ones. The function entry acts as the definition of everything
//! the function may read from its callers.

use super::memory::MemObjId;
use super::mod_ref::ModRefModuleSummary;
use super::pointer::PointerAnalysisData;
use super::worklist::FifoWorkList;
use crate::annotation::mod_ref::ExternalModRefTable;
use crate::annotation::APosition;
use crate::intermediate_representation::{
    BlockId, FuncId, InstKind, InstRef, Module, ValueId,
};
use crate::utils::log::LogMessage;
use fnv::FnvHashMap;
use std::collections::BTreeSet;

/// A definition site: the function entry or an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Definer {
    Entry,
    Inst(InstRef),
}

/// The definitions reaching one program location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReachingDefStore {
    map: FnvHashMap<MemObjId, BTreeSet<Definer>>,
}

impl ReachingDefStore {
    /// Replace the reaching set of `obj` (strong update).
    fn update_binding(&mut self, obj: MemObjId, definer: Definer) {
        self.map.insert(obj, BTreeSet::from([definer]));
    }

    /// Add to the reaching set of `obj` (weak update).
    fn insert_binding(&mut self, obj: MemObjId, definer: Definer) -> bool {
        self.map.entry(obj).or_default().insert(definer)
    }

    /// The definers of `obj`, if any reach this location.
    pub fn definers(&self, obj: MemObjId) -> Option<&BTreeSet<Definer>> {
        self.map.get(&obj)
    }

    /// Merge `other` into `self`; true if anything was added.
    fn merge(&mut self, other: &ReachingDefStore) -> bool {
        let mut changed = false;
        for (obj, definers) in &other.map {
            let entry = self.map.entry(*obj).or_default();
            for definer in definers {
                changed |= entry.insert(*definer);
            }
        }
        changed
    }
}

/// Reaching definitions for every instruction of one function.
#[derive(Debug, Default)]
pub struct ReachingDefMap {
    map: FnvHashMap<InstRef, ReachingDefStore>,
}

impl ReachingDefMap {
    pub fn store_at(&self, inst: InstRef) -> Option<&ReachingDefStore> {
        self.map.get(&inst)
    }

    fn merge_into(&mut self, inst: InstRef, store: &ReachingDefStore) -> bool {
        self.map.entry(inst).or_default().merge(store)
    }
}

/// Run the analysis on one defined function.
pub fn run_on_function(
    module: &Module,
    func_id: FuncId,
    pa: &mut PointerAnalysisData,
    summaries: &ModRefModuleSummary,
    table: &ExternalModRefTable,
    logs: &mut Vec<LogMessage>,
) -> ReachingDefMap {
    let func = module.func(func_id);
    let mut rd = ReachingDefMap::default();
    if func.blocks.is_empty() || func.blocks[0].insts.is_empty() {
        return rd;
    }

    // Everything the function may read can be defined by its callers.
    let entry_inst = InstRef {
        func: func_id,
        block: BlockId(0),
        index: 0,
    };
    {
        let entry_store = rd.map.entry(entry_inst).or_default();
        if let Some(summary) = summaries.summary(func_id) {
            let mut reads: Vec<MemObjId> = summary.mem_reads.iter().copied().collect();
            reads.sort_unstable();
            for obj in reads {
                entry_store.insert_binding(obj, Definer::Entry);
            }
        }
    }

    let mut worklist: FifoWorkList<InstRef> = FifoWorkList::new();
    worklist.enqueue(entry_inst);
    while let Some(site) = worklist.dequeue() {
        let mut store = rd.map.get(&site).cloned().unwrap_or_default();
        eval_instruction(module, pa, summaries, table, site, &mut store, logs);
        for succ in successor_instructions(module, site) {
            if rd.merge_into(succ, &store) {
                worklist.enqueue(succ);
            }
        }
    }
    rd
}

/// The instructions that follow `site` in the CFG.
fn successor_instructions(module: &Module, site: InstRef) -> Vec<InstRef> {
    let func = module.func(site.func);
    let block = &func.blocks[site.block.0 as usize];
    if (site.index as usize) + 1 < block.insts.len() {
        return vec![InstRef {
            func: site.func,
            block: site.block,
            index: site.index + 1,
        }];
    }
    match block.insts.last().map(|i| &i.kind) {
        Some(InstKind::Branch { targets, .. }) => targets
            .iter()
            .filter(|b| !func.blocks[b.0 as usize].insts.is_empty())
            .map(|b| InstRef {
                func: site.func,
                block: *b,
                index: 0,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Apply the defining effect of one instruction to the store.
fn eval_instruction(
    module: &Module,
    pa: &mut PointerAnalysisData,
    summaries: &ModRefModuleSummary,
    table: &ExternalModRefTable,
    site: InstRef,
    store: &mut ReachingDefStore,
    logs: &mut Vec<LogMessage>,
) {
    let inst = module.inst(site);
    match &inst.kind {
        InstKind::Alloca { .. } => {
            if let Some(result) = inst.result {
                let set = pa.pts_of_value_all_contexts(result, module);
                for obj in pa.pts.elements(set).to_vec() {
                    store.insert_binding(obj, Definer::Inst(site));
                }
            }
        }
        InstKind::Store { address, .. } => {
            let set = pa.pts_of_value_all_contexts(*address, module);
            let objs: Vec<MemObjId> = pa.pts.elements(set).to_vec();
            let strong = objs.len() == 1 && !pa.mem_mgr.is_summary(objs[0]);
            for obj in objs {
                if strong {
                    store.update_binding(obj, Definer::Inst(site));
                } else {
                    store.insert_binding(obj, Definer::Inst(site));
                }
            }
        }
        InstKind::Call { callee, args } => {
            let callees = pa.callees_of_call_all_contexts(*callee, module);
            for target in callees {
                if module.func(target).is_declaration() {
                    eval_external_call(module, pa, table, site, target, args, inst.result, store, logs);
                } else if let Some(summary) = summaries.summary(target) {
                    let mut writes: Vec<MemObjId> = summary.mem_writes.iter().copied().collect();
                    writes.sort_unstable();
                    for obj in writes {
                        store.insert_binding(obj, Definer::Inst(site));
                    }
                }
            }
        }
        _ => (),
    }
}

/// Record the definitions made by an annotated external call.
#[allow(clippy::too_many_arguments)]
fn eval_external_call(
    module: &Module,
    pa: &mut PointerAnalysisData,
    table: &ExternalModRefTable,
    site: InstRef,
    callee: FuncId,
    args: &[ValueId],
    call_result: Option<ValueId>,
    store: &mut ReachingDefStore,
    logs: &mut Vec<LogMessage>,
) {
    let name = &module.func(callee).name;
    let Some(effects) = table.lookup(name) else {
        logs.push(
            LogMessage::new_error(format!(
                "missing entry in mod-ref table for {name}; treating the call as effect-free"
            ))
            .location(module.display_site(site))
            .source("reaching-def"),
        );
        return;
    };
    for effect in effects {
        if !effect.is_mod() {
            continue;
        }
        let values: Vec<ValueId> = match effect.pos {
            APosition::Ret => call_result.into_iter().collect(),
            pos => {
                if !pos.in_range(args.len()) {
                    logs.push(
                        LogMessage::new_error(format!(
                            "mod-ref annotation for {name} references an argument beyond the \
                             call's arity; skipping the effect"
                        ))
                        .location(module.display_site(site))
                        .source("reaching-def"),
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
                let targets = if effect.reach {
                    pa.mem_mgr.reachable_memory_objects(obj)
                } else {
                    vec![obj]
                };
                for target in targets {
                    store.insert_binding(target, Definer::Inst(site));
                }
            }
        }
    }
}

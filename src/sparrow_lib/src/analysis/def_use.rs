//! The def-use module: the sparse dataflow skeleton the taint analysis runs
//! on.
//!
//! Every function gets an entry node plus one node per instruction
//! (unconditional branches are elided). Nodes carry two kinds of successor
//! edges:
//!
//! - top-level edges follow the SSA def-use relation,
//! - memory-level edges are keyed by a memory object and connect each writer
//!   of the object to every reader it may reach, as computed by the
//!   reaching-definition analysis over the points-to solution.
//!
//! The def-use graph over-approximates the semantic dependence graph: every
//! semantic dependency is an edge, but edges may be spurious.

use super::memory::MemObjId;
use super::mod_ref::{self, ModRefModuleSummary};
use super::pointer::PointerAnalysisData;
use super::reaching_def::{self, Definer};
use super::ProgramPoint;
use crate::annotation::mod_ref::ExternalModRefTable;
use crate::annotation::APosition;
use crate::intermediate_representation::{BlockId, FuncId, InstKind, InstRef, Module, ValueId};
use crate::utils::log::LogMessage;
use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

/// Index of a def-use node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DuId(pub u32);

/// A program point of the taint engine.
pub type TaintProgramPoint = ProgramPoint<DuId>;

/// What a def-use node wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuKind {
    /// The entry of a function, scheduled before all of its instructions.
    Entry { func: FuncId },
    /// An IR instruction.
    Inst(InstRef),
}

/// One node of the def-use graph.
#[derive(Debug, Clone)]
pub struct DefUseInstruction {
    pub func: FuncId,
    pub kind: DuKind,
    /// Reverse-post-order priority; the entry has the maximum value.
    pub priority: usize,
    pub top_succs: Vec<DuId>,
    pub top_preds: Vec<DuId>,
    pub mem_succs: FnvHashMap<MemObjId, Vec<DuId>>,
    pub mem_preds: FnvHashMap<MemObjId, Vec<DuId>>,
}

impl DefUseInstruction {
    pub fn is_entry(&self) -> bool {
        matches!(self.kind, DuKind::Entry { .. })
    }

    pub fn inst(&self) -> Option<InstRef> {
        match self.kind {
            DuKind::Entry { .. } => None,
            DuKind::Inst(site) => Some(site),
        }
    }

    /// Memory-level successors through a specific object.
    pub fn mem_succs_of(&self, obj: MemObjId) -> &[DuId] {
        self.mem_succs.get(&obj).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// The def-use graph of one function.
#[derive(Debug, Clone)]
pub struct DefUseFunction {
    pub func: FuncId,
    pub entry: DuId,
    /// The first return instruction, if the function has one.
    pub exit: Option<DuId>,
}

/// The def-use graphs of all defined functions.
pub struct DefUseModule {
    insts: Vec<DefUseInstruction>,
    funcs: FnvHashMap<FuncId, DefUseFunction>,
    by_inst: FnvHashMap<InstRef, DuId>,
    entry_func: FuncId,
    /// The mod-ref summaries computed while building the memory edges.
    pub summaries: ModRefModuleSummary,
}

impl DefUseModule {
    pub fn node(&self, id: DuId) -> &DefUseInstruction {
        &self.insts[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.insts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DuId, &DefUseInstruction)> {
        self.insts
            .iter()
            .enumerate()
            .map(|(i, n)| (DuId(i as u32), n))
    }

    pub fn function(&self, func: FuncId) -> Option<&DefUseFunction> {
        self.funcs.get(&func)
    }

    pub fn node_of(&self, inst: InstRef) -> Option<DuId> {
        self.by_inst.get(&inst).copied()
    }

    pub fn entry_function(&self) -> FuncId {
        self.entry_func
    }

    /// Build the def-use module from the points-to solution.
    pub fn build(
        module: &Module,
        pa: &mut PointerAnalysisData,
        table: &ExternalModRefTable,
        logs: &mut Vec<LogMessage>,
    ) -> anyhow::Result<DefUseModule> {
        let entry_func = module
            .entry_function()
            .ok_or_else(|| anyhow::anyhow!("module has no entry function `main`"))?;
        let summaries = mod_ref::run(module, pa, table, logs);
        let mut builder = Builder {
            module,
            pa,
            table,
            summaries,
            insts: Vec::new(),
            funcs: FnvHashMap::default(),
            by_inst: FnvHashMap::default(),
            logs,
        };
        for (fidx, func) in module.functions.iter().enumerate() {
            if func.is_declaration() {
                continue;
            }
            builder.build_function(FuncId(fidx as u32));
        }
        Ok(DefUseModule {
            insts: builder.insts,
            funcs: builder.funcs,
            by_inst: builder.by_inst,
            entry_func,
            summaries: builder.summaries,
        })
    }
}

struct Builder<'a> {
    module: &'a Module,
    pa: &'a mut PointerAnalysisData,
    table: &'a ExternalModRefTable,
    summaries: ModRefModuleSummary,
    insts: Vec<DefUseInstruction>,
    funcs: FnvHashMap<FuncId, DefUseFunction>,
    by_inst: FnvHashMap<InstRef, DuId>,
    logs: &'a mut Vec<LogMessage>,
}

impl<'a> Builder<'a> {
    fn push_node(&mut self, func: FuncId, kind: DuKind) -> DuId {
        let id = DuId(self.insts.len() as u32);
        self.insts.push(DefUseInstruction {
            func,
            kind,
            priority: 0,
            top_succs: Vec::new(),
            top_preds: Vec::new(),
            mem_succs: FnvHashMap::default(),
            mem_preds: FnvHashMap::default(),
        });
        if let DuKind::Inst(site) = kind {
            self.by_inst.insert(site, id);
        }
        id
    }

    fn add_top_edge(&mut self, from: DuId, to: DuId) {
        if from == to {
            return;
        }
        let succs = &mut self.insts[from.0 as usize].top_succs;
        if !succs.contains(&to) {
            succs.push(to);
            self.insts[to.0 as usize].top_preds.push(from);
        }
    }

    fn add_mem_edge(&mut self, from: DuId, obj: MemObjId, to: DuId) {
        if from == to {
            return;
        }
        let succs = self.insts[from.0 as usize].mem_succs.entry(obj).or_default();
        if !succs.contains(&to) {
            succs.push(to);
            self.insts[to.0 as usize]
                .mem_preds
                .entry(obj)
                .or_default()
                .push(from);
        }
    }

    fn build_function(&mut self, func_id: FuncId) {
        let func = self.module.func(func_id);
        let entry = self.push_node(func_id, DuKind::Entry { func: func_id });
        let mut exit = None;

        // One node per instruction; unconditional branches are elided.
        let mut block_nodes: Vec<Vec<DuId>> = vec![Vec::new(); func.blocks.len()];
        for (bidx, block) in func.blocks.iter().enumerate() {
            for (iidx, inst) in block.insts.iter().enumerate() {
                if let InstKind::Branch { cond: None, .. } = inst.kind {
                    continue;
                }
                let site = InstRef {
                    func: func_id,
                    block: BlockId(bidx as u32),
                    index: iidx as u32,
                };
                let id = self.push_node(func_id, DuKind::Inst(site));
                block_nodes[bidx].push(id);
                if exit.is_none() && matches!(inst.kind, InstKind::Return { .. }) {
                    exit = Some(id);
                }
            }
        }
        self.funcs.insert(
            func_id,
            DefUseFunction {
                func: func_id,
                entry,
                exit,
            },
        );

        self.link_top_level(func_id, entry);
        self.link_memory_level(func_id, entry);
        self.assign_priorities(func_id, entry, &block_nodes);
        self.connect_roots(func_id, entry);
    }

    /// SSA def-use edges; the entry defines the parameters.
    fn link_top_level(&mut self, func_id: FuncId, entry: DuId) {
        let func = self.module.func(func_id);
        let mut def_of: FnvHashMap<ValueId, DuId> = FnvHashMap::default();
        for param in &func.params {
            def_of.insert(*param, entry);
        }
        let nodes: Vec<DuId> = self
            .insts
            .iter()
            .enumerate()
            .filter(|(_, n)| n.func == func_id)
            .map(|(i, _)| DuId(i as u32))
            .collect();
        for id in &nodes {
            if let Some(site) = self.insts[id.0 as usize].inst() {
                if let Some(result) = self.module.inst(site).result {
                    def_of.insert(result, *id);
                }
            }
        }
        for id in &nodes {
            let Some(site) = self.insts[id.0 as usize].inst() else {
                continue;
            };
            for op in self.module.inst(site).kind.operands() {
                if let Some(def) = def_of.get(&op).copied() {
                    self.add_top_edge(def, *id);
                }
            }
        }
    }

    /// Memory edges from the reaching-definition solution.
    fn link_memory_level(&mut self, func_id: FuncId, entry: DuId) {
        let rd = reaching_def::run_on_function(
            self.module,
            func_id,
            self.pa,
            &self.summaries,
            self.table,
            self.logs,
        );

        let readers: Vec<DuId> = self
            .insts
            .iter()
            .enumerate()
            .filter(|(_, n)| n.func == func_id && !n.is_entry())
            .map(|(i, _)| DuId(i as u32))
            .collect();
        for reader in readers {
            let site = self.insts[reader.0 as usize].inst().unwrap();
            let read_objs = self.objects_read_by(site);
            if read_objs.is_empty() {
                continue;
            }
            let Some(store) = rd.store_at(site) else {
                continue;
            };
            for obj in read_objs {
                let Some(definers) = store.definers(obj) else {
                    continue;
                };
                for definer in definers.iter().copied().collect::<Vec<_>>() {
                    let from = match definer {
                        Definer::Entry => entry,
                        Definer::Inst(def_site) => match self.by_inst.get(&def_site) {
                            Some(id) => *id,
                            None => continue,
                        },
                    };
                    self.add_mem_edge(from, obj, reader);
                }
            }
        }
    }

    /// The memory objects an instruction may read. Loads read through their
    /// address; calls read what their callees reference; returns read
    /// everything the function exposes to its callers (so the memory state
    /// that flows back to call sites is complete).
    fn objects_read_by(&mut self, site: InstRef) -> Vec<MemObjId> {
        let inst = self.module.inst(site);
        let mut objs: Vec<MemObjId> = Vec::new();
        match &inst.kind {
            InstKind::Load { address } => {
                let set = self.pa.pts_of_value_all_contexts(*address, self.module);
                objs.extend_from_slice(&self.pa.pts.elements(set).to_vec());
            }
            InstKind::Call { callee, args } => {
                let callees = self.pa.callees_of_call_all_contexts(*callee, self.module);
                for target in callees {
                    if self.module.func(target).is_declaration() {
                        objs.extend(self.objects_read_by_external(site, target, args, inst.result));
                    } else if let Some(summary) = self.summaries.summary(target) {
                        let mut reads: Vec<MemObjId> = summary.mem_reads.iter().copied().collect();
                        reads.sort_unstable();
                        objs.extend(reads);
                    }
                }
            }
            InstKind::Return { .. } => {
                if let Some(summary) = self.summaries.summary(site.func) {
                    let mut exposed: Vec<MemObjId> = summary
                        .mem_writes
                        .iter()
                        .chain(summary.mem_reads.iter())
                        .copied()
                        .collect();
                    exposed.sort_unstable();
                    exposed.dedup();
                    objs.extend(exposed);
                }
            }
            _ => (),
        }
        objs.sort_unstable();
        objs.dedup();
        objs
    }

    fn objects_read_by_external(
        &mut self,
        _site: InstRef,
        callee: FuncId,
        args: &[ValueId],
        call_result: Option<ValueId>,
    ) -> Vec<MemObjId> {
        let name = &self.module.func(callee).name;
        let mut objs = Vec::new();
        let Some(effects) = self.table.lookup(name) else {
            return objs;
        };
        for effect in effects {
            if !effect.is_ref() {
                continue;
            }
            let values: Vec<ValueId> = match effect.pos {
                APosition::Ret => call_result.into_iter().collect(),
                pos => pos
                    .argument_indices(args.len())
                    .into_iter()
                    .map(|i| args[i])
                    .collect(),
            };
            for value in values {
                let set = self.pa.pts_of_value_all_contexts(value, self.module);
                for obj in self.pa.pts.elements(set).to_vec() {
                    if effect.reach {
                        objs.extend(self.pa.mem_mgr.reachable_memory_objects(obj));
                    } else {
                        objs.push(obj);
                    }
                }
            }
        }
        objs
    }

    /// Reverse-post-order priorities over the function's CFG; the entry gets
    /// the maximum priority so it is scheduled first.
    fn assign_priorities(&mut self, func_id: FuncId, entry: DuId, block_nodes: &[Vec<DuId>]) {
        let func = self.module.func(func_id);
        let mut graph: DiGraph<DuId, ()> = DiGraph::new();
        let mut index_of: FnvHashMap<DuId, NodeIndex> = FnvHashMap::default();
        let entry_idx = graph.add_node(entry);
        index_of.insert(entry, entry_idx);
        for nodes in block_nodes {
            for node in nodes {
                let idx = graph.add_node(*node);
                index_of.insert(*node, idx);
            }
        }

        let block_succs: Vec<Vec<usize>> = func
            .blocks
            .iter()
            .map(|block| match block.insts.last().map(|i| &i.kind) {
                Some(InstKind::Branch { targets, .. }) => {
                    targets.iter().map(|b| b.0 as usize).collect()
                }
                _ => Vec::new(),
            })
            .collect();

        let mut first_cache: Vec<Option<Vec<DuId>>> = vec![None; func.blocks.len()];
        for bidx in 0..func.blocks.len() {
            first_du_nodes(bidx, block_nodes, &block_succs, &mut first_cache);
        }

        let mut edges: Vec<(DuId, DuId)> = Vec::new();
        for (bidx, nodes) in block_nodes.iter().enumerate() {
            for pair in nodes.windows(2) {
                edges.push((pair[0], pair[1]));
            }
            if let Some(last) = nodes.last() {
                for succ_block in &block_succs[bidx] {
                    for first in first_cache[*succ_block].as_ref().unwrap() {
                        edges.push((*last, *first));
                    }
                }
            }
        }
        for first in first_cache[0].as_ref().unwrap() {
            edges.push((entry, *first));
        }
        for (from, to) in edges {
            graph.add_edge(index_of[&from], index_of[&to], ());
        }

        let mut postorder = DfsPostOrder::new(&graph, entry_idx);
        let mut pos = 0usize;
        while let Some(idx) = postorder.next(&graph) {
            self.insts[graph[idx].0 as usize].priority = pos + 1;
            pos += 1;
        }
        self.insts[entry.0 as usize].priority = usize::MAX;
    }

    /// Nodes with no predecessor at all would never be scheduled; give them
    /// a top-level edge from the entry.
    fn connect_roots(&mut self, func_id: FuncId, entry: DuId) {
        let roots: Vec<DuId> = self
            .insts
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.func == func_id
                    && !n.is_entry()
                    && n.top_preds.is_empty()
                    && n.mem_preds.is_empty()
            })
            .map(|(i, _)| DuId(i as u32))
            .collect();
        for root in roots {
            self.add_top_edge(entry, root);
        }
    }
}

/// The first def-use nodes reachable from the start of `block`, skipping
/// node-free blocks transitively.
fn first_du_nodes(
    block: usize,
    block_nodes: &[Vec<DuId>],
    block_succs: &[Vec<usize>],
    cache: &mut Vec<Option<Vec<DuId>>>,
) -> Vec<DuId> {
    if let Some(cached) = &cache[block] {
        return cached.clone();
    }
    cache[block] = Some(Vec::new());
    let result = if let Some(first) = block_nodes[block].first() {
        vec![*first]
    } else {
        let mut acc = Vec::new();
        for succ in &block_succs[block] {
            for node in first_du_nodes(*succ, block_nodes, block_succs, cache) {
                if !acc.contains(&node) {
                    acc.push(node);
                }
            }
        }
        acc
    };
    cache[block] = Some(result.clone());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::memory::MemoryManager;
    use crate::analysis::pointer::semi_sparse::SemiSparseProgram;
    use crate::analysis::pointer::SemiSparsePointerAnalysis;
    use crate::annotation::ExternalPointerTable;
    use crate::context::policies::ContextPolicy;
    use crate::intermediate_representation::builder::ModuleBuilder;
    use crate::AnalysisConfig;

    fn analyze(module: &Module) -> (PointerAnalysisData, DefUseModule) {
        let (program, type_map) = SemiSparseProgram::build(module);
        let mem_mgr = MemoryManager::new(type_map);
        let config = AnalysisConfig::new(ContextPolicy::UniformKLimit { k: 1 });
        let ptr_table = ExternalPointerTable::new();
        let mut pa =
            SemiSparsePointerAnalysis::run(module, &program, mem_mgr, &config, &ptr_table)
                .unwrap();
        let modref_table = ExternalModRefTable::new();
        let mut logs = Vec::new();
        let du = DefUseModule::build(module, &mut pa, &modref_table, &mut logs).unwrap();
        (pa, du)
    }

    #[test]
    fn store_load_memory_edge() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(slot, zero);
        let loaded = b.load(i32_ty, slot);
        b.ret(Some(loaded));
        b.end_function(main);
        let module = b.finish();

        let (pa, du) = analyze(&module);
        let store_site = InstRef {
            func: main,
            block: BlockId(0),
            index: 1,
        };
        let load_site = InstRef {
            func: main,
            block: BlockId(0),
            index: 2,
        };
        let store_node = du.node_of(store_site).unwrap();
        let load_node = du.node_of(load_site).unwrap();

        // The store reaches the load through the stack object.
        let slot_set = pa.pts_of_value(crate::context::CtxId::GLOBAL, slot, &module);
        let slot_obj = pa.pts.elements(slot_set)[0];
        assert_eq!(du.node(store_node).mem_succs_of(slot_obj), &[load_node]);
        assert!(du.node(load_node).mem_preds.contains_key(&slot_obj));
    }

    #[test]
    fn entry_defines_parameters() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let callee = b.begin_function("callee", &[i32_ty], i32_ty);
        let arg = b.param(callee, 0);
        let doubled = b.compute(i32_ty, &[arg, arg]);
        b.ret(Some(doubled));
        b.end_function(callee);
        let main = b.begin_function("main", &[], i32_ty);
        let one = b.const_int(1);
        let callee_val = b.function_value(callee);
        let result = b.call(Some(i32_ty), callee_val, &[one]).unwrap();
        b.ret(Some(result));
        b.end_function(main);
        let module = b.finish();

        let (_, du) = analyze(&module);
        let entry = du.function(callee).unwrap().entry;
        let compute_node = du
            .node_of(InstRef {
                func: callee,
                block: BlockId(0),
                index: 0,
            })
            .unwrap();
        assert!(du.node(entry).top_succs.contains(&compute_node));
    }

    #[test]
    fn priorities_schedule_entry_first() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(slot, zero);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let (_, du) = analyze(&module);
        let f = du.function(main).unwrap();
        assert_eq!(du.node(f.entry).priority, usize::MAX);
        // Earlier instructions get higher priorities.
        let alloca = du
            .node_of(InstRef {
                func: main,
                block: BlockId(0),
                index: 0,
            })
            .unwrap();
        let ret = du
            .node_of(InstRef {
                func: main,
                block: BlockId(0),
                index: 2,
            })
            .unwrap();
        assert!(du.node(alloca).priority > du.node(ret).priority);
    }
}

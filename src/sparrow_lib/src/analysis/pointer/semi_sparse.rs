//! The semi-sparse program representation.
//!
//! The IR is lowered once into a reduced control-flow graph that only retains
//! the memory-affecting instructions: allocations, pointer copies, offset
//! computations, loads, stores, calls, returns and one entry node per
//! function. Every node carries explicit operand lists, so the transfer
//! functions never inspect IR operand structure during the fixpoint.
//!
//! Top-level (SSA) information propagates sparsely along def-use successor
//! edges; store information propagates densely along the reduced CFG
//! successor edges. This split is what makes the analysis semi-sparse.

use super::super::ProgramPoint;
use crate::analysis::memory::TypeMap;
use crate::intermediate_representation::{
    BlockId, FuncId, GepOffset, InstKind, InstRef, Module, TypeId, ValueId,
};
use fnv::FnvHashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;

/// Index of a node in the [`SemiSparseProgram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// A program point of the pointer engine.
pub type SsProgramPoint = ProgramPoint<NodeId>;

/// How an offset node moves its pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    /// A constant byte offset.
    Byte(u64),
    /// An unknown array index; the result points to the representative
    /// element of the array region.
    UnknownIndex,
}

/// The kinds of semi-sparse nodes.
#[derive(Debug, Clone)]
pub enum SsNodeKind {
    /// Function entry; evaluated before any instruction of the function.
    Entry { func: FuncId },
    /// Stack allocation.
    Alloc { dest: ValueId, ty: TypeId },
    /// Pointer copy (phi, select, casts, pointer-valued arithmetic). The
    /// source list is unfiltered; non-pointer operands are skipped during
    /// evaluation, and a copy without any pointer-typed source is treated as
    /// an opaque pointer producer.
    Copy { dest: ValueId, srcs: Vec<ValueId> },
    /// Pointer offset computation.
    Offset {
        dest: ValueId,
        base: ValueId,
        offset: OffsetKind,
    },
    Load {
        dest: ValueId,
        address: ValueId,
    },
    Store {
        address: ValueId,
        value: ValueId,
    },
    Call {
        dest: Option<ValueId>,
        callee: ValueId,
        args: Vec<ValueId>,
    },
    Return { value: Option<ValueId> },
}

/// One node of the reduced program.
#[derive(Debug, Clone)]
pub struct SsNode {
    pub func: FuncId,
    pub kind: SsNodeKind,
    /// The IR instruction the node wraps; `None` for entry nodes.
    pub inst: Option<InstRef>,
    /// Scheduling priority: reverse post order, entries largest.
    pub priority: usize,
    /// Def-use successors: nodes using a value this node defines.
    pub top_succs: Vec<NodeId>,
    /// Reduced-CFG successors: where store state flows next.
    pub mem_succs: Vec<NodeId>,
}

impl SsNode {
    /// The SSA operands the node reads.
    pub fn operands(&self) -> Vec<ValueId> {
        match &self.kind {
            SsNodeKind::Entry { .. } | SsNodeKind::Alloc { .. } => Vec::new(),
            SsNodeKind::Copy { srcs, .. } => srcs.clone(),
            SsNodeKind::Offset { base, .. } => vec![*base],
            SsNodeKind::Load { address, .. } => vec![*address],
            SsNodeKind::Store { address, value } => vec![*address, *value],
            SsNodeKind::Call { callee, args, .. } => {
                let mut ops = vec![*callee];
                ops.extend_from_slice(args);
                ops
            }
            SsNodeKind::Return { value } => value.iter().copied().collect(),
        }
    }

    /// The SSA value the node defines, if any.
    pub fn defined_value(&self) -> Option<ValueId> {
        match &self.kind {
            SsNodeKind::Alloc { dest, .. }
            | SsNodeKind::Copy { dest, .. }
            | SsNodeKind::Offset { dest, .. }
            | SsNodeKind::Load { dest, .. } => Some(*dest),
            SsNodeKind::Call { dest, .. } => *dest,
            SsNodeKind::Entry { .. } | SsNodeKind::Store { .. } | SsNodeKind::Return { .. } => None,
        }
    }
}

/// The lowered module.
pub struct SemiSparseProgram {
    nodes: Vec<SsNode>,
    entries: FnvHashMap<FuncId, NodeId>,
    node_of_inst: FnvHashMap<InstRef, NodeId>,
    entry_func: Option<FuncId>,
}

impl SemiSparseProgram {
    pub fn node(&self, id: NodeId) -> &SsNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &SsNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    /// The entry node of a defined function.
    pub fn entry(&self, func: FuncId) -> Option<NodeId> {
        self.entries.get(&func).copied()
    }

    /// The node wrapping the given instruction, if it was retained.
    pub fn node_of(&self, inst: InstRef) -> Option<NodeId> {
        self.node_of_inst.get(&inst).copied()
    }

    /// The program entry function (`main`).
    pub fn entry_function(&self) -> Option<FuncId> {
        self.entry_func
    }

    /// Lower a module. Also computes the type map the memory model uses.
    pub fn build(module: &Module) -> (SemiSparseProgram, TypeMap) {
        let mut program = SemiSparseProgram {
            nodes: Vec::new(),
            entries: FnvHashMap::default(),
            node_of_inst: FnvHashMap::default(),
            entry_func: module.entry_function(),
        };
        for (fidx, func) in module.functions.iter().enumerate() {
            if func.is_declaration() {
                continue;
            }
            program.lower_function(module, FuncId(fidx as u32));
        }
        program.link_top_level(module);
        (program, TypeMap::build(&module.types))
    }

    fn push_node(&mut self, func: FuncId, inst: Option<InstRef>, kind: SsNodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(SsNode {
            func,
            kind,
            inst,
            priority: 0,
            top_succs: Vec::new(),
            mem_succs: Vec::new(),
        });
        if let Some(site) = inst {
            self.node_of_inst.insert(site, id);
        }
        id
    }

    fn lower_function(&mut self, module: &Module, func_id: FuncId) {
        let func = module.func(func_id);
        let entry = self.push_node(func_id, None, SsNodeKind::Entry { func: func_id });
        self.entries.insert(func_id, entry);

        // Retained nodes per block, in instruction order.
        let mut block_nodes: Vec<Vec<NodeId>> = vec![Vec::new(); func.blocks.len()];
        for (bidx, block) in func.blocks.iter().enumerate() {
            for (iidx, inst) in block.insts.iter().enumerate() {
                let site = InstRef {
                    func: func_id,
                    block: BlockId(bidx as u32),
                    index: iidx as u32,
                };
                let kind = match &inst.kind {
                    InstKind::Alloca { ty } => Some(SsNodeKind::Alloc {
                        dest: inst.result.unwrap(),
                        ty: *ty,
                    }),
                    InstKind::Compute { operands } => {
                        inst.result
                            .filter(|r| module.is_pointer_value(*r))
                            .map(|dest| SsNodeKind::Copy {
                                dest,
                                srcs: operands.clone(),
                            })
                    }
                    InstKind::Phi { incoming } => inst
                        .result
                        .filter(|r| module.is_pointer_value(*r))
                        .map(|dest| SsNodeKind::Copy {
                            dest,
                            srcs: incoming.clone(),
                        }),
                    InstKind::Select {
                        true_value,
                        false_value,
                        ..
                    } => inst
                        .result
                        .filter(|r| module.is_pointer_value(*r))
                        .map(|dest| SsNodeKind::Copy {
                            dest,
                            srcs: vec![*true_value, *false_value],
                        }),
                    InstKind::Gep { base, offset } => Some(SsNodeKind::Offset {
                        dest: inst.result.unwrap(),
                        base: *base,
                        offset: match offset {
                            GepOffset::Constant(bytes) => OffsetKind::Byte(*bytes),
                            GepOffset::ArrayIndex { .. } => OffsetKind::UnknownIndex,
                        },
                    }),
                    InstKind::Load { address } => Some(SsNodeKind::Load {
                        dest: inst.result.unwrap(),
                        address: *address,
                    }),
                    InstKind::Store { address, value } => Some(SsNodeKind::Store {
                        address: *address,
                        value: *value,
                    }),
                    InstKind::Call { callee, args } => Some(SsNodeKind::Call {
                        dest: inst.result,
                        callee: *callee,
                        args: args.clone(),
                    }),
                    InstKind::Return { value } => Some(SsNodeKind::Return { value: *value }),
                    InstKind::Branch { .. } | InstKind::Unreachable => None,
                };
                if let Some(kind) = kind {
                    let id = self.push_node(func_id, Some(site), kind);
                    block_nodes[bidx].push(id);
                }
            }
        }

        // Successor blocks, read from the (possibly elided) terminators.
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

        // The first retained node reachable from the start of each block,
        // skipping over empty blocks.
        let mut first_cache: Vec<Option<Vec<NodeId>>> = vec![None; func.blocks.len()];
        for bidx in 0..func.blocks.len() {
            first_nodes(bidx, &block_nodes, &block_succs, &mut first_cache);
        }

        // Intra-block chains and cross-block edges of the reduced CFG.
        let mut cfg_edges: Vec<(NodeId, NodeId)> = Vec::new();
        for (bidx, nodes) in block_nodes.iter().enumerate() {
            for pair in nodes.windows(2) {
                cfg_edges.push((pair[0], pair[1]));
            }
            if let Some(last) = nodes.last() {
                for succ_block in &block_succs[bidx] {
                    for first in first_cache[*succ_block].as_ref().unwrap() {
                        cfg_edges.push((*last, *first));
                    }
                }
            }
        }
        for first in first_cache[0].as_ref().unwrap() {
            cfg_edges.push((entry, *first));
        }

        for (from, to) in &cfg_edges {
            let succs = &mut self.nodes[from.0 as usize].mem_succs;
            if !succs.contains(to) {
                succs.push(*to);
            }
        }

        self.assign_priorities(entry, &block_nodes, &cfg_edges);
    }

    /// Assign reverse-post-order priorities: the entry gets the maximum
    /// priority, nodes closer to the entry get higher priorities than their
    /// successors on acyclic paths.
    fn assign_priorities(
        &mut self,
        entry: NodeId,
        block_nodes: &[Vec<NodeId>],
        cfg_edges: &[(NodeId, NodeId)],
    ) {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index_of: FnvHashMap<NodeId, NodeIndex> = FnvHashMap::default();
        let mut add = |graph: &mut DiGraph<NodeId, ()>,
                       index_of: &mut FnvHashMap<NodeId, NodeIndex>,
                       node: NodeId| {
            *index_of
                .entry(node)
                .or_insert_with(|| graph.add_node(node))
        };
        let entry_idx = add(&mut graph, &mut index_of, entry);
        for nodes in block_nodes {
            for node in nodes {
                add(&mut graph, &mut index_of, *node);
            }
        }
        for (from, to) in cfg_edges {
            let from = index_of[from];
            let to = index_of[to];
            graph.add_edge(from, to, ());
        }

        // Post-order from the entry: a node's post-order index is its
        // priority, so predecessors get larger values than successors.
        let mut postorder = DfsPostOrder::new(&graph, entry_idx);
        let mut order = Vec::new();
        while let Some(idx) = postorder.next(&graph) {
            order.push(idx);
        }
        for (pos, idx) in order.iter().enumerate() {
            let node = graph[*idx];
            self.nodes[node.0 as usize].priority = pos + 1;
        }
        self.nodes[entry.0 as usize].priority = usize::MAX;
    }

    /// Wire the def-use (top-level) successor lists: a node defining a value
    /// is a predecessor of every node of the same function using it. The
    /// entry node acts as the definition of the function's parameters.
    fn link_top_level(&mut self, module: &Module) {
        let mut def_node: FnvHashMap<ValueId, NodeId> = FnvHashMap::default();
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(value) = node.defined_value() {
                def_node.insert(value, NodeId(id as u32));
            }
            if let SsNodeKind::Entry { func } = node.kind {
                for param in &module.func(func).params {
                    def_node.insert(*param, NodeId(id as u32));
                }
            }
        }
        for user_idx in 0..self.nodes.len() {
            let user = NodeId(user_idx as u32);
            let operands = self.nodes[user_idx].operands();
            for op in operands {
                if let Some(def) = def_node.get(&op).copied() {
                    if self.nodes[def.0 as usize].func == self.nodes[user_idx].func {
                        let succs = &mut self.nodes[def.0 as usize].top_succs;
                        if !succs.contains(&user) {
                            succs.push(user);
                        }
                    }
                }
            }
        }
    }
}

/// The first retained nodes reachable from the start of `block`, skipping
/// empty blocks transitively. Cycles of empty blocks contribute nothing.
fn first_nodes(
    block: usize,
    block_nodes: &[Vec<NodeId>],
    block_succs: &[Vec<usize>],
    cache: &mut Vec<Option<Vec<NodeId>>>,
) -> Vec<NodeId> {
    if let Some(cached) = &cache[block] {
        return cached.clone();
    }
    // Mark as in-progress to cut cycles.
    cache[block] = Some(Vec::new());
    let result = if let Some(first) = block_nodes[block].first() {
        vec![*first]
    } else {
        let mut acc = Vec::new();
        for succ in &block_succs[block] {
            for node in first_nodes(*succ, block_nodes, block_succs, cache) {
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
    use crate::intermediate_representation::builder::ModuleBuilder;

    #[test]
    fn lowering_retains_memory_nodes_only() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let one = b.const_int(1);
        let two = b.const_int(2);
        // Non-pointer arithmetic is elided.
        let sum = b.compute(i32_ty, &[one, two]);
        b.store(slot, sum);
        let loaded = b.load(i32_ty, slot);
        b.ret(Some(loaded));
        b.end_function(main);
        let module = b.finish();

        let (program, _) = SemiSparseProgram::build(&module);
        // Entry + alloca + store + load + return.
        assert_eq!(program.node_count(), 5);
        let entry = program.entry(main).unwrap();
        assert_eq!(program.node(entry).priority, usize::MAX);
    }

    #[test]
    fn priorities_run_top_down() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let a = b.alloca(i32_ty);
        let c = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(a, zero);
        b.store(c, zero);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let (program, _) = SemiSparseProgram::build(&module);
        let entry = program.entry(main).unwrap();
        // Following the CFG chain, priorities strictly decrease.
        let mut cur = entry;
        let mut last_priority = usize::MAX;
        loop {
            let node = program.node(cur);
            assert!(node.priority <= last_priority);
            last_priority = node.priority;
            match node.mem_succs.first() {
                Some(next) => cur = *next,
                None => break,
            }
        }
    }

    #[test]
    fn top_level_edges_follow_ssa_uses() {
        let mut b = ModuleBuilder::new("m");
        let i8_ty = b.int_type(8);
        let ptr_ty = b.pointer_type(i8_ty);
        let main = b.begin_function("main", &[], i8_ty);
        let slot = b.alloca(ptr_ty);
        let inner = b.alloca(i8_ty);
        b.store(slot, inner);
        let loaded = b.load(ptr_ty, slot);
        let copy = b.compute(ptr_ty, &[loaded]);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();
        let _ = copy;

        let (program, _) = SemiSparseProgram::build(&module);
        // The alloca defining `slot` feeds both the store and the load.
        let slot_def = program
            .iter()
            .find(|(_, n)| n.defined_value() == Some(slot))
            .unwrap()
            .0;
        let succs = &program.node(slot_def).top_succs;
        assert_eq!(succs.len(), 2);
        // The load feeds the pointer copy.
        let load_def = program
            .iter()
            .find(|(_, n)| n.defined_value() == Some(loaded))
            .unwrap()
            .0;
        assert_eq!(program.node(load_def).top_succs.len(), 1);
    }

    #[test]
    fn empty_blocks_are_skipped_in_the_reduced_cfg() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let main = b.begin_function("main", &[], i32_ty);
        let middle = b.block();
        let exit = b.block();
        let slot = b.alloca(i32_ty);
        b.br(middle);
        b.switch_to(middle);
        // Only a branch: this block contributes no retained node.
        b.br(exit);
        b.switch_to(exit);
        let zero = b.const_int(0);
        b.store(slot, zero);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let (program, _) = SemiSparseProgram::build(&module);
        let alloc = program
            .iter()
            .find(|(_, n)| matches!(n.kind, SsNodeKind::Alloc { .. }))
            .unwrap()
            .0;
        // The alloc's CFG successor is the store in the exit block.
        let succ = program.node(alloc).mem_succs[0];
        assert!(matches!(program.node(succ).kind, SsNodeKind::Store { .. }));
    }
}

//! The semi-sparse, flow- and context-sensitive pointer analysis.
//!
//! [`SemiSparsePointerAnalysis::run`] drives the whole computation: the
//! global prepass seeds the environment with globals and function addresses,
//! then the work-list engine (see [`engine`]) evaluates the transfer function
//! until the points-to solution stabilizes. The result is a
//! [`PointerAnalysisData`] that owns every interning table created during the
//! run; later analyses query it through the [`queries::PointerAnalysisQueries`]
//! capability.

use crate::annotation::ExternalPointerTable;
use crate::context::{ContextManager, CtxId};
use crate::intermediate_representation::{FuncId, Module, ValueId, ValueKind};
use crate::utils::log::LogMessage;
use crate::AnalysisConfig;

pub mod engine;
pub mod external;
pub mod global_analysis;
pub mod pointer_manager;
pub mod pts_set;
pub mod queries;
pub mod semi_sparse;
pub mod state;
pub mod strategies;

use super::memory::MemoryManager;
use super::CallGraph;
use pointer_manager::PointerManager;
use pts_set::{PtsSetId, PtsSetPool};
use semi_sparse::{SemiSparseProgram, SsProgramPoint};
use state::{Env, Memo};

/// The complete result of a pointer analysis run.
///
/// Owns all interning tables (contexts, pointers, memory objects, points-to
/// sets); references into them stay valid until the data is dropped.
pub struct PointerAnalysisData {
    pub env: Env,
    pub memo: Memo,
    pub call_graph: CallGraph<SsProgramPoint>,
    pub ctx_mgr: ContextManager,
    pub ptr_mgr: PointerManager,
    pub mem_mgr: MemoryManager,
    pub pts: PtsSetPool,
    pub logs: Vec<LogMessage>,
    /// Premade singleton set of the null object.
    pub null_set: PtsSetId,
    /// Premade singleton set of the universal object.
    pub universal_set: PtsSetId,
}

impl PointerAnalysisData {
    /// The points-to set of a value at a context, without creating new
    /// pointers. Constants resolve to their canonical sets; values that were
    /// never observed at the context resolve to the empty set.
    pub fn pts_of_value(&self, ctx: CtxId, value: ValueId, module: &Module) -> PtsSetId {
        match &module.value(value).kind {
            ValueKind::ConstantNull => self.null_set,
            ValueKind::Undef => self.universal_set,
            ValueKind::ConstantInt(_) => PtsSetId::EMPTY,
            _ => match self.ptr_mgr.get(ctx, value, module) {
                Some(ptr) => self.env.lookup(ptr),
                None => PtsSetId::EMPTY,
            },
        }
    }

    /// The union of the points-to sets of a value over all contexts it has
    /// been observed in.
    pub fn pts_of_value_all_contexts(&mut self, value: ValueId, module: &Module) -> PtsSetId {
        match &module.value(value).kind {
            ValueKind::ConstantNull => return self.null_set,
            ValueKind::Undef => return self.universal_set,
            _ => (),
        }
        let sets: Vec<PtsSetId> = self
            .ptr_mgr
            .pointers_with_value(value)
            .iter()
            .map(|ptr| self.env.lookup(*ptr))
            .collect();
        self.pts.merge_all(&sets)
    }

    /// The functions a call through `callee_value` may reach at the given
    /// context: the direct callee for direct calls, the function objects of
    /// the callee's points-to set for indirect ones.
    pub fn callees_of_call(
        &self,
        ctx: CtxId,
        callee_value: ValueId,
        module: &Module,
    ) -> Vec<FuncId> {
        if let ValueKind::Function(f) = &module.value(callee_value).kind {
            return vec![*f];
        }
        let set = self.pts_of_value(ctx, callee_value, module);
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

    /// Like [`PointerAnalysisData::callees_of_call`], unioned over all
    /// contexts.
    pub fn callees_of_call_all_contexts(&mut self, callee_value: ValueId, module: &Module) -> Vec<FuncId> {
        if let ValueKind::Function(f) = &module.value(callee_value).kind {
            return vec![*f];
        }
        let set = self.pts_of_value_all_contexts(callee_value, module);
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
}

/// The driver for the semi-sparse pointer analysis.
pub struct SemiSparsePointerAnalysis;

impl SemiSparsePointerAnalysis {
    /// Run the analysis on a lowered program.
    pub fn run(
        module: &Module,
        program: &SemiSparseProgram,
        mem_mgr: MemoryManager,
        config: &AnalysisConfig,
        ext_table: &ExternalPointerTable,
    ) -> anyhow::Result<PointerAnalysisData> {
        engine::PointerEngine::new(module, program, mem_mgr, config, ext_table).run()
    }
}

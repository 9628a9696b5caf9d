//! The capability the rest of the system uses to consume a points-to
//! solution.
//!
//! The taint analysis, the def-use builder and the introspective
//! context-sensitivity strategy never depend on the concrete pointer
//! analysis; they only need the two queries of this trait. Alternative
//! oracles (e.g. a faster unification-based analysis used as a pre-analysis)
//! implement the same trait.

use super::pts_set::PtsSetId;
use super::PointerAnalysisData;
use crate::context::CtxId;
use crate::intermediate_representation::{FuncId, Module, ValueId};

/// Read access to a points-to solution.
pub trait PointerAnalysisQueries {
    /// The points-to set of a value at a context.
    fn get_pts_set(&self, ctx: CtxId, value: ValueId, module: &Module) -> PtsSetId;

    /// The callees a call through `callee_value` may reach at a context.
    fn get_callees(&self, ctx: CtxId, callee_value: ValueId, module: &Module) -> Vec<FuncId>;
}

impl PointerAnalysisQueries for PointerAnalysisData {
    fn get_pts_set(&self, ctx: CtxId, value: ValueId, module: &Module) -> PtsSetId {
        self.pts_of_value(ctx, value, module)
    }

    fn get_callees(&self, ctx: CtxId, callee_value: ValueId, module: &Module) -> Vec<FuncId> {
        self.callees_of_call(ctx, callee_value, module)
    }
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

    #[test]
    fn data_implements_the_capability() {
        let mut b = ModuleBuilder::new("m");
        let i8_ty = b.int_type(8);
        let ptr_ty = b.pointer_type(i8_ty);
        let i32_ty = b.int_type(32);
        let id = b.begin_function("id", &[ptr_ty], ptr_ty);
        let x = b.param(id, 0);
        b.ret(Some(x));
        b.end_function(id);
        let g = b.add_global("g", i8_ty);
        let main = b.begin_function("main", &[], i32_ty);
        let id_val = b.function_value(id);
        let g_val = b.global_value(g);
        let r = b.call(Some(ptr_ty), id_val, &[g_val]).unwrap();
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let (program, type_map) = SemiSparseProgram::build(&module);
        let config = AnalysisConfig::new(ContextPolicy::UniformKLimit { k: 1 });
        let table = ExternalPointerTable::new();
        let data = SemiSparsePointerAnalysis::run(
            &module,
            &program,
            MemoryManager::new(type_map),
            &config,
            &table,
        )
        .unwrap();

        // Everything downstream only sees the capability.
        let oracle: &dyn PointerAnalysisQueries = &data;
        let set = oracle.get_pts_set(CtxId::GLOBAL, r, &module);
        assert_eq!(data.pts.len(set), 1);
        assert_eq!(oracle.get_callees(CtxId::GLOBAL, id_val, &module), vec![id]);
    }
}

/*!
# sparrow_lib

A whole-program, context-sensitive pointer and taint analysis for a typed SSA
intermediate representation.

The analysis pipeline is:

1. The IR module is loaded (see [`pipeline`]) and lowered into a
   [semi-sparse program](analysis::pointer::semi_sparse), a reduced CFG that
   only retains memory-affecting nodes.
2. The [pointer analysis](analysis::pointer) computes, for every program
   point, the set of abstract memory objects each pointer may refer to. The
   calling-context abstraction is pluggable (see [`context`]).
3. The [def-use module](analysis::def_use) turns the CFG into a sparse
   dataflow skeleton, using the points-to solution together with a
   [mod-ref](analysis::mod_ref) and a
   [reaching-definition](analysis::reaching_def) analysis.
4. The [taint analysis](analysis::taint) runs over the def-use module,
   classifies every value into a four-point lattice, records every annotated
   sink call site, and checks the recorded sinks after its fixpoint completes.
5. For violations caused by merged calling contexts, the
   [precision-loss tracker](analysis::taint::precision) walks the def-use
   graph backwards to the call sites whose context limit is too coarse.

External library behavior is described by three annotation tables (see
[`annotation`]): pointer effects, mod-ref effects, and taint effects.
*/

pub mod analysis;
pub mod annotation;
pub mod context;
pub mod intermediate_representation;
pub mod pipeline;
pub mod utils;

mod prelude {
    pub use serde::{Deserialize, Serialize};

    pub use crate::intermediate_representation::{
        FuncId, GlobalId, InstRef, Module, TypeId, ValueId,
    };
    pub use anyhow::{anyhow, bail, Context as _, Error, Result};
}

use crate::context::policies::ContextPolicy;

/// Analysis-wide configuration.
///
/// The configuration is carried explicitly by every analyzer instance; there
/// is no process-global analysis state, so tests may run several analyzers
/// with different configurations in the same process.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// The calling-context abstraction used by both the pointer and the taint
    /// analysis. The library bakes in no default policy; the driver chooses.
    pub policy: ContextPolicy,
    /// If set, pointers to global values are collapsed to the global context
    /// regardless of the context they are observed in.
    pub collapse_global_contexts: bool,
    /// Optional upper bound on the number of transfer-function evaluations of
    /// a single fixpoint run. Exceeding the bound aborts the analysis with an
    /// error; with a `None` bound the engines rely on lattice monotonicity
    /// for termination.
    pub iteration_budget: Option<u64>,
}

impl AnalysisConfig {
    /// Create a configuration with the given context policy and the default
    /// settings for everything else.
    pub fn new(policy: ContextPolicy) -> Self {
        AnalysisConfig {
            policy,
            collapse_global_contexts: true,
            iteration_budget: None,
        }
    }
}

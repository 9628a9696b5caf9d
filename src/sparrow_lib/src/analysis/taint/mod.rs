//! The context-sensitive taint analysis.
//!
//! Consumes the points-to solution and the def-use module, classifies every
//! value into the four-point [lattice](lattice), and checks every annotated
//! sink call site after the fixpoint completes. The
//! [`TrackingTaintAnalysis`] variant additionally runs the
//! [precision-loss tracker](precision) on violations caused by merged
//! contexts.

use super::def_use::{DefUseModule, TaintProgramPoint};
use super::pointer::PointerAnalysisData;
use super::CallGraph;
use crate::annotation::ExternalTaintTable;
use crate::intermediate_representation::Module;
use crate::prelude::*;
use crate::utils::log::LogMessage;
use crate::AnalysisConfig;

pub mod engine;
pub mod external;
pub mod lattice;
pub mod precision;
pub mod sink;
pub mod state;

pub use lattice::TaintLattice;
pub use sink::{SinkSignature, SinkViolation};
pub use state::{TaintEnv, TaintMemo, TaintStore};

/// The complete result of a taint analysis run.
pub struct TaintAnalysisResult {
    pub env: TaintEnv,
    pub memo: TaintMemo,
    pub call_graph: CallGraph<TaintProgramPoint>,
    /// All recorded sink call sites, in recording order.
    pub sinks: Vec<SinkSignature>,
    /// All detected violations, in recording order.
    pub violations: Vec<SinkViolation>,
    pub logs: Vec<LogMessage>,
}

impl TaintAnalysisResult {
    /// Whether the program is sink-clean under the analyzed policy.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// The plain taint analysis driver.
pub struct TaintAnalysis;

impl TaintAnalysis {
    /// Run the taint fixpoint and the sink checker.
    pub fn run(
        module: &Module,
        du: &DefUseModule,
        pa: &mut PointerAnalysisData,
        table: &ExternalTaintTable,
        config: &AnalysisConfig,
    ) -> Result<TaintAnalysisResult> {
        let mut engine = engine::TaintEngine::new(module, du, pa, table, config);
        engine.run()?;

        let engine::TaintEngine {
            env,
            memo,
            call_graph,
            sinks,
            mut logs,
            pa,
            ..
        } = engine;

        let violations =
            sink::check_sink_violations(module, du, pa, &env, &memo, table, &sinks, &mut logs);

        Ok(TaintAnalysisResult {
            env,
            memo,
            call_graph,
            sinks,
            violations,
            logs,
        })
    }
}

/// The taint analysis variant that also tracks where precision was lost.
pub struct TrackingTaintAnalysis;

impl TrackingTaintAnalysis {
    /// Run the taint analysis, then walk backwards from every `Either`
    /// violation to the call sites that demand more context precision.
    pub fn run(
        module: &Module,
        du: &DefUseModule,
        pa: &mut PointerAnalysisData,
        table: &ExternalTaintTable,
        config: &AnalysisConfig,
    ) -> Result<(TaintAnalysisResult, Vec<TaintProgramPoint>)> {
        let result = TaintAnalysis::run(module, du, pa, table, config)?;
        let tracker = precision::PrecisionLossTracker::new(
            module,
            du,
            pa,
            &result.env,
            &result.memo,
            &result.call_graph,
        );
        let demanders = tracker.track_imprecision(&result.violations);
        Ok((result, demanders))
    }
}

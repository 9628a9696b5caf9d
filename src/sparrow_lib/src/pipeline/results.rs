//! Assembling and reporting analysis results.

use crate::analysis::def_use::{DefUseModule, TaintProgramPoint};
use crate::analysis::memory::MemoryManager;
use crate::analysis::pointer::semi_sparse::SemiSparseProgram;
use crate::analysis::pointer::{PointerAnalysisData, SemiSparsePointerAnalysis};
use crate::analysis::taint::{sink, TaintAnalysisResult, TrackingTaintAnalysis};
use crate::annotation::{ExternalModRefTable, ExternalPointerTable, ExternalTaintTable};
use crate::context::policies::ContextPolicy;
use crate::intermediate_representation::Module;
use crate::prelude::*;
use crate::utils::log::LogMessage;
use crate::AnalysisConfig;
use itertools::Itertools;
use std::fmt::Write as _;

/// Everything a full pipeline run produces.
pub struct AnalysisResults {
    pub module: Module,
    pub pointer: PointerAnalysisData,
    pub def_use: Option<DefUseModule>,
    pub taint: Option<TaintAnalysisResult>,
    /// Program points that demand more context precision, if tracking ran.
    pub imprecision_sources: Option<Vec<TaintProgramPoint>>,
    pub logs: Vec<LogMessage>,
}

impl AnalysisResults {
    /// Run the pointer analysis only.
    pub fn compute_pointer_analysis(
        module: Module,
        config: &AnalysisConfig,
        ptr_table: &ExternalPointerTable,
    ) -> Result<AnalysisResults> {
        let (program, type_map) = SemiSparseProgram::build(&module);
        let mem_mgr = MemoryManager::new(type_map);
        let mut pointer =
            SemiSparsePointerAnalysis::run(&module, &program, mem_mgr, config, ptr_table)?;
        let logs = std::mem::take(&mut pointer.logs);
        Ok(AnalysisResults {
            module,
            pointer,
            def_use: None,
            taint: None,
            imprecision_sources: None,
            logs,
        })
    }

    /// Run the whole pipeline: pointer analysis, def-use construction, taint
    /// analysis with sink checking and precision tracking.
    pub fn compute_all(
        module: Module,
        config: &AnalysisConfig,
        ptr_table: &ExternalPointerTable,
        modref_table: &ExternalModRefTable,
        taint_table: &ExternalTaintTable,
    ) -> Result<AnalysisResults> {
        let mut results = Self::compute_pointer_analysis(module, config, ptr_table)?;
        let mut logs = std::mem::take(&mut results.logs);

        let du = DefUseModule::build(&results.module, &mut results.pointer, modref_table, &mut logs)?;
        let (taint, imprecision) = TrackingTaintAnalysis::run(
            &results.module,
            &du,
            &mut results.pointer,
            taint_table,
            config,
        )?;
        logs.extend(taint.logs.iter().cloned());

        results.def_use = Some(du);
        results.taint = Some(taint);
        results.imprecision_sources = Some(imprecision);
        results.logs = logs;
        Ok(results)
    }

    /// The plain-text violation report, in a stable order.
    pub fn violation_report(&self) -> String {
        let mut out = String::new();
        let (Some(taint), Some(du)) = (&self.taint, &self.def_use) else {
            return out;
        };
        if taint.violations.is_empty() {
            let _ = writeln!(out, "No sink violation found.");
            return out;
        }
        for violation in &taint.violations {
            let _ = writeln!(
                out,
                "{}",
                sink::format_violation(&self.module, du, &self.pointer, violation)
            );
        }
        if let Some(sources) = &self.imprecision_sources {
            for pp in sources {
                let site = du
                    .node(pp.node)
                    .inst()
                    .map(|s| self.module.display_site(s))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "precision loss introduced at {} {}",
                    self.pointer.ctx_mgr.display(pp.ctx),
                    site
                );
            }
        }
        out
    }

    /// The violation report as JSON.
    pub fn violation_json(&self) -> serde_json::Value {
        let Some(taint) = &self.taint else {
            return serde_json::json!([]);
        };
        let du = self.def_use.as_ref();
        let violations: Vec<serde_json::Value> = taint
            .violations
            .iter()
            .map(|v| {
                let site = du
                    .and_then(|du| du.node(v.pp.node).inst())
                    .map(|s| self.module.display_site(s))
                    .unwrap_or_default();
                serde_json::json!({
                    "site": site,
                    "context": format!("{}", self.pointer.ctx_mgr.display(v.pp.ctx)),
                    "callee": self.module.func(v.callee).name,
                    "argument": v.arg_pos,
                    "class": format!("{}", v.class),
                    "expected": format!("{}", v.expected),
                    "actual": format!("{}", v.actual),
                })
            })
            .collect();
        serde_json::json!(violations)
    }

    /// Dump the top-level points-to environment, grouped by value and
    /// context, in a stable order.
    pub fn dump_pts(&self) -> String {
        let mut out = String::new();
        let entries: Vec<_> = self
            .pointer
            .ptr_mgr
            .iter()
            .map(|(id, ptr)| (ptr.value, ptr.ctx, self.pointer.env.lookup(id)))
            .filter(|(_, _, set)| !set.is_empty())
            .sorted()
            .collect();
        for (value, ctx, set) in entries {
            let objs = self
                .pointer
                .pts
                .elements(set)
                .iter()
                .map(|obj| self.pointer.mem_mgr.display_object(*obj, &self.module))
                .join(", ");
            let _ = writeln!(
                out,
                "{} @ {} -> {{ {objs} }}",
                self.module.display_value(value),
                self.pointer.ctx_mgr.display(ctx)
            );
        }
        out
    }

    /// Dump the context-depth distribution and policy description.
    pub fn dump_context_stats(&self, policy: &ContextPolicy) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "context policy: {}", policy.describe());
        let _ = writeln!(out, "contexts created: {}", self.pointer.ctx_mgr.len());
        for (depth, count) in self.pointer.ctx_mgr.depth_distribution() {
            let _ = writeln!(out, "  depth {depth}: {count} contexts");
        }
        if let ContextPolicy::SelectiveKcfa(selective) = policy {
            let _ = write!(out, "{}", selective.stats());
        }
        out
    }

    /// Dump the type layouts of the module.
    pub fn dump_types(&self) -> String {
        let mut out = String::new();
        let type_map = self.pointer.mem_mgr.type_map();
        for (id, ty) in self.module.types.iter() {
            let layout = type_map.layout(type_map.layout_of(id));
            let _ = writeln!(
                out,
                "type {:?}: size {}, pointer offsets {:?}, array ranges {}",
                ty,
                layout.size,
                layout.pointer_offsets.iter().collect::<Vec<_>>(),
                layout.array_ranges.len()
            );
        }
        out
    }
}

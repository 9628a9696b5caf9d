//! Checking recorded sinks after the taint fixpoint.
//!
//! During the fixpoint every call to an external function with a `SINK`
//! entry is recorded as a [`SinkSignature`]. Once the work list is empty,
//! the checker revisits each signature, computes the taint of every checked
//! argument under the entry's class using the memo at that program point,
//! and reports a violation for anything that is not below `Untainted` in the
//! lattice.

use super::super::def_use::{DefUseModule, TaintProgramPoint};
use super::super::pointer::PointerAnalysisData;
use super::lattice::{LatticeCompare, TaintLattice};
use super::state::{TaintEnv, TaintMemo};
use crate::annotation::taint::TaintEntry;
use crate::annotation::{ExternalTaintTable, TClass};
use crate::intermediate_representation::{FuncId, InstKind, Module};
use crate::utils::log::LogMessage;

/// A call site that must be checked against its sink annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSignature {
    pub pp: TaintProgramPoint,
    pub callee: FuncId,
}

/// One detected sink violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkViolation {
    pub pp: TaintProgramPoint,
    pub callee: FuncId,
    /// The argument index that violated the annotation.
    pub arg_pos: u8,
    /// The class the argument was checked under.
    pub class: TClass,
    /// The expected upper bound (always `Untainted`).
    pub expected: TaintLattice,
    /// The actual taint of the argument.
    pub actual: TaintLattice,
}

/// Check all recorded sinks. Violations are returned in recording order.
pub fn check_sink_violations(
    module: &Module,
    du: &DefUseModule,
    pa: &PointerAnalysisData,
    env: &TaintEnv,
    memo: &TaintMemo,
    table: &ExternalTaintTable,
    sinks: &[SinkSignature],
    logs: &mut Vec<LogMessage>,
) -> Vec<SinkViolation> {
    let mut violations = Vec::new();
    for sig in sinks {
        let name = &module.func(sig.callee).name;
        let Some(summary) = table.lookup(name) else {
            // Sinks are recorded from the table, so this cannot happen
            // unless the table changed between the fixpoint and the check.
            logs.push(
                LogMessage::new_error(format!("unrecognized sink function {name}"))
                    .source("taint"),
            );
            continue;
        };
        let site = du.node(sig.pp.node).inst().expect("sink at an entry node");
        let InstKind::Call { args, .. } = &module.inst(site).kind else {
            continue;
        };
        let store = memo.lookup(sig.pp);

        for entry in &summary.entries {
            let TaintEntry::Sink { pos, class } = entry else {
                continue;
            };
            for idx in pos.argument_indices(args.len()) {
                let arg = args[idx];
                let actual = match class {
                    TClass::ValueOnly => {
                        if module.is_constant_value(arg) {
                            TaintLattice::Untainted
                        } else {
                            env.lookup((sig.pp.ctx, arg))
                        }
                    }
                    TClass::DirectMemory => {
                        let set = pa.pts_of_value(sig.pp.ctx, arg, module);
                        let mut merged = TaintLattice::Unknown;
                        for obj in pa.pts.elements(set) {
                            if *obj == pa.mem_mgr.universal_object() {
                                merged = TaintLattice::Either;
                                break;
                            }
                            let value = store
                                .map(|s| s.lookup(*obj))
                                .unwrap_or(TaintLattice::Unknown);
                            merged = merged.merge(value);
                        }
                        merged
                    }
                    // Rejected at parse time.
                    TClass::ReachableMemory => TaintLattice::Unknown,
                };
                let cmp = TaintLattice::Untainted.compare(actual);
                if cmp != LatticeCompare::Equal && cmp != LatticeCompare::GreaterThan {
                    violations.push(SinkViolation {
                        pp: sig.pp,
                        callee: sig.callee,
                        arg_pos: idx as u8,
                        class: *class,
                        expected: TaintLattice::Untainted,
                        actual,
                    });
                }
            }
        }
    }
    violations
}

/// Render a violation for reports.
pub fn format_violation(
    module: &Module,
    du: &DefUseModule,
    pa: &PointerAnalysisData,
    violation: &SinkViolation,
) -> String {
    let site = du
        .node(violation.pp.node)
        .inst()
        .map(|s| module.display_site(s))
        .unwrap_or_default();
    format!(
        "sink violation at {} {}:: call to {}\n\targument: {}\n\texpected: {}\n\tactual:   {}",
        pa.ctx_mgr.display(violation.pp.ctx),
        site,
        module.func(violation.callee).name,
        violation.arg_pos,
        violation.expected,
        violation.actual
    )
}

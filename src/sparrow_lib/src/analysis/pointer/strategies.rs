//! Context-sensitivity strategies driven by a pre-analysis.
//!
//! The introspective strategy runs a cheap context-insensitive pointer
//! analysis first, measures how much points-to information accumulates
//! around every allocation and call site, and only refines the sites whose
//! metrics stay below the configured thresholds. Everything else gets k=0,
//! so the expensive context-sensitive run spends its budget where it can
//! still help. The output is an ordinary [`SelectiveKcfa`] configuration.

use super::semi_sparse::{SemiSparseProgram, SsNodeKind};
use super::PointerAnalysisData;
use crate::analysis::memory::AllocKind;
use crate::analysis::pointer::state::Store;
use crate::context::policies::SelectiveKcfa;
use crate::intermediate_representation::{FuncId, InstRef, Module};
use fnv::FnvHashMap;

/// The two introspective refinement heuristics.
#[derive(Debug, Clone, Copy)]
pub enum IntrospectiveHeuristic {
    /// Refine a site iff `pointed_by <= max_pointed_by`, `in_flow <=
    /// max_in_flow` and `max_field_pts <= max_field_pts_bound`.
    A {
        max_pointed_by: usize,
        max_in_flow: usize,
        max_field_pts_bound: usize,
    },
    /// Refine a site iff `pointed_by + in_flow <= max_volume` and
    /// `object_count * max_field_pts <= max_field_product`.
    B {
        max_volume: usize,
        max_field_product: usize,
    },
}

impl IntrospectiveHeuristic {
    /// The default thresholds of heuristic A.
    pub fn default_a() -> Self {
        IntrospectiveHeuristic::A {
            max_pointed_by: 50,
            max_in_flow: 100,
            max_field_pts_bound: 75,
        }
    }

    /// The default thresholds of heuristic B.
    pub fn default_b() -> Self {
        IntrospectiveHeuristic::B {
            max_volume: 200,
            max_field_product: 5000,
        }
    }

    fn refines(&self, m: &SiteMetrics) -> bool {
        match *self {
            IntrospectiveHeuristic::A {
                max_pointed_by,
                max_in_flow,
                max_field_pts_bound,
            } => {
                m.pointed_by <= max_pointed_by
                    && m.in_flow <= max_in_flow
                    && m.max_field_pts <= max_field_pts_bound
            }
            IntrospectiveHeuristic::B {
                max_volume,
                max_field_product,
            } => {
                m.pointed_by + m.in_flow <= max_volume
                    && m.object_count * m.max_field_pts <= max_field_product
            }
        }
    }
}

/// Accumulated points-to metrics of one allocation site.
#[derive(Debug, Clone, Copy, Default)]
struct SiteMetrics {
    /// Number of pointers whose points-to set contains an object of the site.
    pointed_by: usize,
    /// Total points-to volume stored into objects of the site.
    in_flow: usize,
    /// Largest points-to set stored in any single object of the site.
    max_field_pts: usize,
    /// Number of distinct objects of the site.
    object_count: usize,
}

/// Compute a selective-kCFA configuration from a context-insensitive
/// pre-analysis result.
///
/// Sites the heuristic refuses to refine get k=0; refined sites inherit
/// `refined_k`. Call sites are classified through their callees: a call site
/// is refined iff every callee's aggregated metrics pass the heuristic.
pub fn configure_introspective(
    module: &Module,
    program: &SemiSparseProgram,
    pre: &mut PointerAnalysisData,
    heuristic: IntrospectiveHeuristic,
    refined_k: u32,
) -> SelectiveKcfa {
    // Merge the per-point stores into one global view of the final solution.
    let mut global_store = Store::new();
    let memo_entries: Vec<_> = pre.memo.iter().map(|(pp, _)| pp).collect();
    for pp in memo_entries {
        let bindings: Vec<_> = pre
            .memo
            .lookup(pp)
            .map(|s| s.iter().collect())
            .unwrap_or_default();
        for (obj, set) in bindings {
            global_store.weak_update(obj, set, &mut pre.pts);
        }
    }

    // Per-allocation-site metrics.
    let mut metrics: FnvHashMap<InstRef, SiteMetrics> = FnvHashMap::default();
    let mut site_of_obj: FnvHashMap<crate::analysis::memory::MemObjId, InstRef> =
        FnvHashMap::default();
    for idx in 0..pre.mem_mgr.object_count() {
        let obj = crate::analysis::memory::MemObjId(idx as u32);
        let site = pre.mem_mgr.site(pre.mem_mgr.object(obj).site);
        let alloc_site = match site.kind {
            AllocKind::Stack { site, .. } => site,
            AllocKind::Heap { site } => site,
            _ => continue,
        };
        site_of_obj.insert(obj, alloc_site);
        let entry = metrics.entry(alloc_site).or_default();
        entry.object_count += 1;
        let stored = pre.pts.len(global_store.lookup(obj));
        entry.in_flow += stored;
        entry.max_field_pts = entry.max_field_pts.max(stored);
    }
    for (_, set) in pre.env.iter() {
        let mut seen: Vec<InstRef> = Vec::new();
        for obj in pre.pts.elements(set) {
            if let Some(site) = site_of_obj.get(obj) {
                if !seen.contains(site) {
                    seen.push(*site);
                }
            }
        }
        for site in seen {
            metrics.entry(site).or_default().pointed_by += 1;
        }
    }

    // Aggregate per function, for call-site classification.
    let mut func_metrics: FnvHashMap<FuncId, SiteMetrics> = FnvHashMap::default();
    for (site, m) in &metrics {
        let entry = func_metrics.entry(site.func).or_default();
        entry.pointed_by += m.pointed_by;
        entry.in_flow += m.in_flow;
        entry.max_field_pts = entry.max_field_pts.max(m.max_field_pts);
        entry.object_count += m.object_count;
    }

    let mut selective = SelectiveKcfa::new(refined_k);
    for (site, m) in &metrics {
        if !heuristic.refines(m) {
            selective.set_alloc_site_limit(*site, 0);
        }
    }
    for (node_id, node) in program.iter() {
        let SsNodeKind::Call { callee, .. } = &node.kind else {
            continue;
        };
        let site = program.node(node_id).inst.unwrap();
        let callees = pre.callees_of_call_all_contexts(*callee, module);
        let refined = callees.iter().all(|f| {
            func_metrics
                .get(f)
                .map(|m| heuristic.refines(m))
                .unwrap_or(true)
        });
        if !refined {
            selective.set_call_site_limit(site, 0);
        }
    }
    selective
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::memory::MemoryManager;
    use crate::analysis::pointer::SemiSparsePointerAnalysis;
    use crate::annotation::ExternalPointerTable;
    use crate::context::policies::ContextPolicy;
    use crate::intermediate_representation::builder::ModuleBuilder;
    use crate::intermediate_representation::BlockId;
    use crate::AnalysisConfig;

    #[test]
    fn introspective_configuration_from_pre_analysis() {
        let mut b = ModuleBuilder::new("intro");
        let i8_ty = b.int_type(8);
        let ptr_ty = b.pointer_type(i8_ty);
        let i32_ty = b.int_type(32);
        let f = b.begin_function("f", &[ptr_ty], ptr_ty);
        let slot = b.alloca(ptr_ty);
        let x = b.param(f, 0);
        b.store(slot, x);
        let loaded = b.load(ptr_ty, slot);
        b.ret(Some(loaded));
        b.end_function(f);
        let g1 = b.add_global("g1", i8_ty);
        let g2 = b.add_global("g2", i8_ty);
        let main = b.begin_function("main", &[], i32_ty);
        let f_val = b.function_value(f);
        let g1_val = b.global_value(g1);
        let g2_val = b.global_value(g2);
        b.call(Some(ptr_ty), f_val, &[g1_val]);
        b.call(Some(ptr_ty), f_val, &[g2_val]);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let (program, type_map) = crate::analysis::pointer::semi_sparse::SemiSparseProgram::build(
            &module,
        );
        let mem_mgr = MemoryManager::new(type_map);
        let config = AnalysisConfig::new(ContextPolicy::NoContext);
        let table = ExternalPointerTable::new();
        let mut pre =
            SemiSparsePointerAnalysis::run(&module, &program, mem_mgr, &config, &table).unwrap();

        let alloca_site = InstRef {
            func: f,
            block: BlockId(0),
            index: 0,
        };
        let call_site = InstRef {
            func: main,
            block: BlockId(0),
            index: 0,
        };

        // Generous thresholds: every site stays refined at the default k.
        let generous = configure_introspective(
            &module,
            &program,
            &mut pre,
            IntrospectiveHeuristic::default_a(),
            2,
        );
        assert_eq!(generous.alloc_site_limit(alloca_site), 2);
        assert_eq!(generous.call_site_limit(call_site), 2);

        // Zero thresholds: the slot accumulates points-to data, so its site
        // and the call sites of its function fall back to k=0.
        let strict = configure_introspective(
            &module,
            &program,
            &mut pre,
            IntrospectiveHeuristic::A {
                max_pointed_by: 0,
                max_in_flow: 0,
                max_field_pts_bound: 0,
            },
            2,
        );
        assert_eq!(strict.alloc_site_limit(alloca_site), 0);
        assert_eq!(strict.call_site_limit(call_site), 0);
    }

    #[test]
    fn heuristic_a_thresholds() {
        let h = IntrospectiveHeuristic::A {
            max_pointed_by: 2,
            max_in_flow: 10,
            max_field_pts_bound: 3,
        };
        let ok = SiteMetrics {
            pointed_by: 2,
            in_flow: 10,
            max_field_pts: 3,
            object_count: 1,
        };
        let too_popular = SiteMetrics {
            pointed_by: 3,
            ..ok
        };
        assert!(h.refines(&ok));
        assert!(!h.refines(&too_popular));
    }

    #[test]
    fn heuristic_b_thresholds() {
        let h = IntrospectiveHeuristic::B {
            max_volume: 5,
            max_field_product: 4,
        };
        let ok = SiteMetrics {
            pointed_by: 2,
            in_flow: 3,
            max_field_pts: 2,
            object_count: 2,
        };
        assert!(h.refines(&ok));
        let too_wide = SiteMetrics {
            max_field_pts: 3,
            ..ok
        };
        assert!(!h.refines(&too_wide));
    }
}

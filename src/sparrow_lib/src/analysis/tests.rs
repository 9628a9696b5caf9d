//! End-to-end tests driving both analyses over small programs.

use super::taint::TaintLattice;
use crate::annotation::{ExternalModRefTable, ExternalPointerTable, ExternalTaintTable};
use crate::context::policies::{ContextPolicy, SelectiveKcfa};
use crate::context::CtxId;
use crate::intermediate_representation::builder::ModuleBuilder;
use crate::intermediate_representation::{GepOffset, Module, ValueId};
use crate::pipeline::AnalysisResults;
use crate::AnalysisConfig;

fn run_pointer_only(module: Module, policy: ContextPolicy) -> AnalysisResults {
    let config = AnalysisConfig::new(policy);
    let ptr_table = ExternalPointerTable::new();
    AnalysisResults::compute_pointer_analysis(module, &config, &ptr_table).unwrap()
}

fn run_all(
    module: Module,
    policy: ContextPolicy,
    ptr_cfg: &str,
    modref_cfg: &str,
    taint_cfg: &str,
) -> AnalysisResults {
    let config = AnalysisConfig::new(policy);
    let ptr_table = ExternalPointerTable::parse(ptr_cfg).unwrap();
    let modref_table = ExternalModRefTable::parse(modref_cfg).unwrap();
    let taint_table = ExternalTaintTable::parse(taint_cfg).unwrap();
    AnalysisResults::compute_all(module, &config, &ptr_table, &modref_table, &taint_table).unwrap()
}

fn pts_names(results: &AnalysisResults, value: ValueId) -> Vec<String> {
    let set = results
        .pointer
        .pts_of_value(CtxId::GLOBAL, value, &results.module);
    results
        .pointer
        .pts
        .elements(set)
        .iter()
        .map(|obj| results.pointer.mem_mgr.display_object(*obj, &results.module))
        .collect()
}

/// S1: intraprocedural alias. Two allocas get distinct objects; the store
/// writes untainted data; no violations.
#[test]
fn intraprocedural_alias() {
    let mut b = ModuleBuilder::new("s1");
    let i32_ty = b.int_type(32);
    let main = b.begin_function("main", &[], i32_ty);
    let p = b.alloca(i32_ty);
    let q = b.alloca(i32_ty);
    let zero = b.const_int(0);
    b.store(p, zero);
    let loaded = b.load(i32_ty, p);
    b.ret(Some(loaded));
    b.end_function(main);
    let module = b.finish();

    let results = run_all(
        module,
        ContextPolicy::UniformKLimit { k: 1 },
        "",
        "",
        "",
    );
    let p_objs = pts_names(&results, p);
    let q_objs = pts_names(&results, q);
    assert_eq!(p_objs.len(), 1);
    assert_eq!(q_objs.len(), 1);
    assert_ne!(p_objs, q_objs);

    let taint = results.taint.as_ref().unwrap();
    assert!(taint.is_clean());
    // The load observes the untainted constant through memory.
    assert_eq!(
        taint.env.lookup((CtxId::GLOBAL, loaded)),
        TaintLattice::Untainted
    );
}

/// Build the S2 module: `id` returns its pointer argument, `main` routes two
/// different globals through it.
fn s2_module() -> (Module, ValueId, ValueId) {
    let mut b = ModuleBuilder::new("s2");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let id = b.begin_function("id", &[ptr_ty], ptr_ty);
    let x = b.param(id, 0);
    b.ret(Some(x));
    b.end_function(id);

    let g1 = b.add_global("g1", i8_ty);
    let g2 = b.add_global("g2", i8_ty);
    let i32_ty = b.int_type(32);
    let main = b.begin_function("main", &[], i32_ty);
    let id_val = b.function_value(id);
    let g1_val = b.global_value(g1);
    let g2_val = b.global_value(g2);
    let a = b.call(Some(ptr_ty), id_val, &[g1_val]).unwrap();
    let bb = b.call(Some(ptr_ty), id_val, &[g2_val]).unwrap();
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    (b.finish(), a, bb)
}

/// S2: interprocedural flow with k=0 merges both calls.
#[test]
fn interprocedural_flow_without_context() {
    let (module, a, bb) = s2_module();
    let results = run_pointer_only(module, ContextPolicy::NoContext);
    let a_objs = pts_names(&results, a);
    let b_objs = pts_names(&results, bb);
    assert_eq!(a_objs, vec!["global(g1)", "global(g2)"]);
    assert_eq!(b_objs, a_objs);
}

/// S2: with k=1 the two calls stay separate.
#[test]
fn interprocedural_flow_with_k1() {
    let (module, a, bb) = s2_module();
    let results = run_pointer_only(module, ContextPolicy::UniformKLimit { k: 1 });
    assert_eq!(pts_names(&results, a), vec!["global(g1)"]);
    assert_eq!(pts_names(&results, bb), vec!["global(g2)"]);
}

/// S3: a tainted source value reaching an annotated sink argument.
#[test]
fn taint_source_to_sink() {
    let mut b = ModuleBuilder::new("s3");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let i32_ty = b.int_type(32);
    let getenv = b.declare_function("getenv", &[ptr_ty], ptr_ty);
    let system = b.declare_function("system", &[ptr_ty], i32_ty);
    let name = b.add_global("name", i8_ty);

    let main = b.begin_function("main", &[], i32_ty);
    let getenv_val = b.function_value(getenv);
    let system_val = b.function_value(system);
    let name_val = b.global_value(name);
    let t = b.call(Some(ptr_ty), getenv_val, &[name_val]).unwrap();
    b.call(Some(i32_ty), system_val, &[t]);
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let results = run_all(
        module,
        ContextPolicy::UniformKLimit { k: 1 },
        "getenv COPY Static ValueRet\nsystem IGNORE\n",
        "getenv IGNORE\nsystem IGNORE\n",
        "SOURCE getenv Ret V T\nSINK system Arg0 V\n",
    );
    let taint = results.taint.as_ref().unwrap();
    assert_eq!(taint.env.lookup((CtxId::GLOBAL, t)), TaintLattice::Tainted);
    assert_eq!(taint.violations.len(), 1);
    let violation = &taint.violations[0];
    assert_eq!(violation.arg_pos, 0);
    assert_eq!(violation.expected, TaintLattice::Untainted);
    assert_eq!(violation.actual, TaintLattice::Tainted);
}

/// S4: the second store through a singleton, non-summary destination
/// replaces the first one.
#[test]
fn strong_update_on_second_store() {
    let mut b = ModuleBuilder::new("s4");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let src1 = b.add_global("src1", i8_ty);
    let src2 = b.add_global("src2", i8_ty);
    let i32_ty = b.int_type(32);
    let main = b.begin_function("main", &[], i32_ty);
    let p = b.alloca(ptr_ty);
    let src1_val = b.global_value(src1);
    let src2_val = b.global_value(src2);
    b.store(p, src1_val);
    b.store(p, src2_val);
    let q = b.load(ptr_ty, p);
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let results = run_pointer_only(module, ContextPolicy::UniformKLimit { k: 1 });
    assert_eq!(pts_names(&results, q), vec!["global(src2)"]);
}

/// S5: the memcpy-style pipe taints the reachable destination fields that
/// have a tainted counterpart in the source; other fields keep their value.
#[test]
fn external_pipe_memcpy() {
    let mut b = ModuleBuilder::new("s5");
    let i8_ty = b.int_type(8);
    let src_ty = b.struct_type(&[i8_ty]);
    let dst_ty = b.struct_type(&[i8_ty, i8_ty]);
    let src_ptr_ty = b.pointer_type(src_ty);
    let dst_ptr_ty = b.pointer_type(dst_ty);
    let i8_ptr_ty = b.pointer_type(i8_ty);
    let i32_ty = b.int_type(32);
    let i64_ty = b.int_type(64);
    let read = b.declare_function("read_input", &[src_ptr_ty], i32_ty);
    let memcpy = b.declare_function("memcpy", &[dst_ptr_ty, src_ptr_ty, i64_ty], dst_ptr_ty);

    let main = b.begin_function("main", &[], i32_ty);
    let src = b.alloca(src_ty);
    let dst = b.alloca(dst_ty);
    // Initialize the second destination byte with clean data.
    let dst_tail = b.gep(i8_ptr_ty, dst, GepOffset::Constant(1));
    let zero = b.const_int(0);
    b.store(dst_tail, zero);
    // Fill the source with attacker data, then copy it over.
    let read_val = b.function_value(read);
    b.call(Some(i32_ty), read_val, &[src]);
    let memcpy_val = b.function_value(memcpy);
    let one = b.const_int(1);
    b.call(Some(dst_ptr_ty), memcpy_val, &[dst, src, one]);
    let dst_head = b.gep(i8_ptr_ty, dst, GepOffset::Constant(0));
    let head = b.load(i8_ty, dst_head);
    let tail = b.load(i8_ty, dst_tail);
    b.ret(Some(head));
    b.end_function(main);
    let module = b.finish();

    let results = run_all(
        module,
        ContextPolicy::UniformKLimit { k: 1 },
        "read_input IGNORE\nmemcpy COPY ReachMemArg1 ReachMemArg0\n",
        "read_input MOD Arg0\nmemcpy MOD Arg0 REACH\nmemcpy REF Arg1 REACH\n",
        "SOURCE read_input Arg0 D T\nPIPE memcpy Arg1 R Arg0 R\n",
    );
    let taint = results.taint.as_ref().unwrap();
    assert_eq!(taint.env.lookup((CtxId::GLOBAL, head)), TaintLattice::Tainted);
    assert_eq!(taint.env.lookup((CtxId::GLOBAL, tail)), TaintLattice::Untainted);
}

/// Build the S6 module: one call site feeds attacker data into `id`, the
/// other clean data; the merged result reaches a sink.
fn s6_module() -> Module {
    let mut b = ModuleBuilder::new("s6");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let i32_ty = b.int_type(32);
    let getenv = b.declare_function("getenv", &[ptr_ty], ptr_ty);
    let system = b.declare_function("system", &[ptr_ty], i32_ty);
    let clean = b.add_global("clean", i8_ty);

    let id = b.begin_function("id", &[ptr_ty], ptr_ty);
    let x = b.param(id, 0);
    b.ret(Some(x));
    b.end_function(id);

    let main = b.begin_function("main", &[], i32_ty);
    let getenv_val = b.function_value(getenv);
    let system_val = b.function_value(system);
    let id_val = b.function_value(id);
    let clean_val = b.global_value(clean);
    let name = b.const_null(i8_ty);
    let t = b.call(Some(ptr_ty), getenv_val, &[name]).unwrap();
    let a = b.call(Some(ptr_ty), id_val, &[t]).unwrap();
    let bb = b.call(Some(ptr_ty), id_val, &[clean_val]).unwrap();
    b.call(Some(i32_ty), system_val, &[a]);
    b.call(Some(i32_ty), system_val, &[bb]);
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    b.finish()
}

const S6_PTR_CFG: &str = "getenv COPY Static ValueRet\nsystem IGNORE\n";
const S6_MODREF_CFG: &str = "getenv IGNORE\nsystem IGNORE\n";
const S6_TAINT_CFG: &str = "SOURCE getenv Ret V T\nSINK system Arg0 V\n";

/// S6: without contexts the merged argument reaches the sink as `Either`;
/// the tracker reports the two call sites, and re-running with deeper
/// contexts at exactly those sites makes the result precise again.
#[test]
fn precision_loss_tracking_and_refinement() {
    let module = s6_module();
    let results = run_all(
        module,
        ContextPolicy::NoContext,
        S6_PTR_CFG,
        S6_MODREF_CFG,
        S6_TAINT_CFG,
    );
    let taint = results.taint.as_ref().unwrap();
    // Both sink calls see the merged value.
    assert!(taint
        .violations
        .iter()
        .any(|v| v.actual == TaintLattice::Either));

    let sources = results.imprecision_sources.as_ref().unwrap();
    assert!(!sources.is_empty());
    let du = results.def_use.as_ref().unwrap();
    // All reported points are call sites on the def-use path.
    let mut refine_sites = Vec::new();
    for pp in sources {
        let site = du.node(pp.node).inst().expect("demander is a call site");
        assert!(matches!(
            results.module.inst(site).kind,
            crate::intermediate_representation::InstKind::Call { .. }
        ));
        refine_sites.push(site);
    }

    // Refine only the reported sites and run again.
    let mut selective = SelectiveKcfa::new(0);
    for site in refine_sites {
        selective.set_call_site_limit(site, 1);
    }
    let refined = run_all(
        s6_module(),
        ContextPolicy::SelectiveKcfa(selective),
        S6_PTR_CFG,
        S6_MODREF_CFG,
        S6_TAINT_CFG,
    );
    let refined_taint = refined.taint.as_ref().unwrap();
    // The violation is now precise: the attacker path is Tainted, and no
    // Either value reaches a sink anymore.
    assert!(refined_taint
        .violations
        .iter()
        .all(|v| v.actual == TaintLattice::Tainted));
    assert_eq!(refined_taint.violations.len(), 1);
}

/// Heap allocations through the external table are summary objects, so
/// stores into them are always weak.
#[test]
fn malloc_objects_are_summary() {
    let mut b = ModuleBuilder::new("heap");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let ptr_ptr_ty = b.pointer_type(ptr_ty);
    let i64_ty = b.int_type(64);
    let i32_ty = b.int_type(32);
    let malloc = b.declare_function("malloc", &[i64_ty], ptr_ptr_ty);
    let g1 = b.add_global("g1", i8_ty);
    let g2 = b.add_global("g2", i8_ty);

    let main = b.begin_function("main", &[], i32_ty);
    let malloc_val = b.function_value(malloc);
    let size = b.const_int(8);
    let m = b.call(Some(ptr_ptr_ty), malloc_val, &[size]).unwrap();
    let g1_val = b.global_value(g1);
    let g2_val = b.global_value(g2);
    b.store(m, g1_val);
    b.store(m, g2_val);
    let loaded = b.load(ptr_ty, m);
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let config = AnalysisConfig::new(ContextPolicy::UniformKLimit { k: 1 });
    let ptr_table = ExternalPointerTable::parse("malloc ALLOC Arg0\n").unwrap();
    let results =
        AnalysisResults::compute_pointer_analysis(module, &config, &ptr_table).unwrap();

    let m_set = results.pointer.pts_of_value(CtxId::GLOBAL, m, &results.module);
    assert_eq!(results.pointer.pts.len(m_set), 1);
    let heap_obj = results.pointer.pts.elements(m_set)[0];
    assert!(results.pointer.mem_mgr.is_summary(heap_obj));
    // Both stores survive: weak updates only.
    let loaded_names = pts_names(&results, loaded);
    assert_eq!(loaded_names, vec!["global(g1)", "global(g2)"]);
}

/// Indirect calls are resolved through the points-to sets of the callee
/// pointer.
#[test]
fn indirect_call_resolution() {
    let mut b = ModuleBuilder::new("indirect");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let i32_ty = b.int_type(32);

    let id = b.begin_function("id", &[ptr_ty], ptr_ty);
    let x = b.param(id, 0);
    b.ret(Some(x));
    b.end_function(id);

    let g1 = b.add_global("g1", i8_ty);
    let id_val = b.function_value(id);
    let fn_ptr_ty = b.value_type(id_val);
    let main = b.begin_function("main", &[], i32_ty);
    let slot = b.alloca(fn_ptr_ty);
    b.store(slot, id_val);
    let callee = b.load(fn_ptr_ty, slot);
    let g1_val = b.global_value(g1);
    let r = b.call(Some(ptr_ty), callee, &[g1_val]).unwrap();
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let results = run_pointer_only(module, ContextPolicy::UniformKLimit { k: 1 });
    assert_eq!(pts_names(&results, r), vec!["global(g1)"]);
}

/// Two identical runs produce identical observable results.
#[test]
fn analysis_is_deterministic() {
    let run = || {
        let results = run_all(
            s6_module(),
            ContextPolicy::NoContext,
            S6_PTR_CFG,
            S6_MODREF_CFG,
            S6_TAINT_CFG,
        );
        let taint = results.taint.as_ref().unwrap();
        (
            results.dump_pts(),
            taint.violations.clone(),
            results.imprecision_sources.clone().unwrap(),
            results.pointer.ctx_mgr.len(),
        )
    };
    let first = run();
    let second = run();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
    assert_eq!(first.3, second.3);
}

/// No context produced during analysis exceeds the policy bound.
#[test]
fn context_depth_respects_the_policy() {
    let mut b = ModuleBuilder::new("deep");
    let i8_ty = b.int_type(8);
    let ptr_ty = b.pointer_type(i8_ty);
    let i32_ty = b.int_type(32);

    let level3 = b.begin_function("level3", &[ptr_ty], ptr_ty);
    let x3 = b.param(level3, 0);
    b.ret(Some(x3));
    b.end_function(level3);
    let level2 = b.begin_function("level2", &[ptr_ty], ptr_ty);
    let x2 = b.param(level2, 0);
    let l3_val = b.function_value(level3);
    let r2 = b.call(Some(ptr_ty), l3_val, &[x2]).unwrap();
    b.ret(Some(r2));
    b.end_function(level2);
    let level1 = b.begin_function("level1", &[ptr_ty], ptr_ty);
    let x1 = b.param(level1, 0);
    let l2_val = b.function_value(level2);
    let r1 = b.call(Some(ptr_ty), l2_val, &[x1]).unwrap();
    b.ret(Some(r1));
    b.end_function(level1);

    let g = b.add_global("g", i8_ty);
    let main = b.begin_function("main", &[], i32_ty);
    let l1_val = b.function_value(level1);
    let g_val = b.global_value(g);
    let r = b.call(Some(ptr_ty), l1_val, &[g_val]).unwrap();
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let results = run_pointer_only(module, ContextPolicy::UniformKLimit { k: 2 });
    for ctx in results.pointer.ctx_mgr.iter() {
        assert!(results.pointer.ctx_mgr.depth(ctx) <= 2);
    }
    // The pointer still flows through the whole chain.
    assert_eq!(pts_names(&results, r), vec!["global(g)"]);

    let results = run_pointer_only(s6_module(), ContextPolicy::NoContext);
    for ctx in results.pointer.ctx_mgr.iter() {
        assert_eq!(ctx, CtxId::GLOBAL);
    }
}

/// Unknown externals produce a warning and behave as no-ops.
#[test]
fn missing_external_annotation_warns() {
    let mut b = ModuleBuilder::new("warn");
    let i32_ty = b.int_type(32);
    let mystery = b.declare_function("mystery", &[], i32_ty);
    let main = b.begin_function("main", &[], i32_ty);
    let mystery_val = b.function_value(mystery);
    b.call(Some(i32_ty), mystery_val, &[]);
    let zero = b.const_int(0);
    b.ret(Some(zero));
    b.end_function(main);
    let module = b.finish();

    let results = run_all(
        module,
        ContextPolicy::UniformKLimit { k: 1 },
        "",
        "",
        "",
    );
    assert!(results
        .logs
        .iter()
        .any(|log| log.text.contains("missing annotation for external function mystery")));
    assert!(results.taint.as_ref().unwrap().is_clean());
}

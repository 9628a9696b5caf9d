//! Context-sensitivity policies.
//!
//! A policy has a single operation: `push(parent, call_site) -> child`. Push
//! only ever happens at call sites (and at heap-allocation sites, which are
//! calls to allocator functions), never at other instructions. No policy
//! produces a context deeper than its limit.
//!
//! Available policies:
//! - [`ContextPolicy::NoContext`]: everything runs in the global context.
//! - [`ContextPolicy::UniformKLimit`]: classic k-CFA with one process-wide k.
//! - [`ContextPolicy::SelectiveKcfa`]: per-call-site and per-allocation-site
//!   k values with a default; sites can be configured individually, per
//!   function, by callee-name pattern, or by size/density heuristics.
//!
//! The introspective policy is not a separate variant: it is a selective-kCFA
//! configuration computed from a context-insensitive pre-analysis (see
//! `analysis::pointer::strategies`).

use super::{ContextManager, CtxId};
use crate::intermediate_representation::{InstKind, InstRef, Module};
use fnv::FnvHashMap;
use regex::Regex;
use std::fmt::Write as _;

/// The calling-context abstraction carried by an analyzer instance.
///
/// There is deliberately no `Default` impl: the driver chooses the policy.
#[derive(Debug, Clone)]
pub enum ContextPolicy {
    /// Context-insensitive: push is the identity on the global context.
    NoContext,
    /// Uniform k-limited call strings.
    UniformKLimit { k: u32 },
    /// Per-site k limits with a default.
    SelectiveKcfa(SelectiveKcfa),
}

impl ContextPolicy {
    /// Push a call site onto a context according to the policy.
    ///
    /// The result never exceeds the policy's depth bound for the site; when
    /// the bound is reached the parent context is returned unchanged, which
    /// merges all deeper call paths.
    pub fn push(&self, mgr: &mut ContextManager, parent: CtxId, site: InstRef) -> CtxId {
        let k = match self {
            ContextPolicy::NoContext => return CtxId::GLOBAL,
            ContextPolicy::UniformKLimit { k } => *k,
            ContextPolicy::SelectiveKcfa(selective) => selective.call_site_limit(site),
        };
        if k == 0 {
            return CtxId::GLOBAL;
        }
        if mgr.depth(parent) >= k {
            parent
        } else {
            mgr.push(parent, site)
        }
    }

    /// The k limit that applies to contexts of objects allocated at `site`.
    /// A limit of zero classifies the allocation site as a summary site.
    pub fn alloc_site_limit(&self, site: InstRef) -> u32 {
        match self {
            ContextPolicy::NoContext => 0,
            ContextPolicy::UniformKLimit { k } => *k,
            ContextPolicy::SelectiveKcfa(selective) => selective.alloc_site_limit(site),
        }
    }

    /// A one-line description for reports.
    pub fn describe(&self) -> String {
        match self {
            ContextPolicy::NoContext => "no-context (k=0)".to_string(),
            ContextPolicy::UniformKLimit { k } => format!("uniform k-limit (k={k})"),
            ContextPolicy::SelectiveKcfa(s) => {
                format!("selective-kcfa (default k={})", s.default_k)
            }
        }
    }
}

/// Per-site k limits for the selective-kCFA policy.
#[derive(Debug, Clone)]
pub struct SelectiveKcfa {
    pub default_k: u32,
    call_site_limits: FnvHashMap<InstRef, u32>,
    alloc_site_limits: FnvHashMap<InstRef, u32>,
}

impl SelectiveKcfa {
    pub fn new(default_k: u32) -> Self {
        SelectiveKcfa {
            default_k,
            call_site_limits: FnvHashMap::default(),
            alloc_site_limits: FnvHashMap::default(),
        }
    }

    pub fn set_call_site_limit(&mut self, site: InstRef, k: u32) {
        self.call_site_limits.insert(site, k);
    }

    pub fn set_alloc_site_limit(&mut self, site: InstRef, k: u32) {
        self.alloc_site_limits.insert(site, k);
    }

    pub fn call_site_limit(&self, site: InstRef) -> u32 {
        self.call_site_limits
            .get(&site)
            .copied()
            .unwrap_or(self.default_k)
    }

    pub fn alloc_site_limit(&self, site: InstRef) -> u32 {
        self.alloc_site_limits
            .get(&site)
            .copied()
            .unwrap_or(self.default_k)
    }

    /// Set the limit for every call site inside the given function.
    pub fn set_limit_for_function_call_sites(&mut self, module: &Module, func_name: &str, k: u32) {
        let Some(func) = module.function_by_name(func_name) else {
            return;
        };
        for site in call_sites_of(module, func) {
            self.set_call_site_limit(site, k);
        }
    }

    /// Set the call-site limit for every direct call whose callee name
    /// matches the given pattern.
    pub fn set_limit_for_call_sites_by_name(&mut self, module: &Module, pattern: &Regex, k: u32) {
        for (site, callee) in direct_call_sites(module) {
            if pattern.is_match(&module.func(callee).name) {
                self.set_call_site_limit(site, k);
            }
        }
    }

    /// Set the allocation-site limit for every direct call to a function
    /// whose name matches the pattern (typically allocator names).
    pub fn set_alloc_limit_by_callee_name(&mut self, module: &Module, pattern: &Regex, k: u32) {
        for (site, callee) in direct_call_sites(module) {
            if pattern.is_match(&module.func(callee).name) {
                self.set_alloc_site_limit(site, k);
            }
        }
    }

    /// Heuristic seeding: large functions and functions with many call sites
    /// or allocation sites tend to blow up under deep contexts, so their call
    /// sites get a reduced limit.
    ///
    /// * Functions with more than `size_threshold` instructions get k=0 for
    ///   their call sites.
    /// * Functions whose allocation-site count exceeds `alloc_threshold` get
    ///   k=0 for their allocation sites.
    /// * Call sites of functions that are called from more than
    ///   `call_freq_threshold` sites get k=1 at most.
    pub fn seed_with_heuristics(
        &mut self,
        module: &Module,
        size_threshold: usize,
        alloc_threshold: usize,
        call_freq_threshold: usize,
    ) {
        let mut callee_freq: FnvHashMap<crate::intermediate_representation::FuncId, usize> =
            FnvHashMap::default();
        for (_, callee) in direct_call_sites(module) {
            *callee_freq.entry(callee).or_insert(0) += 1;
        }

        for (idx, func) in module.functions.iter().enumerate() {
            let func_id = crate::intermediate_representation::FuncId(idx as u32);
            if func.is_declaration() {
                continue;
            }
            let inst_count: usize = func.blocks.iter().map(|b| b.insts.len()).sum();
            let alloc_count = func
                .blocks
                .iter()
                .flat_map(|b| b.insts.iter())
                .filter(|i| matches!(i.kind, InstKind::Alloca { .. }))
                .count();

            if inst_count > size_threshold {
                for site in call_sites_of(module, func_id) {
                    self.set_call_site_limit(site, 0);
                }
            }
            if alloc_count > alloc_threshold {
                for site in alloc_sites_of(module, func_id) {
                    self.set_alloc_site_limit(site, 0);
                }
            }
        }

        for (site, callee) in direct_call_sites(module) {
            if callee_freq.get(&callee).copied().unwrap_or(0) > call_freq_threshold {
                let limit = self.call_site_limit(site).min(1);
                self.set_call_site_limit(site, limit);
            }
        }
    }

    /// A human-readable summary of the configuration: the default limit and
    /// the distribution of customized k values.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "SelectiveKCFA configuration:");
        let _ = writeln!(out, "  default k limit: {}", self.default_k);
        let _ = writeln!(
            out,
            "  customized call sites: {}",
            self.call_site_limits.len()
        );
        let _ = writeln!(
            out,
            "  customized allocation sites: {}",
            self.alloc_site_limits.len()
        );
        for (label, map) in [
            ("call site", &self.call_site_limits),
            ("allocation site", &self.alloc_site_limits),
        ] {
            let mut dist: std::collections::BTreeMap<u32, usize> = std::collections::BTreeMap::new();
            for k in map.values() {
                *dist.entry(*k).or_insert(0) += 1;
            }
            for (k, count) in dist {
                let _ = writeln!(out, "    k={k}: {count} {label}s");
            }
        }
        out
    }
}

/// All call sites of a function.
fn call_sites_of(module: &Module, func: crate::intermediate_representation::FuncId) -> Vec<InstRef> {
    let mut sites = Vec::new();
    let f = module.func(func);
    for (bidx, block) in f.blocks.iter().enumerate() {
        for (iidx, inst) in block.insts.iter().enumerate() {
            if matches!(inst.kind, InstKind::Call { .. }) {
                sites.push(InstRef {
                    func,
                    block: crate::intermediate_representation::BlockId(bidx as u32),
                    index: iidx as u32,
                });
            }
        }
    }
    sites
}

/// All stack-allocation sites of a function.
fn alloc_sites_of(module: &Module, func: crate::intermediate_representation::FuncId) -> Vec<InstRef> {
    let mut sites = Vec::new();
    let f = module.func(func);
    for (bidx, block) in f.blocks.iter().enumerate() {
        for (iidx, inst) in block.insts.iter().enumerate() {
            if matches!(inst.kind, InstKind::Alloca { .. }) {
                sites.push(InstRef {
                    func,
                    block: crate::intermediate_representation::BlockId(bidx as u32),
                    index: iidx as u32,
                });
            }
        }
    }
    sites
}

/// All direct call sites of the module with their callees.
fn direct_call_sites(
    module: &Module,
) -> Vec<(InstRef, crate::intermediate_representation::FuncId)> {
    let mut sites = Vec::new();
    for (fidx, func) in module.functions.iter().enumerate() {
        for (bidx, block) in func.blocks.iter().enumerate() {
            for (iidx, inst) in block.insts.iter().enumerate() {
                if let InstKind::Call { callee, .. } = &inst.kind {
                    if let crate::intermediate_representation::ValueKind::Function(target) =
                        &module.value(*callee).kind
                    {
                        sites.push((
                            InstRef {
                                func: crate::intermediate_representation::FuncId(fidx as u32),
                                block: crate::intermediate_representation::BlockId(bidx as u32),
                                index: iidx as u32,
                            },
                            *target,
                        ));
                    }
                }
            }
        }
    }
    sites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate_representation::builder::ModuleBuilder;
    use crate::intermediate_representation::{BlockId, FuncId};

    fn site(func: u32, index: u32) -> InstRef {
        InstRef {
            func: FuncId(func),
            block: BlockId(0),
            index,
        }
    }

    #[test]
    fn no_context_push_is_global() {
        let mut mgr = ContextManager::new();
        let policy = ContextPolicy::NoContext;
        let parent = mgr.push(CtxId::GLOBAL, site(0, 0));
        assert_eq!(policy.push(&mut mgr, parent, site(1, 0)), CtxId::GLOBAL);
        assert_eq!(policy.push(&mut mgr, CtxId::GLOBAL, site(1, 0)), CtxId::GLOBAL);
    }

    #[test]
    fn uniform_k_limit_bounds_depth() {
        let mut mgr = ContextManager::new();
        let policy = ContextPolicy::UniformKLimit { k: 2 };
        let c1 = policy.push(&mut mgr, CtxId::GLOBAL, site(0, 0));
        let c2 = policy.push(&mut mgr, c1, site(1, 0));
        let c3 = policy.push(&mut mgr, c2, site(2, 0));
        assert_eq!(mgr.depth(c1), 1);
        assert_eq!(mgr.depth(c2), 2);
        // Limit reached: the context is returned unchanged.
        assert_eq!(c3, c2);
    }

    #[test]
    fn uniform_k_zero_is_no_context() {
        let mut mgr = ContextManager::new();
        let policy = ContextPolicy::UniformKLimit { k: 0 };
        assert_eq!(policy.push(&mut mgr, CtxId::GLOBAL, site(0, 0)), CtxId::GLOBAL);
    }

    #[test]
    fn selective_limits_are_per_site() {
        let mut mgr = ContextManager::new();
        let mut selective = SelectiveKcfa::new(1);
        selective.set_call_site_limit(site(0, 0), 0);
        let policy = ContextPolicy::SelectiveKcfa(selective);

        // Site with k=0 collapses to the global context.
        assert_eq!(policy.push(&mut mgr, CtxId::GLOBAL, site(0, 0)), CtxId::GLOBAL);
        // Other sites use the default limit.
        let c = policy.push(&mut mgr, CtxId::GLOBAL, site(0, 1));
        assert_eq!(mgr.depth(c), 1);
        assert_eq!(policy.push(&mut mgr, c, site(0, 2)), c);
    }

    #[test]
    fn heuristic_seeding() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        // A helper with several instructions and one call site.
        let leaf = b.begin_function("leaf", &[], i32_ty);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(leaf);
        let helper = b.begin_function("helper", &[], i32_ty);
        let slot = b.alloca(i32_ty);
        let other = b.alloca(i32_ty);
        let zero = b.const_int(0);
        b.store(slot, zero);
        b.store(other, zero);
        let leaf_val = b.function_value(leaf);
        let r = b.call(Some(i32_ty), leaf_val, &[]).unwrap();
        b.ret(Some(r));
        b.end_function(helper);
        let main = b.begin_function("main", &[], i32_ty);
        let helper_val = b.function_value(helper);
        b.call(Some(i32_ty), helper_val, &[]);
        b.call(Some(i32_ty), helper_val, &[]);
        b.call(Some(i32_ty), helper_val, &[]);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(main);
        let module = b.finish();

        let mut selective = SelectiveKcfa::new(3);
        // helper has 6 instructions > 4, so its call sites drop to k=0;
        // helper itself is called from 3 > 2 sites, so the calls to it are
        // capped at k=1.
        selective.seed_with_heuristics(&module, 4, 10, 2);
        let helper_call_site = InstRef {
            func: helper,
            block: BlockId(0),
            index: 4,
        };
        assert_eq!(selective.call_site_limit(helper_call_site), 0);
        let main_call_site = InstRef {
            func: main,
            block: BlockId(0),
            index: 0,
        };
        assert_eq!(selective.call_site_limit(main_call_site), 1);
    }

    #[test]
    fn regex_configuration() {
        let mut b = ModuleBuilder::new("m");
        let i32_ty = b.int_type(32);
        let helper = b.begin_function("helper_one", &[], i32_ty);
        let zero = b.const_int(0);
        b.ret(Some(zero));
        b.end_function(helper);
        let main = b.begin_function("main", &[], i32_ty);
        let helper_val = b.function_value(helper);
        let result = b.call(Some(i32_ty), helper_val, &[]).unwrap();
        b.ret(Some(result));
        b.end_function(main);
        let module = b.finish();

        let mut selective = SelectiveKcfa::new(2);
        let pattern = Regex::new("^helper_.*").unwrap();
        selective.set_limit_for_call_sites_by_name(&module, &pattern, 0);
        let call_site = InstRef {
            func: main,
            block: BlockId(0),
            index: 0,
        };
        assert_eq!(selective.call_site_limit(call_site), 0);
    }
}

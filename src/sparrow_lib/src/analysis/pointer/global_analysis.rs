//! The global prepass of the pointer analysis.
//!
//! Before the fixpoint starts, every global variable and every function gets
//! its memory object, the environment is seeded with their address values at
//! the global context, and pointer-valued global initializers are written
//! into the initial store. The universal object is seeded to point to itself
//! so that loads through unknown memory stay unknown instead of empty.

use super::pointer_manager::PointerManager;
use super::pts_set::PtsSetPool;
use super::state::{Env, Store};
use crate::analysis::memory::{MemObjId, MemoryManager};
use crate::context::CtxId;
use crate::intermediate_representation::{FuncId, GlobalId, Module, ValueKind};
use fnv::FnvHashMap;

/// Seed the environment and build the initial store.
pub fn run(
    module: &Module,
    ptr_mgr: &mut PointerManager,
    mem_mgr: &mut MemoryManager,
    pts: &mut PtsSetPool,
    env: &mut Env,
) -> Store {
    let mut store = Store::new();
    let mut global_objs: FnvHashMap<GlobalId, MemObjId> = FnvHashMap::default();
    let mut func_objs: FnvHashMap<FuncId, MemObjId> = FnvHashMap::default();

    // First pass: create the objects and seed the environment.
    for (idx, global) in module.globals.iter().enumerate() {
        let id = GlobalId(idx as u32);
        let layout = mem_mgr.type_map().layout_of(global.ty);
        let obj = mem_mgr.allocate_global(id, layout);
        global_objs.insert(id, obj);
        let ptr = ptr_mgr.get_or_create(CtxId::GLOBAL, global.value, module);
        let set = pts.singleton(obj);
        env.strong_update(ptr, set);
    }
    for (idx, func) in module.functions.iter().enumerate() {
        let id = FuncId(idx as u32);
        let obj = mem_mgr.allocate_function(id);
        func_objs.insert(id, obj);
        let ptr = ptr_mgr.get_or_create(CtxId::GLOBAL, func.value, module);
        let set = pts.singleton(obj);
        env.strong_update(ptr, set);
    }

    // Second pass: pointer-valued initializers.
    for (idx, global) in module.globals.iter().enumerate() {
        let base = global_objs[&GlobalId(idx as u32)];
        for (offset, value) in &global.initializers {
            let target = mem_mgr.offset_memory(base, *offset);
            if mem_mgr.is_special(target) {
                continue;
            }
            let init_set = match &module.value(*value).kind {
                ValueKind::Global(g) => pts.singleton(global_objs[g]),
                ValueKind::Function(f) => pts.singleton(func_objs[f]),
                ValueKind::ConstantNull => pts.singleton(mem_mgr.null_object()),
                _ => continue,
            };
            store.weak_update(target, init_set, pts);
        }
    }

    // Unknown memory points to unknown memory; the argv/envp regions point
    // into themselves (argv[i] is a string inside the argv region).
    let universal = mem_mgr.universal_object();
    let universal_set = pts.singleton(universal);
    store.strong_update(universal, universal_set);
    let argv = mem_mgr.argv_object();
    let argv_set = pts.singleton(argv);
    store.strong_update(argv, argv_set);
    let envp = mem_mgr.envp_object();
    let envp_set = pts.singleton(envp);
    store.strong_update(envp, envp_set);

    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::memory::TypeMap;
    use crate::intermediate_representation::builder::ModuleBuilder;

    #[test]
    fn globals_and_initializers_are_seeded() {
        let mut b = ModuleBuilder::new("m");
        let i8_ty = b.int_type(8);
        let ptr_ty = b.pointer_type(i8_ty);
        let target = b.add_global("target", i8_ty);
        let holder = b.add_global("holder", ptr_ty);
        let target_val = b.global_value(target);
        b.set_initializer(holder, 0, target_val);
        let module = b.finish();

        let type_map = TypeMap::build(&module.types);
        let mut mem_mgr = MemoryManager::new(type_map);
        let mut ptr_mgr = PointerManager::new(true);
        let mut pts = PtsSetPool::new();
        let mut env = Env::new();
        let store = run(&module, &mut ptr_mgr, &mut mem_mgr, &mut pts, &mut env);

        // The holder's storage contains the target's object.
        let holder_ptr = ptr_mgr
            .get(CtxId::GLOBAL, module.global(holder).value, &module)
            .unwrap();
        let holder_set = env.lookup(holder_ptr);
        assert_eq!(pts.len(holder_set), 1);
        let holder_obj = pts.elements(holder_set)[0];
        let stored = store.lookup(holder_obj);
        assert_eq!(pts.len(stored), 1);

        // Unknown memory stays unknown under loads.
        let universal = mem_mgr.universal_object();
        assert!(pts.contains(store.lookup(universal), universal));
    }
}

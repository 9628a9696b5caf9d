//! The abstract memory model: allocation sites and memory objects.
//!
//! A [`MemoryObject`](MemObjId) is a pair of an allocation site and a byte
//! offset into that site's type layout. Objects are interned by the
//! [`MemoryManager`]: two objects are equal iff their ids are equal, and all
//! objects live until the analyzer instance is dropped.
//!
//! The manager also owns the four sentinel objects: `null`, `universal`
//! (which absorb offsets and never accept store updates) and the `argv` /
//! `envp` summary regions of the program environment.

use crate::context::CtxId;
use crate::intermediate_representation::{FuncId, GlobalId, InstRef, Module, ValueId};
use fnv::FnvHashMap;

pub mod layout;

pub use layout::{ArrayRange, LayoutId, TypeLayout, TypeMap};

/// Index of an allocation site owned by the [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

/// Index of a memory object owned by the [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemObjId(pub u32);

/// What kind of program location an allocation site is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// A stack slot created by an `alloca`.
    Stack { value: ValueId, site: InstRef },
    /// A heap region allocated by an external call.
    Heap { site: InstRef },
    /// The storage of a global variable.
    Global(GlobalId),
    /// A function address.
    Function(FuncId),
    /// The null sentinel.
    Null,
    /// The universal sentinel standing for all unknown memory.
    Universal,
    /// The argv array and its strings.
    Argv,
    /// The envp array and its strings.
    Envp,
}

/// An allocation site: an allocation kind instantiated in a calling context.
#[derive(Debug, Clone, Copy)]
pub struct AllocSite {
    pub ctx: CtxId,
    pub kind: AllocKind,
    pub layout: LayoutId,
    /// Whether the site stands for more than one runtime cell (heap regions,
    /// argv/envp, and sites whose allocation-context limit is zero).
    pub summary: bool,
}

/// A memory object: an allocation site plus a byte offset into its layout.
#[derive(Debug, Clone, Copy)]
pub struct MemoryObject {
    pub site: SiteId,
    pub offset: u64,
    /// Summary objects forbid strong updates. An object is summary if its
    /// site is, or if its offset lies inside an array region of the layout.
    pub summary: bool,
}

/// Owns and interns all allocation sites and memory objects.
pub struct MemoryManager {
    type_map: TypeMap,
    sites: Vec<AllocSite>,
    site_intern: FnvHashMap<(CtxId, AllocKind), SiteId>,
    objects: Vec<MemoryObject>,
    obj_intern: FnvHashMap<(SiteId, u64), MemObjId>,
    null_obj: MemObjId,
    universal_obj: MemObjId,
    argv_obj: MemObjId,
    envp_obj: MemObjId,
}

impl MemoryManager {
    pub fn new(type_map: TypeMap) -> MemoryManager {
        let byte_array = type_map.byte_array();
        let mut mgr = MemoryManager {
            type_map,
            sites: Vec::new(),
            site_intern: FnvHashMap::default(),
            objects: Vec::new(),
            obj_intern: FnvHashMap::default(),
            null_obj: MemObjId(0),
            universal_obj: MemObjId(0),
            argv_obj: MemObjId(0),
            envp_obj: MemObjId(0),
        };
        mgr.null_obj = {
            let site = mgr.intern_site(CtxId::GLOBAL, AllocKind::Null, byte_array, false);
            mgr.object_at(site, 0)
        };
        mgr.universal_obj = {
            let site = mgr.intern_site(CtxId::GLOBAL, AllocKind::Universal, byte_array, true);
            mgr.object_at(site, 0)
        };
        mgr.argv_obj = {
            let site = mgr.intern_site(CtxId::GLOBAL, AllocKind::Argv, byte_array, true);
            mgr.object_at(site, 0)
        };
        mgr.envp_obj = {
            let site = mgr.intern_site(CtxId::GLOBAL, AllocKind::Envp, byte_array, true);
            mgr.object_at(site, 0)
        };
        mgr
    }

    pub fn type_map(&self) -> &TypeMap {
        &self.type_map
    }

    pub fn null_object(&self) -> MemObjId {
        self.null_obj
    }

    pub fn universal_object(&self) -> MemObjId {
        self.universal_obj
    }

    pub fn argv_object(&self) -> MemObjId {
        self.argv_obj
    }

    pub fn envp_object(&self) -> MemObjId {
        self.envp_obj
    }

    pub fn object(&self, id: MemObjId) -> &MemoryObject {
        &self.objects[id.0 as usize]
    }

    pub fn site(&self, id: SiteId) -> &AllocSite {
        &self.sites[id.0 as usize]
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Whether the object is one of the null/universal sentinels. Special
    /// objects never accept store updates and absorb offset arithmetic.
    pub fn is_special(&self, id: MemObjId) -> bool {
        matches!(
            self.site(self.object(id).site).kind,
            AllocKind::Null | AllocKind::Universal
        )
    }

    pub fn is_summary(&self, id: MemObjId) -> bool {
        self.object(id).summary
    }

    fn intern_site(&mut self, ctx: CtxId, kind: AllocKind, layout: LayoutId, summary: bool) -> SiteId {
        if let Some(existing) = self.site_intern.get(&(ctx, kind)) {
            return *existing;
        }
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(AllocSite {
            ctx,
            kind,
            layout,
            summary,
        });
        self.site_intern.insert((ctx, kind), id);
        id
    }

    /// Intern the object of `site` at the given offset. Offsets are
    /// normalized into array regions; offsets beyond the layout collapse to
    /// the universal object.
    fn object_at(&mut self, site: SiteId, offset: u64) -> MemObjId {
        let site_data = *self.site(site);
        let layout = self.type_map.layout(site_data.layout);
        let offset = layout.normalize_offset(offset);
        if offset >= layout.size && layout.size > 0 && !matches!(site_data.kind, AllocKind::Null | AllocKind::Universal) {
            return self.universal_obj;
        }
        if let Some(existing) = self.obj_intern.get(&(site, offset)) {
            return *existing;
        }
        let summary = site_data.summary || layout.is_summary_offset(offset);
        let id = MemObjId(self.objects.len() as u32);
        self.objects.push(MemoryObject {
            site,
            offset,
            summary,
        });
        self.obj_intern.insert((site, offset), id);
        id
    }

    /// The object of a stack slot. `summary_site` marks slots whose
    /// allocation-context limit is zero.
    pub fn allocate_stack(
        &mut self,
        ctx: CtxId,
        site: InstRef,
        value: ValueId,
        layout: LayoutId,
        summary_site: bool,
    ) -> MemObjId {
        let site = self.intern_site(ctx, AllocKind::Stack { value, site }, layout, summary_site);
        self.object_at(site, 0)
    }

    /// The object of a heap allocation. Heap sites are always summary.
    pub fn allocate_heap(&mut self, ctx: CtxId, site: InstRef, layout: LayoutId) -> MemObjId {
        let site = self.intern_site(ctx, AllocKind::Heap { site }, layout, true);
        self.object_at(site, 0)
    }

    /// The object of a global variable's storage.
    pub fn allocate_global(&mut self, global: GlobalId, layout: LayoutId) -> MemObjId {
        let site = self.intern_site(CtxId::GLOBAL, AllocKind::Global(global), layout, false);
        self.object_at(site, 0)
    }

    /// The object standing for a function's address.
    pub fn allocate_function(&mut self, func: FuncId) -> MemObjId {
        let byte_array = self.type_map.byte_array();
        let site = self.intern_site(CtxId::GLOBAL, AllocKind::Function(func), byte_array, false);
        self.object_at(site, 0)
    }

    /// If the object stands for a function address, return the function.
    pub fn as_function(&self, id: MemObjId) -> Option<FuncId> {
        match self.site(self.object(id).site).kind {
            AllocKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Offset an object by `delta` bytes. Special objects absorb the offset;
    /// offsetting by zero returns the same object.
    pub fn offset_memory(&mut self, obj: MemObjId, delta: u64) -> MemObjId {
        if self.is_special(obj) {
            return obj;
        }
        if delta == 0 {
            return obj;
        }
        let data = *self.object(obj);
        self.object_at(data.site, data.offset + delta)
    }

    /// The representative object for an unknown-index access through `obj`:
    /// the offset is normalized into its array region.
    pub fn offset_memory_unknown_index(&mut self, obj: MemObjId) -> MemObjId {
        if self.is_special(obj) {
            return obj;
        }
        let data = *self.object(obj);
        self.object_at(data.site, data.offset)
    }

    /// All field objects of the site reachable from `obj`'s offset onward,
    /// in ascending offset order. The walk is over the type layout, not the
    /// value graph, so it is bounded. Special objects enumerate themselves.
    pub fn reachable_memory_objects(&mut self, obj: MemObjId) -> Vec<MemObjId> {
        self.reachable_from(obj, false)
    }

    /// Like [`MemoryManager::reachable_memory_objects`], restricted to
    /// pointer-typed fields.
    pub fn reachable_pointer_objects(&mut self, obj: MemObjId) -> Vec<MemObjId> {
        self.reachable_from(obj, true)
    }

    fn reachable_from(&mut self, obj: MemObjId, pointers_only: bool) -> Vec<MemObjId> {
        if self.is_special(obj) {
            return vec![obj];
        }
        let data = *self.object(obj);
        let site = *self.site(data.site);
        let layout = self.type_map.layout(site.layout);
        let offsets: Vec<u64> = if pointers_only {
            layout
                .pointer_offsets
                .range(data.offset..)
                .copied()
                .collect()
        } else {
            layout.field_offsets.range(data.offset..).copied().collect()
        };
        let mut result: Vec<MemObjId> = offsets
            .into_iter()
            .map(|off| self.object_at(data.site, off))
            .collect();
        if result.is_empty() && !pointers_only {
            result.push(obj);
        }
        result
    }

    /// Render an object for diagnostics.
    pub fn display_object(&self, id: MemObjId, module: &Module) -> String {
        let obj = self.object(id);
        let site = self.site(obj.site);
        let base = match site.kind {
            AllocKind::Stack { value, .. } => format!("stack({})", module.display_value(value)),
            AllocKind::Heap { site } => format!("heap({site})"),
            AllocKind::Global(g) => format!("global({})", module.global(g).name),
            AllocKind::Function(f) => format!("function({})", module.func(f).name),
            AllocKind::Null => return "null".to_string(),
            AllocKind::Universal => return "universal".to_string(),
            AllocKind::Argv => return "argv".to_string(),
            AllocKind::Envp => return "envp".to_string(),
        };
        if obj.offset == 0 {
            base
        } else {
            format!("{base}+{}", obj.offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate_representation::{Type, TypeTable};

    fn manager() -> (MemoryManager, LayoutId) {
        let mut types = TypeTable::new();
        let i32_ty = types.intern(Type::Int { bits: 32 });
        let ptr_ty = types.intern(Type::Pointer { pointee: i32_ty });
        let st = types.intern(Type::Struct {
            fields: vec![i32_ty, ptr_ty, ptr_ty],
        });
        let map = TypeMap::build(&types);
        let layout = map.layout_of(st);
        (MemoryManager::new(map), layout)
    }

    fn test_site(index: u32) -> InstRef {
        InstRef {
            func: FuncId(0),
            block: crate::intermediate_representation::BlockId(0),
            index,
        }
    }

    #[test]
    fn objects_are_interned() {
        let (mut mgr, layout) = manager();
        let a = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        let b = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        assert_eq!(a, b);
        let c = mgr.allocate_stack(CtxId::GLOBAL, test_site(1), ValueId(1), layout, false);
        assert_ne!(a, c);
    }

    #[test]
    fn offset_zero_is_identity() {
        let (mut mgr, layout) = manager();
        let obj = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        assert_eq!(mgr.offset_memory(obj, 0), obj);
    }

    #[test]
    fn special_objects_absorb_offsets() {
        let (mut mgr, _) = manager();
        let null = mgr.null_object();
        let universal = mgr.universal_object();
        assert_eq!(mgr.offset_memory(null, 8), null);
        assert_eq!(mgr.offset_memory(universal, 4), universal);
        assert_eq!(mgr.reachable_memory_objects(universal), vec![universal]);
    }

    #[test]
    fn out_of_bounds_collapses_to_universal() {
        let (mut mgr, layout) = manager();
        let obj = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        assert_eq!(mgr.offset_memory(obj, 1000), mgr.universal_object());
    }

    #[test]
    fn reachable_enumeration_is_stable() {
        let (mut mgr, layout) = manager();
        let obj = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        let all1 = mgr.reachable_memory_objects(obj);
        let all2 = mgr.reachable_memory_objects(obj);
        assert_eq!(all1, all2);
        // struct { i32, i32*, i32* } has fields at 0, 4 and 12.
        assert_eq!(all1.len(), 3);
        let ptrs = mgr.reachable_pointer_objects(obj);
        assert_eq!(ptrs.len(), 2);
        // Walking from a mid-struct offset only sees the tail.
        let mid = mgr.offset_memory(obj, 4);
        assert_eq!(mgr.reachable_pointer_objects(mid).len(), 2);
        let tail = mgr.offset_memory(obj, 12);
        assert_eq!(mgr.reachable_pointer_objects(tail).len(), 1);
    }

    #[test]
    fn heap_objects_are_summary() {
        let (mut mgr, layout) = manager();
        let heap = mgr.allocate_heap(CtxId::GLOBAL, test_site(2), layout);
        assert!(mgr.is_summary(heap));
        let stack = mgr.allocate_stack(CtxId::GLOBAL, test_site(0), ValueId(0), layout, false);
        assert!(!mgr.is_summary(stack));
        let k0_stack = mgr.allocate_stack(CtxId::GLOBAL, test_site(1), ValueId(1), layout, true);
        assert!(mgr.is_summary(k0_stack));
    }
}

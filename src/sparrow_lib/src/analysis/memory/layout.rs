//! Byte-level type layouts.
//!
//! A [`TypeLayout`] answers the questions the memory model has about a type:
//! how big it is, at which offsets it stores pointers, which offsets are
//! scalar fields at all, and which offset ranges belong to arrays. Arrays are
//! flattened to a single representative element, so all elements of an array
//! share the memory objects of the first one and the whole range counts as
//! summary memory.
//!
//! The [`TypeMap`] interns one layout per IR type plus the distinguished
//! byte-array layout used when an allocation cannot be typed.

use crate::intermediate_representation::{Type, TypeId, TypeTable};
use fnv::FnvHashMap;
use std::collections::BTreeSet;

/// Index of a layout in the [`TypeMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutId(pub u32);

/// A contiguous array region inside a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRange {
    pub start: u64,
    pub end: u64,
    pub stride: u64,
}

/// The flattened byte layout of a type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeLayout {
    /// Total size in bytes.
    pub size: u64,
    /// Offsets of all scalar fields.
    pub field_offsets: BTreeSet<u64>,
    /// Offsets of all pointer-typed fields; a subset of `field_offsets`.
    pub pointer_offsets: BTreeSet<u64>,
    /// Array regions, outermost first. Offsets inside a region are summary
    /// memory.
    pub array_ranges: Vec<ArrayRange>,
}

impl TypeLayout {
    /// The layout used when the allocation size cannot be typed: one summary
    /// byte cell that may hold a pointer.
    pub fn byte_array() -> TypeLayout {
        TypeLayout {
            size: 1,
            field_offsets: BTreeSet::from([0]),
            pointer_offsets: BTreeSet::from([0]),
            array_ranges: vec![ArrayRange {
                start: 0,
                end: 1,
                stride: 1,
            }],
        }
    }

    /// The innermost array range containing the given offset, if any.
    pub fn array_range_at(&self, offset: u64) -> Option<&ArrayRange> {
        self.array_ranges
            .iter()
            .rev()
            .find(|r| r.start <= offset && offset < r.end)
    }

    /// Map an offset into the representative element of its array region:
    /// offsets inside an array are reduced modulo the element stride. Offsets
    /// outside any array are returned unchanged.
    pub fn normalize_offset(&self, offset: u64) -> u64 {
        let mut off = offset;
        // Apply outermost ranges first so nested arrays reduce step by step.
        for range in &self.array_ranges {
            if range.start <= off && off < range.end && range.stride > 0 {
                off = range.start + (off - range.start) % range.stride;
            }
        }
        off
    }

    /// Whether the offset lies inside summary (array) memory.
    pub fn is_summary_offset(&self, offset: u64) -> bool {
        self.array_range_at(offset).is_some()
    }
}

/// Interned layouts for all types of a module.
#[derive(Debug, Clone)]
pub struct TypeMap {
    layouts: Vec<TypeLayout>,
    by_type: FnvHashMap<TypeId, LayoutId>,
    byte_array: LayoutId,
}

impl TypeMap {
    /// Compute layouts for every type in the table.
    pub fn build(table: &TypeTable) -> TypeMap {
        let mut map = TypeMap {
            layouts: vec![TypeLayout::byte_array()],
            by_type: FnvHashMap::default(),
            byte_array: LayoutId(0),
        };
        for (id, _) in table.iter() {
            let mut layout = TypeLayout {
                size: table.size_of(id),
                ..TypeLayout::default()
            };
            flatten(table, id, 0, &mut layout);
            map.layouts.push(layout);
            map.by_type.insert(id, LayoutId((map.layouts.len() - 1) as u32));
        }
        map
    }

    /// The distinguished byte-array layout.
    pub fn byte_array(&self) -> LayoutId {
        self.byte_array
    }

    pub fn layout(&self, id: LayoutId) -> &TypeLayout {
        &self.layouts[id.0 as usize]
    }

    /// The layout of an IR type. Types unknown to the map (e.g. from another
    /// module) fall back to the byte-array layout.
    pub fn layout_of(&self, ty: TypeId) -> LayoutId {
        self.by_type.get(&ty).copied().unwrap_or(self.byte_array)
    }
}

/// Recursively record the fields of `ty` at `base` into `layout`.
fn flatten(table: &TypeTable, ty: TypeId, base: u64, layout: &mut TypeLayout) {
    match table.get(ty) {
        Type::Void => (),
        Type::Int { .. } => {
            layout.field_offsets.insert(base);
        }
        Type::Pointer { .. } | Type::Function { .. } => {
            layout.field_offsets.insert(base);
            layout.pointer_offsets.insert(base);
        }
        Type::Array { element, len } => {
            let stride = table.size_of(*element);
            layout.array_ranges.push(ArrayRange {
                start: base,
                end: base + stride * len,
                stride,
            });
            // Arrays are flattened to their first element.
            flatten(table, *element, base, layout);
        }
        Type::Struct { fields } => {
            let mut offset = base;
            for field in fields {
                flatten(table, *field, offset, layout);
                offset += table.size_of(*field);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(types: &mut TypeTable) -> (TypeId, TypeId, TypeId) {
        let i32_ty = types.intern(Type::Int { bits: 32 });
        let ptr_ty = types.intern(Type::Pointer { pointee: i32_ty });
        // struct { i32, i32*, [4 x i32*] }
        let arr_ty = types.intern(Type::Array {
            element: ptr_ty,
            len: 4,
        });
        let st = types.intern(Type::Struct {
            fields: vec![i32_ty, ptr_ty, arr_ty],
        });
        (i32_ty, ptr_ty, st)
    }

    #[test]
    fn struct_layout() {
        let mut types = TypeTable::new();
        let (_, _, st) = table_with(&mut types);
        let map = TypeMap::build(&types);
        let layout = map.layout(map.layout_of(st));
        assert_eq!(layout.size, 4 + 8 + 32);
        assert_eq!(
            layout.pointer_offsets.iter().copied().collect::<Vec<_>>(),
            vec![4, 12]
        );
        assert!(layout.is_summary_offset(12));
        assert!(!layout.is_summary_offset(4));
    }

    #[test]
    fn array_offsets_normalize_to_first_element() {
        let mut types = TypeTable::new();
        let (_, _, st) = table_with(&mut types);
        let map = TypeMap::build(&types);
        let layout = map.layout(map.layout_of(st));
        // Third array element maps back to the first.
        assert_eq!(layout.normalize_offset(12 + 2 * 8), 12);
        // Non-array offsets are unchanged.
        assert_eq!(layout.normalize_offset(4), 4);
    }

    #[test]
    fn byte_array_layout() {
        let layout = TypeLayout::byte_array();
        assert_eq!(layout.size, 1);
        assert!(layout.is_summary_offset(0));
        assert_eq!(layout.normalize_offset(0), 0);
    }
}

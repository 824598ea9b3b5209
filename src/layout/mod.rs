//! Native and managed placement of every marshaled field of a type.
use crate::{
    marshal::{MarshalSlot, MarshalTag, NativeFieldCategory},
    types::{FieldDescriptor, LayoutKind, TypeId, TypeKind},
};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Range};

pub mod ffi;
pub mod persist;
pub mod planner;
pub mod registry;

pub use planner::{BasePlacement, LayoutPlanner, PlannedLayout, PlannerField};
pub use registry::LayoutRegistry;

/// Where one field lives on one side of the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawFieldPlacement {
    pub offset: u32,
    pub size: u32,
    pub alignment: u32,
}

impl RawFieldPlacement {
    pub fn new(offset: u32, size: u32, alignment: u32) -> Self {
        Self {
            offset,
            size,
            alignment,
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.offset as usize..self.end() as usize
    }

    pub fn overlaps(&self, other: &RawFieldPlacement) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for RawFieldPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5} +{:<4} (align {})", self.offset, self.size, self.alignment)
    }
}

/// Rounds `value` up to a multiple of `align`, or `None` on overflow.
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    let misalignment = value % align;
    if misalignment == 0 {
        Some(value)
    } else {
        value.checked_add(align - misalignment)
    }
}

/// A reference from a slot to another type's layout. Live tables only ever
/// hold `Bound` ids; persisted tables hold `Unbound` tokens until restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    Bound(TypeId),
    /// Index into the type-name table of a persisted layout file.
    Unbound(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLayoutEntry {
    pub descriptor: FieldDescriptor,
    /// Name of the type that declares the field, which differs from the
    /// layout's own type for inherited fields.
    pub declaring_type: String,
    pub slot: MarshalSlot,
    pub native: RawFieldPlacement,
    pub managed: RawFieldPlacement,
    pub sequence: u32,
}

impl FieldLayoutEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn tag(&self) -> MarshalTag {
        self.slot.tag()
    }

    pub fn category(&self) -> NativeFieldCategory {
        self.slot.category()
    }
}

/// The published, immutable layout table of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeLayout {
    pub type_id: TypeId,
    pub name: String,
    pub kind: TypeKind,
    pub layout_kind: LayoutKind,
    pub packing: u32,
    /// Inherited entries first, then the type's own in sequence order.
    pub entries: Vec<FieldLayoutEntry>,
    pub native_size: u32,
    pub native_alignment: u32,
    pub managed_size: u32,
    pub managed_alignment: u32,
    /// Both representations are byte-for-byte identical.
    pub blittable: bool,
    /// Managed fields are guaranteed to sit in declaration order.
    pub managed_sequential: bool,
    /// Some field is, or embeds, an object reference.
    pub has_references: bool,
    #[serde(skip)]
    pub(crate) restored: bool,
}

impl TypeLayout {
    pub fn entry(&self, name: &str) -> Option<&FieldLayoutEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// `(size, alignment)` of the native representation.
    pub fn size_and_alignment(&self) -> (u32, u32) {
        (self.native_size, self.native_alignment)
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn has_illegal_fields(&self) -> bool {
        self.entries.iter().any(|e| e.slot.is_illegal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_and_detects_overflow() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(5, 4), Some(8));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(u32::MAX - 1, 4), None);
    }

    #[test]
    fn placements() {
        let a = RawFieldPlacement::new(4, 4, 4);
        let b = RawFieldPlacement::new(6, 2, 2);
        let c = RawFieldPlacement::new(8, 0, 1);
        assert_eq!(a.range(), 4..8);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}

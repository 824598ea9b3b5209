//! The per-field marshaling slot: a small `Copy` tagged union holding one
//! strategy and the bookkeeping needed to find its field.
use super::{
    array::ElementStrategy,
    category::NativeFieldCategory,
    cleanup::CleanupList,
    illegal::Illegal,
    nested::NestedValueClass,
    reference::{ReferenceMarshaler, ReferenceStrategy},
    scalar::{ScalarMarshaler, ScalarStrategy},
    MarshalContext,
};
use crate::{
    error::MarshalError,
    layout::{LayoutRegistry, TypeRef},
    value::{ObjectHandle, POINTER_SIZE},
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Upper bound on the in-place size of any strategy. Layout tables are
/// copied around as plain bytes, so this must stay small and fixed.
pub const MAX_STRATEGY_SIZE: usize = 64;

const _: () = assert!(size_of::<Strategy>() <= MAX_STRATEGY_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarshalTag {
    Copy1,
    Copy2,
    Copy4,
    Copy8,
    Ansi,
    WinBool,
    CBool,
    VariantBool,
    Date,
    Decimal,
    Currency,
    NestedValueClass,
    NestedLayoutClass,
    StringAnsi,
    StringUni,
    StringUtf8,
    Bstr,
    FixedStringAnsi,
    FixedStringUni,
    FixedArray,
    FixedCharArrayAnsi,
    Delegate,
    SafeHandle,
    Interface,
    Variant,
    Illegal,
}

/// Every marshaling behavior, grouped by the capability the engine uses to
/// drive it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Strategy {
    /// Unwrapped bytes on both sides.
    Scalar(ScalarStrategy),
    /// A value type embedded in place on both sides.
    NestedValue(NestedValueClass),
    /// An object reference on the managed side.
    Reference(ReferenceStrategy),
    Illegal(Illegal),
}

impl Strategy {
    pub fn tag(&self) -> MarshalTag {
        match self {
            Strategy::Scalar(s) => s.tag(),
            Strategy::NestedValue(_) => MarshalTag::NestedValueClass,
            Strategy::Reference(r) => r.tag(),
            Strategy::Illegal(_) => MarshalTag::Illegal,
        }
    }

    pub fn category(&self) -> NativeFieldCategory {
        match self {
            Strategy::Scalar(s) => s.category(),
            Strategy::NestedValue(_) => NativeFieldCategory::NESTED_VALUE_CLASS,
            Strategy::Reference(r) => r.category(),
            Strategy::Illegal(_) => NativeFieldCategory::ILLEGAL,
        }
    }

    pub fn native_size(&self) -> u32 {
        match self {
            Strategy::Scalar(s) => s.native_size(),
            Strategy::NestedValue(n) => n.native_size,
            Strategy::Reference(r) => r.native_size(),
            Strategy::Illegal(_) => 0,
        }
    }

    pub fn alignment_requirement(&self) -> u32 {
        match self {
            Strategy::Scalar(s) => s.alignment_requirement(),
            Strategy::NestedValue(n) => n.native_alignment,
            Strategy::Reference(r) => r.alignment_requirement(),
            Strategy::Illegal(_) => 1,
        }
    }

    pub fn is_blittable(&self) -> bool {
        match self {
            Strategy::Scalar(s) => s.is_blittable(),
            Strategy::NestedValue(n) => n.blittable,
            Strategy::Reference(_) | Strategy::Illegal(_) => false,
        }
    }

    pub fn holds_references(&self) -> bool {
        match self {
            Strategy::Reference(_) => true,
            Strategy::NestedValue(n) => n.has_references,
            Strategy::Scalar(_) => false,
            Strategy::Illegal(i) => i.is_reference,
        }
    }

    /// Calls `f` on every lazily bound type reference held in place.
    pub fn visit_type_refs<E>(
        &mut self,
        mut f: impl FnMut(&mut TypeRef) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Strategy::NestedValue(n) => f(&mut n.nested),
            Strategy::Reference(ReferenceStrategy::NestedLayoutClass(c)) => f(&mut c.nested),
            Strategy::Reference(ReferenceStrategy::FixedArray(a)) => match &mut a.element {
                ElementStrategy::Nested(n) => f(&mut n.nested),
                ElementStrategy::Scalar(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// The part of a slot that [`MarshalSlot::copy_to`] replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHeader {
    /// Index of the field in its declaring type's metadata.
    pub field_index: u32,
    /// Offset of the field inside the native structure.
    pub external_offset: u32,
    pub tag: MarshalTag,
    pub category: NativeFieldCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarshalSlot {
    header: SlotHeader,
    strategy: Strategy,
}

impl MarshalSlot {
    pub fn new(field_index: u32, strategy: Strategy) -> Self {
        Self {
            header: SlotHeader {
                field_index,
                external_offset: 0,
                tag: strategy.tag(),
                category: strategy.category(),
            },
            strategy,
        }
    }

    pub fn placed_at(mut self, external_offset: u32) -> Self {
        self.header.external_offset = external_offset;
        self
    }

    pub fn header(&self) -> &SlotHeader {
        &self.header
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn tag(&self) -> MarshalTag {
        self.header.tag
    }

    pub fn category(&self) -> NativeFieldCategory {
        self.header.category
    }

    pub fn field_index(&self) -> u32 {
        self.header.field_index
    }

    pub fn external_offset(&self) -> u32 {
        self.header.external_offset
    }

    pub fn native_size(&self) -> u32 {
        self.strategy.native_size()
    }

    pub fn alignment_requirement(&self) -> u32 {
        self.strategy.alignment_requirement()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.strategy, Strategy::Scalar(_))
    }

    pub fn is_nested_value_type(&self) -> bool {
        matches!(self.strategy, Strategy::NestedValue(_))
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self.strategy, Strategy::Illegal(_))
    }

    /// Copies only the header; the strategy payload stays untouched. Use
    /// plain assignment to replicate the whole slot.
    pub fn copy_to(&self, dest: &mut SlotHeader) {
        *dest = self.header;
    }

    /// The scalar fast path. Calling this on any other kind of slot is a
    /// bug in the caller.
    pub fn as_scalar(&self) -> &ScalarStrategy {
        match &self.strategy {
            Strategy::Scalar(s) => s,
            other => panic!("scalar fast path invoked on {:?} slot", other.tag()),
        }
    }

    /// The nested value type fast path, same contract as [`Self::as_scalar`].
    pub fn as_nested_value(&self) -> &NestedValueClass {
        match &self.strategy {
            Strategy::NestedValue(n) => n,
            other => panic!("nested value fast path invoked on {:?} slot", other.tag()),
        }
    }

    pub(crate) fn strategy_mut(&mut self) -> &mut Strategy {
        &mut self.strategy
    }

    /// Converts the field stored at `managed_offset` of `owner` into
    /// `native`, which is exactly this field's native bytes.
    ///
    /// Illegal slots must be filtered out by the caller.
    pub fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        owner: &ObjectHandle,
        managed_offset: usize,
        native: &mut [u8],
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        trace!(
            "update_native {:?} managed+{} -> native+{}",
            self.header.tag,
            managed_offset,
            self.header.external_offset
        );
        match &self.strategy {
            Strategy::Scalar(s) => {
                let clr = cx
                    .heap
                    .read_bytes(owner, managed_offset, s.managed_size() as usize)?;
                s.scalar_update_native(&clr, native, cx.config())
            }
            Strategy::NestedValue(n) => {
                n.nested_update_native(cx, owner, managed_offset, native, cleanup)
            }
            Strategy::Reference(r) => {
                let value = cx.heap.read_ref(owner, managed_offset)?;
                r.update_native(cx, value.as_ref(), native, cleanup)
            }
            Strategy::Illegal(_) => panic!("update_native invoked on an illegal slot"),
        }
    }

    pub fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        owner: &ObjectHandle,
        managed_offset: usize,
    ) -> Result<(), MarshalError> {
        trace!(
            "update_clr {:?} native+{} -> managed+{}",
            self.header.tag,
            self.header.external_offset,
            managed_offset
        );
        match &self.strategy {
            Strategy::Scalar(s) => {
                let mut clr = vec![0; s.managed_size() as usize];
                s.scalar_update_clr(native, &mut clr)?;
                cx.heap.write_bytes(owner, managed_offset, &clr)?;
                Ok(())
            }
            Strategy::NestedValue(n) => n.nested_update_clr(cx, native, owner, managed_offset),
            Strategy::Reference(r) => {
                let previous = cx.heap.read_ref(owner, managed_offset)?;
                let value = r.update_clr(cx, native, previous.as_ref())?;
                cx.heap.write_ref(owner, managed_offset, value.as_ref())?;
                Ok(())
            }
            Strategy::Illegal(_) => panic!("update_clr invoked on an illegal slot"),
        }
    }

    /// Releases whatever the field owns and leaves its null representation
    /// behind. Never fails.
    pub fn destroy_native(&self, registry: &LayoutRegistry, native: &mut [u8]) {
        match &self.strategy {
            Strategy::Scalar(_) | Strategy::Illegal(_) => {}
            Strategy::NestedValue(n) => n.nested_destroy(registry, native),
            Strategy::Reference(r) => r.destroy_native(registry, native),
        }
    }
}

/// Managed size of a field whose managed side is an object reference.
pub const REFERENCE_SIZE: u32 = POINTER_SIZE as u32;

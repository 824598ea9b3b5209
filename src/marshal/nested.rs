use super::{
    category::NativeFieldCategory,
    cleanup::{block_owner, CleanupEntry, CleanupList},
    engine,
    reference::ReferenceMarshaler,
    slot::MarshalTag,
    string::release_block,
    MarshalContext,
};
use crate::{
    error::MarshalError,
    layout::{LayoutRegistry, TypeLayout, TypeRef},
    value::{native_heap, BlockOwner, NativePtr, ObjectHandle, POINTER_SIZE},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A value type embedded in place on both sides. Conversion recurses into
/// the nested type's own layout at the field's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedValueClass {
    pub nested: TypeRef,
    pub native_size: u32,
    pub native_alignment: u32,
    pub managed_size: u32,
    pub managed_alignment: u32,
    pub blittable: bool,
    pub has_references: bool,
}

impl NestedValueClass {
    pub fn new(layout: &TypeLayout) -> Self {
        Self {
            nested: TypeRef::Bound(layout.type_id),
            native_size: layout.native_size,
            native_alignment: layout.native_alignment,
            managed_size: layout.managed_size,
            managed_alignment: layout.managed_alignment,
            blittable: layout.blittable,
            has_references: layout.has_references,
        }
    }

    pub fn tag(&self) -> MarshalTag {
        MarshalTag::NestedValueClass
    }

    pub fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::NESTED_VALUE_CLASS
    }

    /// Converts the embedded aggregate at `managed_offset` inside `owner`.
    pub fn nested_update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        owner: &ObjectHandle,
        managed_offset: usize,
        native: &mut [u8],
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        if self.blittable {
            let clr = cx
                .heap
                .read_bytes(owner, managed_offset, self.managed_size as usize)?;
            native.copy_from_slice(&clr[..native.len()]);
            return Ok(());
        }
        let layout = cx.registry.resolve(self.nested)?;
        if self.has_references {
            engine::update_native_at(cx, &layout, owner, managed_offset, native, cleanup)
        } else {
            let clr = cx
                .heap
                .read_bytes(owner, managed_offset, self.managed_size as usize)?;
            engine::bytes_to_native(cx.registry, &layout, &clr, native)
        }
    }

    pub fn nested_update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        owner: &ObjectHandle,
        managed_offset: usize,
    ) -> Result<(), MarshalError> {
        if self.blittable {
            cx.heap.write_bytes(owner, managed_offset, native)?;
            return Ok(());
        }
        let layout = cx.registry.resolve(self.nested)?;
        if self.has_references {
            engine::update_clr_at(cx, &layout, native, owner, managed_offset)
        } else {
            let mut clr = cx
                .heap
                .read_bytes(owner, managed_offset, self.managed_size as usize)?;
            engine::bytes_to_clr(cx.registry, &layout, native, &mut clr)?;
            cx.heap.write_bytes(owner, managed_offset, &clr)?;
            Ok(())
        }
    }

    pub fn nested_destroy(&self, registry: &LayoutRegistry, native: &mut [u8]) {
        if !self.has_references {
            return;
        }
        match registry.resolve(self.nested) {
            Ok(layout) => engine::destroy_at(registry, &layout, native),
            Err(e) => warn!("cannot destroy nested value: {}", e),
        }
    }
}

/// A reference to a class with sequential or explicit layout, passed as a
/// pointer to a separately allocated native copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedLayoutClass {
    pub nested: TypeRef,
}

impl ReferenceMarshaler for NestedLayoutClass {
    fn tag(&self) -> MarshalTag {
        MarshalTag::NestedLayoutClass
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::NESTED_LAYOUT_CLASS
    }

    fn native_size(&self) -> u32 {
        POINTER_SIZE as u32
    }

    fn alignment_requirement(&self) -> u32 {
        POINTER_SIZE as u32
    }

    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        mut cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        let Some(value) = value else {
            NativePtr::NULL.write_to(native);
            return Ok(());
        };
        let layout = cx.registry.resolve(self.nested)?;
        if cx.heap.instance_type(value)? != layout.type_id {
            return Err(MarshalError::TypeMismatch {
                expected: layout.name.clone(),
            });
        }

        let mut block = vec![0; layout.native_size as usize];
        if let Err(e) =
            engine::convert_managed_to_native(cx, &layout, value, &mut block, cleanup.as_deref_mut())
        {
            if cleanup.is_none() {
                // nobody else will ever see what was allocated for it
                engine::destroy_native_buffer(cx.registry, &layout, &mut block);
            }
            return Err(e);
        }
        let ptr = native_heap().alloc_bytes_owned(&block, block_owner(cleanup.as_deref()))?;
        ptr.write_to(native);
        if let Some(cleanup) = cleanup {
            cleanup.push(CleanupEntry::FreeNative(ptr));
        }
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let ptr = NativePtr::read_from(native);
        if ptr.is_null() {
            return Ok(None);
        }
        let layout = cx.registry.resolve(self.nested)?;
        let block = native_heap().read(ptr, layout.native_size as usize)?;
        let target = match previous {
            Some(p) if cx.heap.instance_type(p).ok() == Some(layout.type_id) => p.clone(),
            _ => cx
                .heap
                .alloc_instance(layout.type_id, layout.managed_size as usize),
        };
        engine::convert_native_to_managed(cx, &layout, &block, &target)?;
        Ok(Some(target))
    }

    fn destroy_native(&self, registry: &LayoutRegistry, native: &mut [u8]) {
        let ptr = NativePtr::read_from(native);
        if ptr.is_null() {
            return;
        }
        // the block and everything it points at belong to a cleanup list
        if native_heap().owner(ptr) != Some(BlockOwner::Buffer) {
            NativePtr::NULL.write_to(native);
            return;
        }
        match registry.resolve(self.nested) {
            Ok(layout) => match native_heap().read(ptr, layout.native_size as usize) {
                Ok(mut block) => engine::destroy_native_buffer(registry, &layout, &mut block),
                Err(e) => warn!("cannot destroy nested layout class at {:?}: {}", ptr, e),
            },
            Err(e) => warn!("cannot destroy nested layout class at {:?}: {}", ptr, e),
        }
        release_block(ptr);
        NativePtr::NULL.write_to(native);
    }
}

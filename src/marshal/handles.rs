//! Pointer-sized strategies for objects that stand for something native:
//! delegates, SafeHandles and COM interfaces.
use super::{
    category::NativeFieldCategory,
    cleanup::{CleanupEntry, CleanupList},
    reference::ReferenceMarshaler,
    slot::MarshalTag,
    MarshalContext,
};
use crate::{
    error::{HeapError, MarshalError},
    layout::LayoutRegistry,
    value::{NativePtr, ObjectHandle, POINTER_SIZE},
};
use serde::{Deserialize, Serialize};

/// A delegate passed as the function pointer it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegate;

impl ReferenceMarshaler for Delegate {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Delegate
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
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
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        let Some(value) = value else {
            NativePtr::NULL.write_to(native);
            return Ok(());
        };
        NativePtr(cx.heap.delegate_target(value)?).write_to(native);
        if let Some(cleanup) = cleanup {
            cleanup.push(CleanupEntry::KeepAlive(value.clone()));
        }
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let target = NativePtr::read_from(native);
        if target.is_null() {
            return Ok(None);
        }
        if let Some(p) = previous {
            if cx.heap.delegate_target(p).ok() == Some(target.0) {
                return Ok(Some(p.clone()));
            }
        }
        Ok(Some(cx.heap.alloc_delegate(target.0)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        NativePtr::NULL.write_to(native);
    }
}

/// A SafeHandle passed as its raw handle. Each conversion takes a reference
/// on the handle that only the cleanup list gives back, so a list is
/// mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeHandle;

impl ReferenceMarshaler for SafeHandle {
    fn tag(&self) -> MarshalTag {
        MarshalTag::SafeHandle
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
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
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        let value = value.ok_or(MarshalError::NullSafeHandle)?;
        let cleanup = cleanup.ok_or(MarshalError::CleanupListRequired)?;
        let handle = cx.heap.safe_handle_add_ref(value).map_err(|e| match e {
            HeapError::SafeHandleClosed => MarshalError::SafeHandleClosed,
            e => e.into(),
        })?;
        NativePtr(handle).write_to(native);
        cleanup.push(CleanupEntry::ReleaseHandle(value.clone()));
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let handle = NativePtr::read_from(native);
        match previous {
            Some(p) if cx.heap.safe_handle_state(p)?.0 == handle.0 => Ok(Some(p.clone())),
            None if handle.is_null() => Ok(None),
            _ => Err(MarshalError::SafeHandleFromNative),
        }
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        NativePtr::NULL.write_to(native);
    }
}

/// A COM object passed as its `IUnknown` pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface;

impl ReferenceMarshaler for Interface {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Interface
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTERFACE_TYPE
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
        _cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        let ptr = match value {
            Some(v) => NativePtr(cx.heap.com_pointer(v)?),
            None => NativePtr::NULL,
        };
        ptr.write_to(native);
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
        if let Some(p) = previous {
            if cx.heap.com_pointer(p).ok() == Some(ptr.0) {
                return Ok(Some(p.clone()));
            }
        }
        Ok(Some(cx.heap.alloc_com_object(ptr.0)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        NativePtr::NULL.write_to(native);
    }
}

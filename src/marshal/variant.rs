//! `object` fields passed as an OLE `VARIANT`.
use super::{
    category::NativeFieldCategory,
    cleanup::{block_owner, CleanupEntry, CleanupList},
    reference::ReferenceMarshaler,
    scalar::VARIANT_TRUE,
    slot::MarshalTag,
    string::{alloc_bstr, bstr_block, read_bstr, release_block},
    MarshalContext,
};
use crate::{
    error::MarshalError,
    layout::LayoutRegistry,
    value::{BoxedValue, NativePtr, ObjectHandle, POINTER_SIZE},
};
use serde::{Deserialize, Serialize};

pub const VT_EMPTY: u16 = 0;
pub const VT_I4: u16 = 3;
pub const VT_R4: u16 = 4;
pub const VT_R8: u16 = 5;
pub const VT_BSTR: u16 = 8;
pub const VT_BOOL: u16 = 11;
pub const VT_UNKNOWN: u16 = 13;
pub const VT_I8: u16 = 20;

/// The type tag and three reserved words come first.
const VALUE_OFFSET: usize = 8;

pub const VARIANT_SIZE: u32 = (VALUE_OFFSET + 2 * POINTER_SIZE) as u32;

fn variant_type(native: &[u8]) -> u16 {
    u16::from_le_bytes([native[0], native[1]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant;

impl ReferenceMarshaler for Variant {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Variant
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::COM_STRUCT
    }

    fn native_size(&self) -> u32 {
        VARIANT_SIZE
    }

    fn alignment_requirement(&self) -> u32 {
        8
    }

    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        native.fill(0);
        let Some(value) = value else {
            return Ok(());
        };
        let payload = &mut native[VALUE_OFFSET..];
        let vt = match cx.heap.kind(value) {
            "string" => {
                let owner = block_owner(cleanup.as_deref());
                let ptr = alloc_bstr(&cx.heap.string_chars(value)?, owner)?;
                ptr.write_to(payload);
                if let Some(cleanup) = cleanup {
                    cleanup.push(CleanupEntry::FreeNative(bstr_block(ptr)));
                }
                VT_BSTR
            }
            "COM object" => {
                NativePtr(cx.heap.com_pointer(value)?).write_to(payload);
                VT_UNKNOWN
            }
            "boxed value" => match cx.heap.boxed_value(value)? {
                BoxedValue::Bool(b) => {
                    let v = if b { VARIANT_TRUE } else { 0 };
                    payload[..2].copy_from_slice(&v.to_le_bytes());
                    VT_BOOL
                }
                BoxedValue::Int32(i) => {
                    payload[..4].copy_from_slice(&i.to_le_bytes());
                    VT_I4
                }
                BoxedValue::Int64(i) => {
                    payload[..8].copy_from_slice(&i.to_le_bytes());
                    VT_I8
                }
                BoxedValue::Float32(f) => {
                    payload[..4].copy_from_slice(&f.to_le_bytes());
                    VT_R4
                }
                BoxedValue::Float64(f) => {
                    payload[..8].copy_from_slice(&f.to_le_bytes());
                    VT_R8
                }
            },
            other => return Err(MarshalError::UnsupportedVariantValue(other)),
        };
        native[..2].copy_from_slice(&vt.to_le_bytes());
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let payload = &native[VALUE_OFFSET..];
        let mut word = [0; 8];
        word.copy_from_slice(&payload[..8]);
        let low = [word[0], word[1], word[2], word[3]];
        let boxed = match variant_type(native) {
            VT_EMPTY => return Ok(None),
            VT_BSTR => {
                let ptr = NativePtr::read_from(payload);
                if ptr.is_null() {
                    return Ok(None);
                }
                return Ok(Some(cx.heap.alloc_utf16(read_bstr(ptr)?)));
            }
            VT_UNKNOWN => {
                let ptr = NativePtr::read_from(payload);
                if ptr.is_null() {
                    return Ok(None);
                }
                if let Some(p) = previous {
                    if cx.heap.com_pointer(p).ok() == Some(ptr.0) {
                        return Ok(Some(p.clone()));
                    }
                }
                return Ok(Some(cx.heap.alloc_com_object(ptr.0)));
            }
            VT_BOOL => BoxedValue::Bool(i16::from_le_bytes([word[0], word[1]]) != 0),
            VT_I4 => BoxedValue::Int32(i32::from_le_bytes(low)),
            VT_I8 => BoxedValue::Int64(i64::from_le_bytes(word)),
            VT_R4 => BoxedValue::Float32(f32::from_le_bytes(low)),
            VT_R8 => BoxedValue::Float64(f64::from_le_bytes(word)),
            vt => return Err(MarshalError::UnsupportedVariant(vt)),
        };
        Ok(Some(cx.heap.alloc_boxed(boxed)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        if variant_type(native) == VT_BSTR {
            let ptr = NativePtr::read_from(&native[VALUE_OFFSET..]);
            if !ptr.is_null() {
                release_block(bstr_block(ptr));
            }
        }
        native.fill(0);
    }
}

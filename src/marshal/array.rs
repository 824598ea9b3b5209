use super::{
    category::NativeFieldCategory,
    cleanup::CleanupList,
    engine,
    nested::NestedValueClass,
    reference::ReferenceMarshaler,
    scalar::{ScalarMarshaler, ScalarStrategy},
    slot::MarshalTag,
    MarshalContext,
};
use crate::{
    error::MarshalError,
    layout::LayoutRegistry,
    value::ObjectHandle,
};
use serde::{Deserialize, Serialize};

/// How one element of an in-place array is converted. Elements never hold
/// object references, so both sides are plain bytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ElementStrategy {
    Scalar(ScalarStrategy),
    Nested(NestedValueClass),
}

impl ElementStrategy {
    pub fn native_size(&self) -> u32 {
        match self {
            ElementStrategy::Scalar(s) => s.native_size(),
            ElementStrategy::Nested(n) => n.native_size,
        }
    }

    pub fn managed_size(&self) -> u32 {
        match self {
            ElementStrategy::Scalar(s) => s.managed_size(),
            ElementStrategy::Nested(n) => n.managed_size,
        }
    }

    pub fn alignment_requirement(&self) -> u32 {
        match self {
            ElementStrategy::Scalar(s) => s.alignment_requirement(),
            ElementStrategy::Nested(n) => n.native_alignment,
        }
    }

    fn to_native(
        &self,
        registry: &LayoutRegistry,
        clr: &[u8],
        native: &mut [u8],
    ) -> Result<(), MarshalError> {
        match self {
            ElementStrategy::Scalar(s) => s.scalar_update_native(clr, native, registry.config()),
            ElementStrategy::Nested(n) if n.blittable => {
                native.copy_from_slice(&clr[..native.len()]);
                Ok(())
            }
            ElementStrategy::Nested(n) => {
                let layout = registry.resolve(n.nested)?;
                engine::bytes_to_native(registry, &layout, clr, native)
            }
        }
    }

    fn to_clr(
        &self,
        registry: &LayoutRegistry,
        native: &[u8],
        clr: &mut [u8],
    ) -> Result<(), MarshalError> {
        match self {
            ElementStrategy::Scalar(s) => s.scalar_update_clr(native, clr),
            ElementStrategy::Nested(n) if n.blittable => {
                clr[..native.len()].copy_from_slice(native);
                Ok(())
            }
            ElementStrategy::Nested(n) => {
                let layout = registry.resolve(n.nested)?;
                engine::bytes_to_clr(registry, &layout, native, clr)
            }
        }
    }
}

/// A managed array stored in place as exactly `count` native elements
/// (`ByValArray`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedArray {
    pub element: ElementStrategy,
    pub count: u32,
}

impl FixedArray {
    fn is_ansi_chars(&self) -> bool {
        matches!(self.element, ElementStrategy::Scalar(ScalarStrategy::AnsiChar(_)))
    }

    fn holds_elements(&self, cx: &MarshalContext<'_>, array: &ObjectHandle) -> bool {
        cx.heap.array_element_size(array).ok() == Some(self.element.managed_size() as usize)
    }
}

impl ReferenceMarshaler for FixedArray {
    fn tag(&self) -> MarshalTag {
        if self.is_ansi_chars() {
            MarshalTag::FixedCharArrayAnsi
        } else {
            MarshalTag::FixedArray
        }
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::IN_PLACE_ARRAY
    }

    fn native_size(&self) -> u32 {
        self.element.native_size().saturating_mul(self.count)
    }

    fn alignment_requirement(&self) -> u32 {
        self.element.alignment_requirement()
    }

    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        _cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError> {
        native.fill(0);
        let Some(value) = value else {
            return Ok(());
        };
        if !self.holds_elements(cx, value) {
            return Err(MarshalError::TypeMismatch {
                expected: format!("array of {}-byte elements", self.element.managed_size()),
            });
        }
        let (len, data) = cx.heap.array_data(value)?;
        if len < self.count as usize {
            return Err(MarshalError::ArrayLengthMismatch {
                expected: self.count,
                actual: len,
            });
        }

        let ms = self.element.managed_size() as usize;
        let ns = self.element.native_size() as usize;
        // extra managed elements are dropped
        for (clr, out) in data.chunks_exact(ms).zip(native.chunks_exact_mut(ns)) {
            self.element.to_native(cx.registry, clr, out)?;
        }
        Ok(())
    }

    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError> {
        let ms = self.element.managed_size() as usize;
        let ns = self.element.native_size() as usize;
        let mut data = vec![0; ms * self.count as usize];
        for (out, element) in data.chunks_exact_mut(ms).zip(native.chunks_exact(ns)) {
            self.element.to_clr(cx.registry, element, out)?;
        }

        if let Some(p) = previous {
            if self.holds_elements(cx, p) && cx.heap.array_len(p).ok() == Some(self.count as usize) {
                cx.heap.write_array(p, &data)?;
                return Ok(Some(p.clone()));
            }
        }
        Ok(Some(cx.heap.alloc_array_from(ms, data)))
    }

    fn destroy_native(&self, _registry: &LayoutRegistry, native: &mut [u8]) {
        native.fill(0);
    }
}

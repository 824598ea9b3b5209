//! Drives the slots of a layout table over a managed instance and a native
//! buffer.
//!
//! Managed data is only ever touched through an [`ObjectHandle`], and every
//! field re-resolves it, so a collection triggered by one field's allocation
//! can never leave a stale address behind for the next one.
use super::{
    cleanup::CleanupList,
    illegal::IllegalReason,
    scalar::ScalarMarshaler,
    slot::Strategy,
    MarshalContext,
};
use crate::{
    error::MarshalError,
    layout::{FieldLayoutEntry, LayoutRegistry, TypeLayout},
    value::ObjectHandle,
};
use tracing::{debug, warn};

fn not_marshalable(entry: &FieldLayoutEntry, reason: IllegalReason) -> MarshalError {
    MarshalError::FieldNotMarshalable {
        type_name: entry.declaring_type.clone(),
        field: entry.descriptor.name.clone(),
        reason,
    }
}

fn check_buffer(layout: &TypeLayout, len: usize) -> Result<(), MarshalError> {
    let required = layout.native_size as usize;
    if len < required {
        return Err(MarshalError::BufferTooSmall {
            required,
            actual: len,
        });
    }
    Ok(())
}

fn find_entry<'l>(layout: &'l TypeLayout, field: &str) -> Result<&'l FieldLayoutEntry, MarshalError> {
    layout
        .entries
        .iter()
        .find(|e| e.descriptor.name == field)
        .ok_or_else(|| MarshalError::UnknownField {
            type_name: layout.name.clone(),
            field: field.to_string(),
        })
}

/// Writes the native form of `instance` into `native`.
///
/// Transient allocations go to `cleanup` when one is given; otherwise they
/// belong to the buffer and [`destroy_native_buffer`] releases them. On
/// error the buffer is left partially written and must be discarded, while
/// entries already in `cleanup` stay valid.
pub fn convert_managed_to_native(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    instance: &ObjectHandle,
    native: &mut [u8],
    cleanup: Option<&mut CleanupList>,
) -> Result<(), MarshalError> {
    check_buffer(layout, native.len())?;
    debug!("marshaling {} to native ({} bytes)", layout.name, layout.native_size);
    update_native_at(
        cx,
        layout,
        instance,
        0,
        &mut native[..layout.native_size as usize],
        cleanup,
    )
}

pub fn convert_native_to_managed(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    native: &[u8],
    instance: &ObjectHandle,
) -> Result<(), MarshalError> {
    check_buffer(layout, native.len())?;
    debug!("marshaling {} to managed", layout.name);
    update_clr_at(cx, layout, &native[..layout.native_size as usize], instance, 0)
}

/// Releases everything the buffer owns and zeroes the released fields.
/// Never fails, and calling it twice is harmless.
pub fn destroy_native_buffer(registry: &LayoutRegistry, layout: &TypeLayout, native: &mut [u8]) {
    if native.len() < layout.native_size as usize {
        warn!(
            "not destroying {}: buffer of {} bytes is smaller than the layout",
            layout.name,
            native.len()
        );
        return;
    }
    debug!("destroying native {}", layout.name);
    destroy_at(registry, layout, native);
}

/// Converts a single field of `instance`.
pub fn convert_field_to_native(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    field: &str,
    instance: &ObjectHandle,
    native: &mut [u8],
    cleanup: Option<&mut CleanupList>,
) -> Result<(), MarshalError> {
    check_buffer(layout, native.len())?;
    field_to_native(cx, find_entry(layout, field)?, instance, 0, native, cleanup)
}

pub fn convert_field_to_managed(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    field: &str,
    native: &[u8],
    instance: &ObjectHandle,
) -> Result<(), MarshalError> {
    check_buffer(layout, native.len())?;
    field_to_clr(cx, find_entry(layout, field)?, native, instance, 0)
}

fn field_to_native(
    cx: &mut MarshalContext<'_>,
    entry: &FieldLayoutEntry,
    instance: &ObjectHandle,
    base: usize,
    native: &mut [u8],
    cleanup: Option<&mut CleanupList>,
) -> Result<(), MarshalError> {
    if let Strategy::Illegal(i) = entry.slot.strategy() {
        return Err(not_marshalable(entry, i.reason));
    }
    entry.slot.update_native(
        cx,
        instance,
        base + entry.managed.offset as usize,
        &mut native[entry.native.range()],
        cleanup,
    )
}

fn field_to_clr(
    cx: &mut MarshalContext<'_>,
    entry: &FieldLayoutEntry,
    native: &[u8],
    instance: &ObjectHandle,
    base: usize,
) -> Result<(), MarshalError> {
    if let Strategy::Illegal(i) = entry.slot.strategy() {
        return Err(not_marshalable(entry, i.reason));
    }
    entry.slot.update_clr(
        cx,
        &native[entry.native.range()],
        instance,
        base + entry.managed.offset as usize,
    )
}

/// Converts the fields of `layout` stored at `base` inside `instance`, which
/// is either the instance itself or a value type embedded in it.
pub(crate) fn update_native_at(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    instance: &ObjectHandle,
    base: usize,
    native: &mut [u8],
    mut cleanup: Option<&mut CleanupList>,
) -> Result<(), MarshalError> {
    if layout.blittable {
        let clr = cx
            .heap
            .read_bytes(instance, base, layout.native_size as usize)?;
        native[..clr.len()].copy_from_slice(&clr);
        return Ok(());
    }
    for entry in &layout.entries {
        field_to_native(cx, entry, instance, base, native, cleanup.as_deref_mut())?;
    }
    Ok(())
}

pub(crate) fn update_clr_at(
    cx: &mut MarshalContext<'_>,
    layout: &TypeLayout,
    native: &[u8],
    instance: &ObjectHandle,
    base: usize,
) -> Result<(), MarshalError> {
    if layout.blittable {
        cx.heap
            .write_bytes(instance, base, &native[..layout.native_size as usize])?;
        return Ok(());
    }
    for entry in &layout.entries {
        field_to_clr(cx, entry, native, instance, base)?;
    }
    Ok(())
}

pub(crate) fn destroy_at(registry: &LayoutRegistry, layout: &TypeLayout, native: &mut [u8]) {
    if layout.blittable {
        return;
    }
    for entry in &layout.entries {
        entry
            .slot
            .destroy_native(registry, &mut native[entry.native.range()]);
    }
}

/// Converts a value type without object references straight from its
/// managed bytes, as found in array elements.
pub(crate) fn bytes_to_native(
    registry: &LayoutRegistry,
    layout: &TypeLayout,
    clr: &[u8],
    native: &mut [u8],
) -> Result<(), MarshalError> {
    if layout.blittable {
        let n = layout.native_size as usize;
        native[..n].copy_from_slice(&clr[..n]);
        return Ok(());
    }
    for entry in &layout.entries {
        let clr = &clr[entry.managed.range()];
        let out = &mut native[entry.native.range()];
        match entry.slot.strategy() {
            Strategy::Scalar(s) => s.scalar_update_native(clr, out, registry.config())?,
            Strategy::NestedValue(n) => {
                let nested = registry.resolve(n.nested)?;
                bytes_to_native(registry, &nested, clr, out)?;
            }
            Strategy::Illegal(i) => return Err(not_marshalable(entry, i.reason)),
            Strategy::Reference(_) => panic!(
                "{} holds an object reference and has no byte-level conversion",
                layout.name
            ),
        }
    }
    Ok(())
}

pub(crate) fn bytes_to_clr(
    registry: &LayoutRegistry,
    layout: &TypeLayout,
    native: &[u8],
    clr: &mut [u8],
) -> Result<(), MarshalError> {
    if layout.blittable {
        let n = layout.native_size as usize;
        clr[..n].copy_from_slice(&native[..n]);
        return Ok(());
    }
    for entry in &layout.entries {
        let src = &native[entry.native.range()];
        let out = &mut clr[entry.managed.range()];
        match entry.slot.strategy() {
            Strategy::Scalar(s) => s.scalar_update_clr(src, out)?,
            Strategy::NestedValue(n) => {
                let nested = registry.resolve(n.nested)?;
                bytes_to_clr(registry, &nested, src, out)?;
            }
            Strategy::Illegal(i) => return Err(not_marshalable(entry, i.reason)),
            Strategy::Reference(_) => panic!(
                "{} holds an object reference and has no byte-level conversion",
                layout.name
            ),
        }
    }
    Ok(())
}

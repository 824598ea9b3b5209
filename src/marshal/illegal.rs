use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a field was classified as not marshalable.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IllegalReason {
    #[error("the field is marked as not marshalable")]
    Unmarshalable,
    #[error("the field type has no native representation")]
    UnsupportedType,
    #[error("custom marshalers are not supported on fields")]
    CustomMarshaler,
    #[error("the MarshalAs annotation does not apply to the field type")]
    AnnotationMismatch,
    #[error("ByValTStr requires a positive SizeConst")]
    FixedStringWithoutSize,
    #[error("ByValArray requires a positive SizeConst")]
    FixedArrayWithoutSize,
    #[error("array fields must be marshaled as ByValArray")]
    ArrayWithoutByValArray,
    #[error("the array element type cannot be embedded in place")]
    UnmarshalableArrayElement,
    #[error("the nested type does not have sequential or explicit layout")]
    NonSequentialNestedLayout,
    #[error("the nested type's layout could not be computed")]
    NestedLayoutFailed,
    #[error("the field type requires COM interop support, which is disabled")]
    PlatformSpecific,
}

/// Placeholder for a field that cannot be marshaled. It takes no native
/// space (size 0, alignment 1) and faults when the field is converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Illegal {
    pub reason: IllegalReason,
    pub managed_size: u32,
    pub managed_alignment: u32,
    /// The managed side is still an object reference.
    pub is_reference: bool,
}

impl Illegal {
    pub fn new(
        reason: IllegalReason,
        managed_size: u32,
        managed_alignment: u32,
        is_reference: bool,
    ) -> Self {
        Self {
            reason,
            managed_size,
            managed_alignment: managed_alignment.max(1),
            is_reference,
        }
    }
}

use super::{
    array::FixedArray,
    category::NativeFieldCategory,
    cleanup::CleanupList,
    handles::{Delegate, Interface, SafeHandle},
    nested::NestedLayoutClass,
    slot::MarshalTag,
    string::{FixedString, NativeString},
    variant::Variant,
    MarshalContext,
};
use crate::{error::MarshalError, layout::LayoutRegistry, value::ObjectHandle};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// General protocol for fields whose managed side is an object reference.
#[enum_dispatch]
pub trait ReferenceMarshaler {
    fn tag(&self) -> MarshalTag;
    fn category(&self) -> NativeFieldCategory;
    fn native_size(&self) -> u32;
    fn alignment_requirement(&self) -> u32;

    /// Writes the native form of `value` (`None` is a null reference).
    /// Anything allocated on the way goes to `cleanup` when one is given,
    /// and is otherwise owned by the native buffer.
    fn update_native(
        &self,
        cx: &mut MarshalContext<'_>,
        value: Option<&ObjectHandle>,
        native: &mut [u8],
        cleanup: Option<&mut CleanupList>,
    ) -> Result<(), MarshalError>;

    /// Produces the managed value for `native`, reusing `previous` when its
    /// representation allows it.
    fn update_clr(
        &self,
        cx: &mut MarshalContext<'_>,
        native: &[u8],
        previous: Option<&ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, MarshalError>;

    fn destroy_native(&self, registry: &LayoutRegistry, native: &mut [u8]);
}

#[enum_dispatch(ReferenceMarshaler)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReferenceStrategy {
    NestedLayoutClass,
    NativeString,
    FixedString,
    FixedArray,
    Delegate,
    SafeHandle,
    Interface,
    Variant,
}

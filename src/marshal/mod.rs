//! Field marshaling: the strategy catalog, the per-field slot that holds
//! one strategy in place, the classifier that picks it, and the engine that
//! drives a whole layout table.
use crate::{
    config::MarshalConfig,
    error::MarshalError,
    layout::LayoutRegistry,
    types::TypeId,
    value::{ManagedHeap, ObjectHandle},
};

pub mod array;
pub mod category;
pub mod classify;
pub mod cleanup;
pub mod engine;
pub mod handles;
pub mod illegal;
pub mod nested;
pub mod reference;
pub mod scalar;
pub mod slot;
pub mod string;
pub mod variant;

pub use category::NativeFieldCategory;
pub use classify::{Classification, ClassifierFlags, ManagedShape, NativeTypeClassifier};
pub use cleanup::{CleanupEntry, CleanupList};
pub use engine::{
    convert_field_to_managed, convert_field_to_native, convert_managed_to_native,
    convert_native_to_managed, destroy_native_buffer,
};
pub use illegal::{Illegal, IllegalReason};
pub use reference::{ReferenceMarshaler, ReferenceStrategy};
pub use scalar::{ScalarMarshaler, ScalarStrategy};
pub use slot::{MarshalSlot, MarshalTag, SlotHeader, Strategy, MAX_STRATEGY_SIZE};

/// Everything a conversion needs besides the buffers themselves.
pub struct MarshalContext<'a> {
    pub heap: &'a mut ManagedHeap,
    pub registry: &'a LayoutRegistry,
}

impl<'a> MarshalContext<'a> {
    pub fn new(heap: &'a mut ManagedHeap, registry: &'a LayoutRegistry) -> Self {
        Self { heap, registry }
    }

    pub fn config(&self) -> &'a MarshalConfig {
        self.registry.config()
    }

    /// Allocates a zeroed managed instance sized for `id`'s managed layout.
    pub fn new_instance(&mut self, id: TypeId) -> Result<ObjectHandle, MarshalError> {
        let layout = self.registry.layout(id)?;
        Ok(self
            .heap
            .alloc_instance(id, layout.managed_size as usize))
    }
}

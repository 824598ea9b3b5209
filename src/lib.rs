//! Field-level marshaling between managed objects and their native
//! (C-compatible) representation.
//!
//! A [`LayoutRegistry`] computes, once per type, a table describing where
//! each field lives on both sides and which strategy converts it. The
//! conversion entry points in [`marshal`] then walk that table over a
//! managed instance and a native buffer.
pub mod config;
pub mod error;
pub mod layout;
pub mod marshal;
pub mod types;
pub mod value;

pub use config::MarshalConfig;
pub use error::{HeapError, LayoutError, MarshalError, NativeError, PersistError, SchemaError};
pub use layout::{FieldLayoutEntry, LayoutRegistry, TypeLayout};
pub use marshal::{
    convert_field_to_managed, convert_field_to_native, convert_managed_to_native,
    convert_native_to_managed, destroy_native_buffer, CleanupList, MarshalContext,
};
pub use types::{MetadataSource, TypeId, TypeUniverse};
pub use value::{ManagedHeap, ObjectHandle};

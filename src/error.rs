use crate::marshal::IllegalReason;
use thiserror::Error;

/// Raised while computing a type's layout. These make the type unusable for
/// interop but never affect other types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("Type not found: {0}")]
    TypeNotFound(String),
    #[error("Type {0} uses automatic layout and has no native representation")]
    AutoLayout(String),
    #[error("Invalid packing size {packing} on {type_name}")]
    InvalidPacking { type_name: String, packing: u32 },
    #[error("Field {field} of explicit-layout type {type_name} has no offset")]
    MissingExplicitOffset { type_name: String, field: String },
    #[error("Field {field} of {type_name} has negative offset {offset}")]
    NegativeOffset {
        type_name: String,
        field: String,
        offset: i64,
    },
    #[error("Field {field} of {type_name} overlaps an object reference at offset {offset}")]
    OverlappingReference {
        type_name: String,
        field: String,
        offset: u32,
    },
    #[error("Object reference {field} of {type_name} is misaligned at offset {offset}")]
    MisalignedReference {
        type_name: String,
        field: String,
        offset: u32,
    },
    #[error("Layout of {0} overflows the addressable size")]
    SizeOverflow(String),
    #[error("Massive field layout detected: {type_name} is {size} bytes (limit {limit})")]
    TypeTooLarge {
        type_name: String,
        size: u64,
        limit: u32,
    },
    #[error("Type {0} embeds itself by value")]
    CircularLayout(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HeapError {
    #[error("Expected {expected} object, found {actual}")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Access of {len} bytes at offset {offset} exceeds object of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("SafeHandle has already been closed")]
    SafeHandleClosed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NativeError {
    #[error("Address {0:#x} does not belong to a live native allocation")]
    UnknownAllocation(usize),
    #[error("Native allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

/// Raised while converting a value in either direction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarshalError {
    #[error("Cannot marshal field '{field}' of type '{type_name}': {reason}")]
    FieldNotMarshalable {
        type_name: String,
        field: String,
        reason: IllegalReason,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error("Type '{type_name}' has no marshaled field '{field}'")]
    UnknownField { type_name: String, field: String },
    #[error("Native buffer of {actual} bytes is too small, {required} required")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("Array of length {actual} is shorter than the declared size {expected}")]
    ArrayLengthMismatch { expected: u32, actual: usize },
    #[error("Character U+{0:04X} has no ANSI mapping")]
    UnmappableChar(u16),
    #[error("Decimal scale {0} exceeds 28")]
    InvalidDecimal(u8),
    #[error("Value does not fit in an OLE currency")]
    CurrencyOverflow,
    #[error("Not a legal OLE automation date: {0}")]
    InvalidOleDate(f64),
    #[error("SafeHandle has been closed")]
    SafeHandleClosed,
    #[error("SafeHandle fields cannot be null")]
    NullSafeHandle,
    #[error("SafeHandle fields require a cleanup list")]
    CleanupListRequired,
    #[error("SafeHandle fields cannot be replaced from native code")]
    SafeHandleFromNative,
    #[error("Unsupported VARIANT type {0:#06x}")]
    UnsupportedVariant(u16),
    #[error("Object of kind {0} cannot be stored in a VARIANT")]
    UnsupportedVariantValue(&'static str),
    #[error("Type reference token {0} was not restored before use")]
    UnrestoredTypeReference(u32),
    #[error("Expected an instance of {expected}")]
    TypeMismatch { expected: String },
}

/// Raised by [`crate::layout::persist`].
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Malformed layout file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Persisted type {0} is not known to the metadata source")]
    UnknownType(String),
    #[error("Persisted token {0} has no entry in the type table")]
    UnknownToken(u32),
    #[error("Field {field} of {type_name} no longer exists")]
    MissingField { type_name: String, field: String },
    #[error("Layout file version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Malformed schema: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Type declared twice: {0}")]
    DuplicateType(String),
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Cannot parse type '{0}'")]
    BadTypeSyntax(String),
}

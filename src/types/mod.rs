//! Resolved type metadata consumed by the layout planner and the classifier.
//!
//! Nothing in here parses assemblies: an external resolver hands over fully
//! resolved [`TypeDefinition`]s through the [`MetadataSource`] trait.
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub mod schema;
pub mod universe;

pub use universe::{reaches_by_value, MetadataSource, TypeUniverse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl Display for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    ValueType,
    Class,
    Delegate,
    SafeHandle,
    Interface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayoutKind {
    #[default]
    Auto,
    Sequential,
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CharSet {
    Ansi,
    Unicode,
    /// Resolved against the platform default at classification time.
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub layout: LayoutKind,
    /// `StructLayout.Pack`; 0 means the configured default.
    #[serde(default)]
    pub packing: u32,
    /// `StructLayout.Size`; the total size never drops below it.
    #[serde(default)]
    pub class_size: u32,
    #[serde(default)]
    pub char_set: CharSet,
    #[serde(default)]
    pub parent: Option<TypeId>,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>, kind: TypeKind, layout: LayoutKind) -> Self {
        Self {
            name: name.into(),
            kind,
            layout,
            packing: 0,
            class_size: 0,
            char_set: CharSet::Auto,
            parent: None,
            fields: vec![],
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_packing(mut self, packing: u32) -> Self {
        self.packing = packing;
        self
    }

    pub fn with_class_size(mut self, class_size: u32) -> Self {
        self.class_size = class_size;
        self
    }

    pub fn with_char_set(mut self, char_set: CharSet) -> Self {
        self.char_set = char_set;
        self
    }

    pub fn with_parent(mut self, parent: TypeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_value_type(&self) -> bool {
        self.kind == TypeKind::ValueType
    }
}

/// One instance field as delivered by the metadata resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub annotation: Option<MarshalAnnotation>,
    pub sequence: u32,
    /// `FieldOffset` for explicit layouts.
    #[serde(default)]
    pub explicit_offset: Option<i64>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType, sequence: u32) -> Self {
        Self {
            name: name.into(),
            field_type,
            annotation: None,
            sequence,
            explicit_offset: None,
        }
    }

    pub fn marshal_as(mut self, annotation: MarshalAnnotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn at_offset(mut self, offset: i64) -> Self {
        self.explicit_offset = Some(offset);
        self
    }

    pub fn native_type(&self) -> Option<NativeType> {
        self.annotation.as_ref().map(|a| a.native_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Boolean,
    Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    IntPtr,
    UIntPtr,
    FunctionPointer,
    String,
    Object,
    DateTime,
    Decimal,
    ValueType(TypeId),
    Class(TypeId),
    Array(Box<FieldType>),
    /// A resolved type the interop layer has no representation for
    /// (generic instantiations, byrefs, pointers to managed memory...).
    Unsupported(String),
}

impl FieldType {
    /// Size of the primitive in both representations, if it is one.
    pub fn primitive_size(&self) -> Option<u32> {
        use FieldType::*;
        let ptr = size_of::<usize>() as u32;
        Some(match self {
            Boolean | Int8 | UInt8 => 1,
            Char | Int16 | UInt16 => 2,
            Int32 | UInt32 | Float32 => 4,
            Int64 | UInt64 | Float64 => 8,
            IntPtr | UIntPtr | FunctionPointer => ptr,
            _ => return None,
        })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldType::Float32 | FieldType::Float64)
    }

    /// Whether the managed representation is an object reference.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Object | FieldType::Class(_) | FieldType::Array(_)
        )
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::ValueType(id) => write!(f, "valuetype {}", id),
            FieldType::Class(id) => write!(f, "class {}", id),
            FieldType::Array(elem) => write!(f, "{}[]", elem),
            FieldType::Unsupported(s) => write!(f, "unsupported({})", s),
            other => write!(f, "{}", format!("{:?}", other).to_lowercase()),
        }
    }
}

/// `MarshalAs` metadata attached to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarshalAnnotation {
    pub native_type: NativeType,
    #[serde(default)]
    pub size_const: Option<u32>,
    #[serde(default)]
    pub array_sub_type: Option<NativeType>,
}

impl MarshalAnnotation {
    pub fn new(native_type: NativeType) -> Self {
        Self {
            native_type,
            size_const: None,
            array_sub_type: None,
        }
    }

    pub fn by_val_str(size: u32) -> Self {
        Self {
            size_const: Some(size),
            ..Self::new(NativeType::ByValTStr)
        }
    }

    pub fn by_val_array(size: u32, sub_type: Option<NativeType>) -> Self {
        Self {
            native_type: NativeType::ByValArray,
            size_const: Some(size),
            array_sub_type: sub_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeType {
    Bool,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    SysInt,
    SysUInt,
    VariantBool,
    LPStr,
    LPWStr,
    LPTStr,
    LPUTF8Str,
    BStr,
    ByValTStr,
    ByValArray,
    Struct,
    Interface,
    IUnknown,
    Currency,
    FunctionPtr,
    /// A custom marshaler, identified by its metadata token.
    CustomMarshaler(u32),
    /// Explicitly marked as not marshalable.
    Unmarshalable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_sizes() {
        assert_eq!(FieldType::Int8.primitive_size(), Some(1));
        assert_eq!(FieldType::Char.primitive_size(), Some(2));
        assert_eq!(FieldType::Float32.primitive_size(), Some(4));
        assert_eq!(FieldType::UInt64.primitive_size(), Some(8));
        assert_eq!(
            FieldType::IntPtr.primitive_size(),
            Some(size_of::<usize>() as u32)
        );
        assert_eq!(FieldType::String.primitive_size(), None);
        assert_eq!(FieldType::DateTime.primitive_size(), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(FieldType::Int32.to_string(), "int32");
        assert_eq!(
            FieldType::Array(Box::new(FieldType::ValueType(TypeId(3)))).to_string(),
            "valuetype #3[]"
        );
    }
}

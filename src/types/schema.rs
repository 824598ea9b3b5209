//! JSON description of a set of types, used by `dump-layout` and by tests
//! that would rather not build [`TypeDefinition`]s by hand.
//!
//! ```json
//! { "types": [
//!     { "name": "Point", "kind": "ValueType", "layout": "Sequential",
//!       "fields": [ { "name": "x", "type": "int32" },
//!                   { "name": "label", "type": "string",
//!                     "marshal": { "native_type": "ByValTStr", "size_const": 8 } } ] }
//! ] }
//! ```
use super::{
    CharSet, FieldDescriptor, FieldType, LayoutKind, MarshalAnnotation, TypeDefinition, TypeId,
    TypeKind, TypeUniverse,
};
use crate::error::SchemaError;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct SchemaFile {
    pub types: Vec<TypeSchema>,
}

#[derive(Debug, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    pub kind: TypeKind,
    #[serde(default)]
    pub layout: LayoutKind,
    #[serde(default)]
    pub packing: u32,
    #[serde(default)]
    pub class_size: u32,
    #[serde(default)]
    pub char_set: CharSet,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub marshal: Option<MarshalAnnotation>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl SchemaFile {
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds the universe in two passes so that fields may name types
    /// declared later in the file.
    pub fn into_universe(self) -> Result<TypeUniverse, SchemaError> {
        let mut universe = TypeUniverse::new();
        let mut names = HashMap::new();
        for t in &self.types {
            if names.insert(t.name.clone(), universe.declare()).is_some() {
                return Err(SchemaError::DuplicateType(t.name.clone()));
            }
        }

        for t in self.types {
            let id = names[&t.name];
            let parent = match &t.parent {
                Some(p) => Some(lookup(&names, p)?),
                None => None,
            };
            let fields = t
                .fields
                .into_iter()
                .enumerate()
                .map(|(i, f)| {
                    Ok(FieldDescriptor {
                        field_type: parse_type(&f.field_type, &names)?,
                        name: f.name,
                        annotation: f.marshal,
                        sequence: i as u32,
                        explicit_offset: f.offset,
                    })
                })
                .collect::<Result<Vec<_>, SchemaError>>()?;
            universe.define(
                id,
                TypeDefinition {
                    name: t.name,
                    kind: t.kind,
                    layout: t.layout,
                    packing: t.packing,
                    class_size: t.class_size,
                    char_set: t.char_set,
                    parent,
                    fields,
                },
            );
        }
        Ok(universe)
    }
}

fn lookup(names: &HashMap<String, TypeId>, name: &str) -> Result<TypeId, SchemaError> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
}

pub fn parse_type(text: &str, names: &HashMap<String, TypeId>) -> Result<FieldType, SchemaError> {
    let text = text.trim();
    if let Some(elem) = text.strip_suffix("[]") {
        return Ok(FieldType::Array(Box::new(parse_type(elem, names)?)));
    }
    if let Some(name) = text.strip_prefix("valuetype ") {
        return Ok(FieldType::ValueType(lookup(names, name.trim())?));
    }
    if let Some(name) = text.strip_prefix("class ") {
        return Ok(FieldType::Class(lookup(names, name.trim())?));
    }
    Ok(match text {
        "bool" => FieldType::Boolean,
        "char" => FieldType::Char,
        "int8" | "sbyte" => FieldType::Int8,
        "uint8" | "byte" => FieldType::UInt8,
        "int16" => FieldType::Int16,
        "uint16" => FieldType::UInt16,
        "int32" => FieldType::Int32,
        "uint32" => FieldType::UInt32,
        "int64" => FieldType::Int64,
        "uint64" => FieldType::UInt64,
        "float32" => FieldType::Float32,
        "float64" => FieldType::Float64,
        "native int" | "intptr" => FieldType::IntPtr,
        "native uint" | "uintptr" => FieldType::UIntPtr,
        "method" | "fnptr" => FieldType::FunctionPointer,
        "string" => FieldType::String,
        "object" => FieldType::Object,
        "datetime" => FieldType::DateTime,
        "decimal" => FieldType::Decimal,
        other if other.starts_with('!') || other.ends_with('&') || other.ends_with('*') => {
            FieldType::Unsupported(other.to_string())
        }
        other => return Err(SchemaError::BadTypeSyntax(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetadataSource, NativeType};

    const POINT: &str = r#"{ "types": [
        { "name": "Label", "kind": "ValueType", "layout": "Sequential",
          "fields": [ { "name": "inner", "type": "valuetype Point" },
                      { "name": "text", "type": "string",
                        "marshal": { "native_type": "ByValTStr", "size_const": 8 } } ] },
        { "name": "Point", "kind": "ValueType", "layout": "Sequential",
          "fields": [ { "name": "x", "type": "int32" }, { "name": "y", "type": "int32" } ] }
    ] }"#;

    #[test]
    fn forward_references_resolve() {
        let universe = SchemaFile::from_json(POINT)
            .unwrap()
            .into_universe()
            .unwrap();
        let label = universe.find("Label").unwrap();
        let point = universe.find("Point").unwrap();
        let def = universe.definition(label).unwrap();
        assert_eq!(def.fields[0].field_type, FieldType::ValueType(point));
        assert_eq!(def.fields[1].sequence, 1);
        assert_eq!(
            def.fields[1].native_type(),
            Some(NativeType::ByValTStr)
        );
    }

    #[test]
    fn type_syntax() {
        let names = HashMap::from([("P".to_string(), TypeId(0))]);
        assert_eq!(
            parse_type("int32[]", &names).unwrap(),
            FieldType::Array(Box::new(FieldType::Int32))
        );
        assert_eq!(
            parse_type("class P", &names).unwrap(),
            FieldType::Class(TypeId(0))
        );
        assert!(matches!(
            parse_type("!T", &names).unwrap(),
            FieldType::Unsupported(_)
        ));
        assert!(matches!(
            parse_type("class Q", &names),
            Err(SchemaError::UnknownType(_))
        ));
        assert!(matches!(
            parse_type("quux", &names),
            Err(SchemaError::BadTypeSyntax(_))
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let text = r#"{ "types": [ { "name": "A", "kind": "Class" }, { "name": "A", "kind": "Class" } ] }"#;
        let err = SchemaFile::from_json(text).unwrap().into_universe();
        assert!(matches!(err, Err(SchemaError::DuplicateType(_))));
    }
}

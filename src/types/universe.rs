use super::{FieldType, NativeType, TypeDefinition, TypeId};
use crate::error::LayoutError;
use std::collections::HashSet;

/// Where layout computation gets its resolved metadata from.
pub trait MetadataSource: Send + Sync {
    fn definition(&self, id: TypeId) -> Option<&TypeDefinition>;
    fn find(&self, name: &str) -> Option<TypeId>;

    fn require(&self, id: TypeId) -> Result<&TypeDefinition, LayoutError> {
        self.definition(id)
            .ok_or_else(|| LayoutError::TypeNotFound(id.to_string()))
    }
}

/// A flat in-memory set of type definitions, indexed by [`TypeId`].
#[derive(Debug, Clone, Default)]
pub struct TypeUniverse {
    types: Vec<Option<TypeDefinition>>,
}

impl TypeUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves an id so that self-referencing or mutually referencing
    /// types can be built before their definitions exist.
    pub fn declare(&mut self) -> TypeId {
        self.types.push(None);
        TypeId(self.types.len() as u32 - 1)
    }

    pub fn define(&mut self, id: TypeId, definition: TypeDefinition) {
        self.types[id.0 as usize] = Some(definition);
    }

    pub fn add(&mut self, definition: TypeDefinition) -> TypeId {
        let id = self.declare();
        self.define(id, definition);
        id
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDefinition)> {
        self.types
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (TypeId(i as u32), t)))
    }
}

impl MetadataSource for TypeUniverse {
    fn definition(&self, id: TypeId) -> Option<&TypeDefinition> {
        self.types.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn find(&self, name: &str) -> Option<TypeId> {
        self.iter().find(|(_, t)| t.name == name).map(|(id, _)| id)
    }
}

fn by_value_edges(def: &TypeDefinition) -> impl Iterator<Item = TypeId> + '_ {
    fn embedded(t: &FieldType, in_place: bool) -> Option<TypeId> {
        match t {
            FieldType::ValueType(id) => Some(*id),
            // any other array is a reference to its elements
            FieldType::Array(elem) if in_place => embedded(elem, false),
            _ => None,
        }
    }
    def.fields
        .iter()
        .filter_map(|f| {
            let in_place = f
                .annotation
                .is_some_and(|a| a.native_type == NativeType::ByValArray);
            embedded(&f.field_type, in_place)
        })
        .chain(def.parent)
}

/// Whether `target` is embedded (by value or through a layout parent)
/// anywhere inside `from`, including `from == target`.
///
/// Layout of a type needs the layouts of exactly these types first, so a
/// positive answer for `reaches_by_value(meta, nested, owner)` means that
/// computing `nested` would wait on `owner` forever.
pub fn reaches_by_value(meta: &dyn MetadataSource, from: TypeId, target: TypeId) -> bool {
    let mut seen = HashSet::new();
    let mut pending = vec![from];
    while let Some(id) = pending.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(def) = meta.definition(id) {
            pending.extend(by_value_edges(def));
        }
    }
    false
}

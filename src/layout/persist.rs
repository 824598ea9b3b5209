//! Saving computed layout tables and loading them back in a later process.
//!
//! Type ids are only meaningful to the metadata source that handed them out,
//! so a saved table names types instead: every [`TypeRef`] is written as an
//! `Unbound` index into the file's type-name table. A loaded table must be
//! restored against live metadata before its first conversion.
use super::{LayoutRegistry, TypeLayout, TypeRef};
use crate::{
    error::PersistError,
    types::{MetadataSource, TypeId},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutFile {
    pub version: u32,
    /// Names of every type a slot refers to, indexed by `Unbound` token.
    pub types: Vec<String>,
    pub layouts: Vec<TypeLayout>,
}

struct TokenTable<'a> {
    meta: &'a dyn MetadataSource,
    names: Vec<String>,
    tokens: HashMap<TypeId, u32>,
}

impl TokenTable<'_> {
    fn unbind(&mut self, r: &mut TypeRef) -> Result<(), PersistError> {
        let TypeRef::Bound(id) = *r else {
            return Ok(());
        };
        let token = match self.tokens.get(&id) {
            Some(t) => *t,
            None => {
                let name = self
                    .meta
                    .definition(id)
                    .ok_or_else(|| PersistError::UnknownType(id.to_string()))?
                    .name
                    .clone();
                let t = self.names.len() as u32;
                self.names.push(name);
                self.tokens.insert(id, t);
                t
            }
        };
        *r = TypeRef::Unbound(token);
        Ok(())
    }
}

pub fn save_layouts(
    meta: &dyn MetadataSource,
    layouts: &[Arc<TypeLayout>],
) -> Result<String, PersistError> {
    let mut table = TokenTable {
        meta,
        names: vec![],
        tokens: HashMap::new(),
    };
    let mut saved = Vec::with_capacity(layouts.len());
    for layout in layouts {
        let mut layout = TypeLayout::clone(layout);
        for entry in &mut layout.entries {
            entry
                .slot
                .strategy_mut()
                .visit_type_refs(|r| table.unbind(r))?;
        }
        saved.push(layout);
    }
    let file = LayoutFile {
        version: FORMAT_VERSION,
        types: table.names,
        layouts: saved,
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

/// Parses a saved file. The layouts in it are not restored yet.
pub fn load_layouts(json: &str) -> Result<LayoutFile, PersistError> {
    let file: LayoutFile = serde_json::from_str(json)?;
    if file.version != FORMAT_VERSION {
        return Err(PersistError::VersionMismatch {
            found: file.version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(file)
}

/// Loads, restores and publishes every layout in `json`.
pub fn load_into(registry: &LayoutRegistry, json: &str) -> Result<Vec<Arc<TypeLayout>>, PersistError> {
    let mut file = load_layouts(json)?;
    let mut published = Vec::with_capacity(file.layouts.len());
    for mut layout in file.layouts.drain(..) {
        layout.restore(registry.metadata(), &file.types)?;
        published.push(registry.publish(layout)?);
    }
    Ok(published)
}

impl TypeLayout {
    /// Binds every type token against `meta` and refreshes field
    /// descriptors from it. Does nothing on a table that is already bound,
    /// so it is safe to call more than once.
    pub fn restore(&mut self, meta: &dyn MetadataSource, types: &[String]) -> Result<(), PersistError> {
        if self.restored {
            return Ok(());
        }
        let find = |name: &str| {
            meta.find(name)
                .ok_or_else(|| PersistError::UnknownType(name.to_string()))
        };

        let type_id = find(&self.name)?;
        for entry in &mut self.entries {
            entry.slot.strategy_mut().visit_type_refs(|r| {
                if let TypeRef::Unbound(token) = *r {
                    let name = types
                        .get(token as usize)
                        .ok_or(PersistError::UnknownToken(token))?;
                    *r = TypeRef::Bound(find(name)?);
                }
                Ok::<(), PersistError>(())
            })?;

            let declaring = meta.definition(find(&entry.declaring_type)?);
            entry.descriptor = declaring
                .and_then(|d| d.field(&entry.descriptor.name))
                .cloned()
                .ok_or_else(|| PersistError::MissingField {
                    type_name: entry.declaring_type.clone(),
                    field: entry.descriptor.name.clone(),
                })?;
        }

        debug!("restored layout of {}", self.name);
        self.type_id = type_id;
        self.restored = true;
        Ok(())
    }
}

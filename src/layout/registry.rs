//! The per-type layout cache. Each type is laid out at most once; callers
//! that arrive while a computation is running wait for it and share the
//! published table.
use super::{
    planner::{BasePlacement, LayoutPlanner, PlannerField},
    FieldLayoutEntry, TypeLayout, TypeRef,
};
use crate::{
    config::MarshalConfig,
    error::{LayoutError, MarshalError},
    marshal::{MarshalSlot, NativeTypeClassifier},
    types::{reaches_by_value, LayoutKind, MetadataSource, TypeId},
};
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, OnceLock,
};
use tracing::debug;

type LayoutCell = Arc<OnceLock<Result<Arc<TypeLayout>, LayoutError>>>;

pub struct LayoutRegistry {
    metadata: Arc<dyn MetadataSource>,
    config: MarshalConfig,
    cells: DashMap<TypeId, LayoutCell>,
    computations: AtomicUsize,
}

impl LayoutRegistry {
    pub fn new(metadata: Arc<dyn MetadataSource>, config: MarshalConfig) -> Self {
        Self {
            metadata,
            config,
            cells: DashMap::new(),
            computations: AtomicUsize::new(0),
        }
    }

    pub fn metadata(&self) -> &dyn MetadataSource {
        &*self.metadata
    }

    pub fn config(&self) -> &MarshalConfig {
        &self.config
    }

    fn cell(&self, id: TypeId) -> LayoutCell {
        // cloned out so the shard lock is released before any computation
        self.cells.entry(id).or_default().clone()
    }

    /// The layout of `id`, computing and publishing it on first request.
    /// Failures are cached just like successes.
    pub fn layout(&self, id: TypeId) -> Result<Arc<TypeLayout>, LayoutError> {
        self.cell(id).get_or_init(|| self.compute(id)).clone()
    }

    pub fn layout_by_name(&self, name: &str) -> Result<Arc<TypeLayout>, LayoutError> {
        let id = self
            .metadata
            .find(name)
            .ok_or_else(|| LayoutError::TypeNotFound(name.to_string()))?;
        self.layout(id)
    }

    pub fn resolve(&self, r: TypeRef) -> Result<Arc<TypeLayout>, MarshalError> {
        match r {
            TypeRef::Bound(id) => Ok(self.layout(id)?),
            TypeRef::Unbound(token) => Err(MarshalError::UnrestoredTypeReference(token)),
        }
    }

    /// Installs an externally produced table, such as a restored one. If the
    /// type already has a layout, that one wins and is returned.
    pub fn publish(&self, layout: TypeLayout) -> Result<Arc<TypeLayout>, LayoutError> {
        let id = layout.type_id;
        let layout = Arc::new(layout);
        self.cell(id).get_or_init(|| Ok(layout)).clone()
    }

    /// `(size, alignment)` of the native form of `id`.
    pub fn type_size(&self, id: TypeId) -> Result<(u32, u32), LayoutError> {
        Ok(self.layout(id)?.size_and_alignment())
    }

    /// How many layouts have been computed, as opposed to served from cache.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    fn compute(&self, id: TypeId) -> Result<Arc<TypeLayout>, LayoutError> {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let def = self.metadata.require(id)?;
        debug!("computing native layout of {}", def.name);

        if def.layout == LayoutKind::Auto {
            return Err(LayoutError::AutoLayout(def.name.clone()));
        }
        let packing = match def.packing {
            0 => self.config.default_packing,
            p => p,
        };

        let parent = match def.parent {
            Some(p) if reaches_by_value(self.metadata(), p, id) => {
                return Err(LayoutError::CircularLayout(def.name.clone()))
            }
            Some(p) => Some(self.layout(p)?),
            None => None,
        };

        let classifier =
            NativeTypeClassifier::new(self, id, self.config.classifier_flags(def.char_set));
        let mut order: Vec<_> = def.fields.iter().enumerate().collect();
        order.sort_by_key(|(_, f)| f.sequence);

        let mut classified = Vec::with_capacity(order.len());
        for (index, field) in &order {
            classified.push((*index, *field, classifier.classify(field)?));
        }

        let planner_fields: Vec<_> = classified
            .iter()
            .map(|(_, field, c)| PlannerField {
                name: &field.name,
                native_size: c.strategy.native_size(),
                native_alignment: c.strategy.alignment_requirement(),
                managed_size: c.managed.size,
                managed_alignment: c.managed.alignment,
                is_reference: c.managed.is_reference,
                holds_references: c.strategy.holds_references(),
                explicit_offset: field.explicit_offset,
            })
            .collect();
        let base = parent.as_ref().map(|p| BasePlacement {
            native_size: p.native_size,
            native_alignment: p.native_alignment,
            managed_size: p.managed_size,
            managed_alignment: p.managed_alignment,
        });
        let plan = LayoutPlanner::new(
            &def.name,
            def.layout,
            packing,
            def.class_size,
            self.config.max_type_size,
        )
        .plan(&planner_fields, base)?;

        let mut entries = parent
            .as_ref()
            .map(|p| p.entries.clone())
            .unwrap_or_default();
        for ((index, field, c), (native, managed)) in classified
            .into_iter()
            .zip(plan.native.into_iter().zip(plan.managed))
        {
            entries.push(FieldLayoutEntry {
                descriptor: field.clone(),
                declaring_type: def.name.clone(),
                slot: MarshalSlot::new(index as u32, c.strategy).placed_at(native.offset),
                native,
                managed,
                sequence: field.sequence,
            });
        }

        let blittable = plan.native_size == plan.managed_size
            && entries
                .iter()
                .all(|e| e.slot.strategy().is_blittable() && e.native == e.managed);
        let has_references = entries.iter().any(|e| e.slot.strategy().holds_references());
        let managed_sequential =
            plan.managed_sequential && parent.as_ref().map_or(true, |p| p.managed_sequential);

        let layout = TypeLayout {
            type_id: id,
            name: def.name.clone(),
            kind: def.kind,
            layout_kind: def.layout,
            packing,
            entries,
            native_size: plan.native_size,
            native_alignment: plan.native_alignment,
            managed_size: plan.managed_size,
            managed_alignment: plan.managed_alignment,
            blittable,
            managed_sequential,
            has_references,
            restored: true,
        };
        debug!(
            "published layout of {}: {} fields, {} bytes native, {} bytes managed{}",
            layout.name,
            layout.entries.len(),
            layout.native_size,
            layout.managed_size,
            if layout.blittable { ", blittable" } else { "" }
        );
        Ok(Arc::new(layout))
    }
}

//! Assigns native and managed placements to the fields of one type.
//!
//! Both sides run the same algorithm independently, each with its own sizes
//! and alignments, so field order and padding may differ between them.
use super::{align_up, RawFieldPlacement};
use crate::{error::LayoutError, marshal::slot::REFERENCE_SIZE, types::LayoutKind};
use tracing::trace;

pub const MAX_PACKING_SIZE: u32 = 128;

/// What the planner needs to know about one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerField<'a> {
    pub name: &'a str,
    pub native_size: u32,
    pub native_alignment: u32,
    pub managed_size: u32,
    pub managed_alignment: u32,
    /// The managed side is an object reference.
    pub is_reference: bool,
    /// The managed side is, or embeds, an object reference.
    pub holds_references: bool,
    pub explicit_offset: Option<i64>,
}

/// Size and alignment already taken by the layout parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasePlacement {
    pub native_size: u32,
    pub native_alignment: u32,
    pub managed_size: u32,
    pub managed_alignment: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLayout {
    pub native: Vec<RawFieldPlacement>,
    pub managed: Vec<RawFieldPlacement>,
    pub native_size: u32,
    pub native_alignment: u32,
    pub managed_size: u32,
    pub managed_alignment: u32,
    /// Cleared when some field has no deterministic managed offset.
    pub managed_sequential: bool,
}

#[derive(Clone, Copy)]
enum Side {
    Native,
    Managed,
}

impl Side {
    fn size_align(self, f: &PlannerField<'_>) -> (u32, u32) {
        match self {
            Side::Native => (f.native_size, f.native_alignment.max(1)),
            Side::Managed => (f.managed_size, f.managed_alignment.max(1)),
        }
    }
}

struct SidePlan {
    fields: Vec<RawFieldPlacement>,
    size: u32,
    alignment: u32,
}

pub struct LayoutPlanner<'a> {
    type_name: &'a str,
    kind: LayoutKind,
    packing: u32,
    class_size: u32,
    max_size: u32,
}

impl<'a> LayoutPlanner<'a> {
    pub fn new(type_name: &'a str, kind: LayoutKind, packing: u32, class_size: u32, max_size: u32) -> Self {
        Self {
            type_name,
            kind,
            packing,
            class_size,
            max_size,
        }
    }

    pub fn plan(
        &self,
        fields: &[PlannerField<'_>],
        base: Option<BasePlacement>,
    ) -> Result<PlannedLayout, LayoutError> {
        if !self.packing.is_power_of_two() || self.packing > MAX_PACKING_SIZE {
            return Err(LayoutError::InvalidPacking {
                type_name: self.type_name.to_string(),
                packing: self.packing,
            });
        }
        let base = base.unwrap_or_default();

        let (native, managed) = match self.kind {
            LayoutKind::Explicit => {
                let offsets = self.explicit_offsets(fields)?;
                let native = self.explicit(
                    fields,
                    &offsets,
                    Side::Native,
                    base.native_size,
                    base.native_alignment,
                )?;
                let managed = self.explicit(
                    fields,
                    &offsets,
                    Side::Managed,
                    base.managed_size,
                    base.managed_alignment,
                )?;
                self.check_references(fields, &managed.fields)?;
                (native, managed)
            }
            _ => (
                self.sequential(fields, Side::Native, base.native_size, base.native_alignment)?,
                self.sequential(fields, Side::Managed, base.managed_size, base.managed_alignment)?,
            ),
        };

        // the runtime is free to reorder object references among themselves
        let managed_sequential =
            self.kind == LayoutKind::Sequential && !fields.iter().any(|f| f.holds_references);

        trace!(
            "planned {}: native {} (align {}), managed {} (align {})",
            self.type_name,
            native.size,
            native.alignment,
            managed.size,
            managed.alignment
        );
        Ok(PlannedLayout {
            native: native.fields,
            managed: managed.fields,
            native_size: native.size,
            native_alignment: native.alignment,
            managed_size: managed.size,
            managed_alignment: managed.alignment,
            managed_sequential,
        })
    }

    fn overflow(&self) -> LayoutError {
        LayoutError::SizeOverflow(self.type_name.to_string())
    }

    fn check_size(&self, size: u32) -> Result<(), LayoutError> {
        if size > self.max_size {
            return Err(LayoutError::TypeTooLarge {
                type_name: self.type_name.to_string(),
                size: size as u64,
                limit: self.max_size,
            });
        }
        Ok(())
    }

    fn finish(&self, end: u32, alignment: u32, fields: Vec<RawFieldPlacement>) -> Result<SidePlan, LayoutError> {
        let size = align_up(end, alignment)
            .ok_or_else(|| self.overflow())?
            .max(self.class_size)
            .max(1);
        self.check_size(size)?;
        Ok(SidePlan {
            fields,
            size,
            alignment,
        })
    }

    fn sequential(
        &self,
        fields: &[PlannerField<'_>],
        side: Side,
        base_size: u32,
        base_alignment: u32,
    ) -> Result<SidePlan, LayoutError> {
        let mut offset = base_size;
        let mut max_alignment = base_alignment.max(1);
        let mut placed = Vec::with_capacity(fields.len());

        for f in fields {
            let (size, natural) = side.size_align(f);
            let field_align = natural.min(self.packing);
            max_alignment = max_alignment.max(field_align);

            let aligned = align_up(offset, field_align).ok_or_else(|| self.overflow())?;
            offset = aligned.checked_add(size).ok_or_else(|| self.overflow())?;
            self.check_size(offset)?;
            placed.push(RawFieldPlacement::new(aligned, size, field_align));
        }

        self.finish(offset, max_alignment, placed)
    }

    fn explicit_offsets(&self, fields: &[PlannerField<'_>]) -> Result<Vec<u32>, LayoutError> {
        fields
            .iter()
            .map(|f| match f.explicit_offset {
                None => Err(LayoutError::MissingExplicitOffset {
                    type_name: self.type_name.to_string(),
                    field: f.name.to_string(),
                }),
                Some(o) if o < 0 => Err(LayoutError::NegativeOffset {
                    type_name: self.type_name.to_string(),
                    field: f.name.to_string(),
                    offset: o,
                }),
                Some(o) => u32::try_from(o).map_err(|_| LayoutError::TypeTooLarge {
                    type_name: self.type_name.to_string(),
                    size: o as u64,
                    limit: self.max_size,
                }),
            })
            .collect()
    }

    fn explicit(
        &self,
        fields: &[PlannerField<'_>],
        offsets: &[u32],
        side: Side,
        base_size: u32,
        base_alignment: u32,
    ) -> Result<SidePlan, LayoutError> {
        // offsets are relative to the end of the parent's fields
        let mut end = base_size;
        let mut max_alignment = base_alignment.max(1);
        let mut placed = Vec::with_capacity(fields.len());

        for (f, &o) in fields.iter().zip(offsets) {
            let (size, natural) = side.size_align(f);
            let field_align = natural.min(self.packing);
            max_alignment = max_alignment.max(field_align);

            let offset = base_size.checked_add(o).ok_or_else(|| self.overflow())?;
            let field_end = offset.checked_add(size).ok_or_else(|| self.overflow())?;
            self.check_size(field_end)?;
            end = end.max(field_end);
            placed.push(RawFieldPlacement::new(offset, size, field_align));
        }

        self.finish(end, max_alignment, placed)
    }

    /// Object references must be pointer aligned, and may only share bytes
    /// with another reference at exactly the same offset.
    fn check_references(
        &self,
        fields: &[PlannerField<'_>],
        managed: &[RawFieldPlacement],
    ) -> Result<(), LayoutError> {
        for (i, (f, p)) in fields.iter().zip(managed).enumerate() {
            if f.is_reference && p.offset % REFERENCE_SIZE != 0 {
                return Err(LayoutError::MisalignedReference {
                    type_name: self.type_name.to_string(),
                    field: f.name.to_string(),
                    offset: p.offset,
                });
            }
            for (g, q) in fields[..i].iter().zip(&managed[..i]) {
                if !p.overlaps(q) || !(f.holds_references || g.holds_references) {
                    continue;
                }
                let same_reference = f.is_reference && g.is_reference && p.offset == q.offset;
                if !same_reference {
                    return Err(LayoutError::OverlappingReference {
                        type_name: self.type_name.to_string(),
                        field: f.name.to_string(),
                        offset: p.offset,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PACKING_SIZE, MAX_TYPE_SIZE};

    fn scalar(name: &str, size: u32) -> PlannerField<'_> {
        PlannerField {
            name,
            native_size: size,
            native_alignment: size,
            managed_size: size,
            managed_alignment: size,
            is_reference: false,
            holds_references: false,
            explicit_offset: None,
        }
    }

    fn reference(name: &str) -> PlannerField<'_> {
        PlannerField {
            is_reference: true,
            holds_references: true,
            ..scalar(name, REFERENCE_SIZE)
        }
    }

    fn sequential(packing: u32) -> LayoutPlanner<'static> {
        LayoutPlanner::new("T", LayoutKind::Sequential, packing, 0, MAX_TYPE_SIZE)
    }

    #[test]
    fn natural_packing() {
        let fields = [scalar("a", 1), scalar("b", 4), scalar("c", 1), scalar("d", 8)];
        let plan = sequential(DEFAULT_PACKING_SIZE).plan(&fields, None).unwrap();
        let offsets: Vec<_> = plan.native.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!((plan.native_size, plan.native_alignment), (24, 8));
        assert_eq!(plan.native, plan.managed);
        assert!(plan.managed_sequential);
    }

    #[test]
    fn narrow_packing() {
        let fields = [scalar("a", 1), scalar("b", 4), scalar("c", 1), scalar("d", 8)];
        let plan = sequential(1).plan(&fields, None).unwrap();
        let offsets: Vec<_> = plan.native.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 1, 5, 6]);
        assert_eq!((plan.native_size, plan.native_alignment), (14, 1));

        let plan = sequential(2).plan(&fields, None).unwrap();
        let offsets: Vec<_> = plan.native.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 2, 6, 8]);
        assert_eq!(plan.native_size, 16);
    }

    #[test]
    fn native_and_managed_diverge() {
        // a WinBool: one byte managed, four native
        let fields = [
            PlannerField {
                native_size: 4,
                native_alignment: 4,
                ..scalar("flag", 1)
            },
            scalar("x", 2),
        ];
        let plan = sequential(8).plan(&fields, None).unwrap();
        assert_eq!(plan.native[1].offset, 4);
        assert_eq!(plan.managed[1].offset, 2);
        assert_eq!((plan.native_size, plan.managed_size), (8, 4));
    }

    #[test]
    fn empty_and_class_size() {
        let plan = sequential(8).plan(&[], None).unwrap();
        assert_eq!((plan.native_size, plan.native_alignment), (1, 1));

        let planner = LayoutPlanner::new("T", LayoutKind::Sequential, 8, 32, MAX_TYPE_SIZE);
        let plan = planner.plan(&[scalar("a", 4)], None).unwrap();
        assert_eq!(plan.native_size, 32);
        assert_eq!(plan.managed_size, 32);
    }

    #[test]
    fn zero_sized_fields_take_no_room() {
        let illegal = PlannerField {
            native_size: 0,
            native_alignment: 1,
            ..scalar("bad", 8)
        };
        let plan = sequential(8)
            .plan(&[scalar("a", 1), illegal, scalar("b", 1)], None)
            .unwrap();
        assert_eq!(plan.native[1], RawFieldPlacement::new(1, 0, 1));
        assert_eq!(plan.native[2].offset, 1);
        assert_eq!(plan.native_size, 2);
        assert_eq!(plan.managed[2].offset, 16);
    }

    #[test]
    fn inherits_base() {
        let base = BasePlacement {
            native_size: 6,
            native_alignment: 2,
            managed_size: 8,
            managed_alignment: 4,
        };
        let plan = sequential(8).plan(&[scalar("a", 4)], Some(base)).unwrap();
        assert_eq!(plan.native[0].offset, 8);
        assert_eq!(plan.managed[0].offset, 8);
        assert_eq!(plan.native_size, 12);
    }

    #[test]
    fn explicit_union() {
        let planner = LayoutPlanner::new("U", LayoutKind::Explicit, 8, 0, MAX_TYPE_SIZE);
        let fields = [
            PlannerField {
                explicit_offset: Some(0),
                ..scalar("i", 4)
            },
            PlannerField {
                explicit_offset: Some(0),
                ..scalar("f", 8)
            },
            PlannerField {
                explicit_offset: Some(9),
                ..scalar("b", 1)
            },
        ];
        let plan = planner.plan(&fields, None).unwrap();
        assert_eq!(plan.native[0].offset, plan.native[1].offset);
        assert_eq!((plan.native_size, plan.native_alignment), (16, 8));
        assert!(!plan.managed_sequential);
    }

    #[test]
    fn explicit_offset_errors() {
        let planner = LayoutPlanner::new("U", LayoutKind::Explicit, 8, 0, MAX_TYPE_SIZE);
        assert!(matches!(
            planner.plan(&[scalar("a", 4)], None),
            Err(LayoutError::MissingExplicitOffset { .. })
        ));
        let negative = PlannerField {
            explicit_offset: Some(-4),
            ..scalar("a", 4)
        };
        assert!(matches!(
            planner.plan(&[negative], None),
            Err(LayoutError::NegativeOffset { offset: -4, .. })
        ));
    }

    #[test]
    fn explicit_reference_rules() {
        let planner = LayoutPlanner::new("U", LayoutKind::Explicit, 8, 0, MAX_TYPE_SIZE);
        let at = |f: PlannerField<'static>, o: i64| PlannerField {
            explicit_offset: Some(o),
            ..f
        };

        let shared = [at(reference("a"), 0), at(reference("b"), 0)];
        assert!(planner.plan(&shared, None).is_ok());

        let overlapped = [at(reference("a"), 0), at(scalar("n", 4), 0)];
        assert!(matches!(
            planner.plan(&overlapped, None),
            Err(LayoutError::OverlappingReference { .. })
        ));

        let misaligned = [at(reference("a"), 2)];
        assert!(matches!(
            planner.plan(&misaligned, None),
            Err(LayoutError::MisalignedReference { offset: 2, .. })
        ));
    }

    #[test]
    fn limits() {
        assert!(matches!(
            sequential(3).plan(&[], None),
            Err(LayoutError::InvalidPacking { packing: 3, .. })
        ));
        assert!(matches!(
            sequential(256).plan(&[], None),
            Err(LayoutError::InvalidPacking { .. })
        ));

        let planner = LayoutPlanner::new("Big", LayoutKind::Sequential, 8, 0, 64);
        assert!(matches!(
            planner.plan(&[scalar("a", 8), scalar("b", 8)], None),
            Ok(_)
        ));
        let huge = PlannerField {
            native_size: 100,
            ..scalar("a", 1)
        };
        assert!(matches!(
            planner.plan(&[huge], None),
            Err(LayoutError::TypeTooLarge { size: 100, limit: 64, .. })
        ));
    }
}

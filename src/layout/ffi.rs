//! libffi descriptors for native layouts, used to check the planner against
//! the platform C ABI.
use super::{LayoutRegistry, TypeLayout};
use crate::{
    marshal::{array::ElementStrategy, string::StringEncoding, ReferenceStrategy, ScalarStrategy, Strategy},
    types::LayoutKind,
};
use libffi::middle::{Cif, Type};
use std::iter;

fn scalar_to_ffi(s: &ScalarStrategy) -> Type {
    match s {
        ScalarStrategy::Copy1(_) | ScalarStrategy::AnsiChar(_) | ScalarStrategy::CBool(_) => {
            Type::u8()
        }
        ScalarStrategy::Copy2(_) | ScalarStrategy::VariantBool(_) => Type::u16(),
        ScalarStrategy::Copy4(c) if c.float => Type::f32(),
        ScalarStrategy::Copy4(_) | ScalarStrategy::WinBool(_) => Type::i32(),
        ScalarStrategy::Copy8(c) if c.float => Type::f64(),
        ScalarStrategy::OleDate(_) => Type::f64(),
        ScalarStrategy::Copy8(_) | ScalarStrategy::OleCurrency(_) => Type::i64(),
        // DECIMAL: wReserved, scale, sign, Hi32, Lo64
        ScalarStrategy::OleDecimal(_) => Type::structure([
            Type::u16(),
            Type::u8(),
            Type::u8(),
            Type::u32(),
            Type::u64(),
        ]),
    }
}

/// libffi has no array type; `count` consecutive members lay out the same.
fn repeated(t: Type, count: u32) -> Type {
    Type::structure(vec![t; count as usize])
}

fn strategy_to_ffi(registry: &LayoutRegistry, strategy: &Strategy) -> Option<Type> {
    Some(match strategy {
        Strategy::Scalar(s) => scalar_to_ffi(s),
        Strategy::NestedValue(n) => native_abi_type(registry, &*registry.resolve(n.nested).ok()?)?,
        Strategy::Reference(r) => match r {
            ReferenceStrategy::FixedString(s) => {
                let unit = match s.encoding {
                    StringEncoding::Ansi | StringEncoding::Utf8 => Type::u8(),
                    _ => Type::u16(),
                };
                repeated(unit, s.length)
            }
            ReferenceStrategy::FixedArray(a) => {
                let element = match &a.element {
                    ElementStrategy::Scalar(s) => scalar_to_ffi(s),
                    ElementStrategy::Nested(n) => {
                        native_abi_type(registry, &*registry.resolve(n.nested).ok()?)?
                    }
                };
                repeated(element, a.count)
            }
            // vt and three reserved words, then two pointer-sized words
            ReferenceStrategy::Variant(_) => {
                Type::structure([Type::u64(), Type::pointer(), Type::pointer()])
            }
            _ => Type::pointer(),
        },
        Strategy::Illegal(_) => return None,
    })
}

/// Describes `layout` as a libffi aggregate. Only layouts a C compiler would
/// produce from a plain struct declaration have one: sequential, naturally
/// packed, without explicit size or inherited fields, and with every field
/// marshalable.
pub fn native_abi_type(registry: &LayoutRegistry, layout: &TypeLayout) -> Option<Type> {
    if layout.layout_kind != LayoutKind::Sequential
        || layout.entries.is_empty()
        || layout.entries.iter().any(|e| e.declaring_type != layout.name)
    {
        return None;
    }
    let natural = layout
        .entries
        .iter()
        .map(|e| e.slot.alignment_requirement())
        .max()
        .unwrap_or(1);
    if layout.packing < natural {
        return None;
    }
    let mut members = Vec::with_capacity(layout.entries.len());
    let mut end = 0;
    for e in &layout.entries {
        members.push(strategy_to_ffi(registry, e.slot.strategy())?);
        end = e.native.end();
    }
    // explicit class size padding is invisible to C
    if layout.native_size > super::align_up(end, layout.native_alignment)? {
        return None;
    }
    Some(Type::structure(members))
}

/// `(size, alignment)` that libffi computes for `ty`.
pub fn abi_size_align(ty: Type) -> (usize, usize) {
    let cif = Cif::new(iter::empty::<Type>(), ty);
    // SAFETY: a prepared cif always points at its (now initialized) return type
    unsafe {
        let rtype = (*cif.as_raw_ptr()).rtype;
        ((*rtype).size, (*rtype).alignment as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MarshalConfig,
        types::{FieldDescriptor, FieldType, MarshalAnnotation, TypeDefinition, TypeKind, TypeUniverse},
    };
    use std::sync::Arc;

    #[test]
    fn planner_agrees_with_libffi() {
        let mut u = TypeUniverse::new();
        let inner = u.add(
            TypeDefinition::new("Inner", TypeKind::ValueType, LayoutKind::Sequential)
                .with_field(FieldDescriptor::new("c", FieldType::UInt8, 0))
                .with_field(FieldDescriptor::new("d", FieldType::Float64, 1)),
        );
        let outer = u.add(
            TypeDefinition::new("Outer", TypeKind::ValueType, LayoutKind::Sequential)
                .with_field(FieldDescriptor::new("a", FieldType::Int8, 0))
                .with_field(FieldDescriptor::new("b", FieldType::Int32, 1))
                .with_field(FieldDescriptor::new("flag", FieldType::Boolean, 2))
                .with_field(FieldDescriptor::new("inner", FieldType::ValueType(inner), 3))
                .with_field(FieldDescriptor::new("s", FieldType::String, 4))
                .with_field(
                    FieldDescriptor::new(
                        "arr",
                        FieldType::Array(Box::new(FieldType::Int16)),
                        5,
                    )
                    .marshal_as(MarshalAnnotation::by_val_array(3, None)),
                ),
        );
        let registry = LayoutRegistry::new(Arc::new(u), MarshalConfig::default());
        for id in [inner, outer] {
            let layout = registry.layout(id).unwrap();
            let ty = native_abi_type(&registry, &layout).unwrap();
            assert_eq!(
                abi_size_align(ty),
                (layout.native_size as usize, layout.native_alignment as usize),
                "{}",
                layout.name
            );
        }
    }

    #[test]
    fn packed_layouts_have_no_c_equivalent() {
        let mut u = TypeUniverse::new();
        let packed = u.add(
            TypeDefinition::new("Packed", TypeKind::ValueType, LayoutKind::Sequential)
                .with_packing(1)
                .with_field(FieldDescriptor::new("a", FieldType::Int8, 0))
                .with_field(FieldDescriptor::new("b", FieldType::Int64, 1)),
        );
        let registry = LayoutRegistry::new(Arc::new(u), MarshalConfig::default());
        let layout = registry.layout(packed).unwrap();
        assert!(native_abi_type(&registry, &layout).is_none());
    }
}

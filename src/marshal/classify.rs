//! Maps a field's resolved type and `MarshalAs` annotation to a strategy.
//!
//! Rules are tried in a fixed order and the first one that applies decides.
//! Anything that cannot be marshaled becomes an [`Illegal`] slot instead of
//! an error, so the rest of the type still gets a layout and the fault is
//! only raised if that one field is ever converted.
use super::{
    array::{ElementStrategy, FixedArray},
    handles::{Delegate, Interface, SafeHandle},
    illegal::{Illegal, IllegalReason},
    nested::{NestedLayoutClass, NestedValueClass},
    scalar::{AnsiChar, CBool, OleCurrency, OleDate, OleDecimal, ScalarStrategy, VariantBool, WinBool},
    slot::{Strategy, REFERENCE_SIZE},
    string::{FixedString, NativeString, StringEncoding},
    variant::Variant,
};
use crate::{
    error::LayoutError,
    layout::{LayoutRegistry, TypeRef},
    types::{reaches_by_value, FieldDescriptor, FieldType, LayoutKind, NativeType, TypeId, TypeKind},
    value::POINTER_SIZE,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// ABI switches that influence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassifierFlags {
    /// Text defaults to the ANSI code page rather than UTF-16.
    pub ansi: bool,
    /// COM and OLE automation representations are available.
    pub platform_extensions: bool,
}

/// The managed footprint of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedShape {
    pub size: u32,
    pub alignment: u32,
    pub is_reference: bool,
}

impl ManagedShape {
    fn reference() -> Self {
        Self {
            size: REFERENCE_SIZE,
            alignment: REFERENCE_SIZE,
            is_reference: true,
        }
    }

    fn primitive(size: u32) -> Self {
        Self {
            size,
            alignment: size,
            is_reference: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub strategy: Strategy,
    pub managed: ManagedShape,
}

type Rule = Result<Strategy, IllegalReason>;

fn native_scalar(native: NativeType) -> Option<(u32, bool)> {
    use NativeType::*;
    Some(match native {
        I1 | U1 => (1, false),
        I2 | U2 => (2, false),
        I4 | U4 => (4, false),
        I8 | U8 => (8, false),
        R4 => (4, true),
        R8 => (8, true),
        SysInt | SysUInt => (POINTER_SIZE as u32, false),
        _ => return None,
    })
}

pub struct NativeTypeClassifier<'a> {
    registry: &'a LayoutRegistry,
    owner: TypeId,
    flags: ClassifierFlags,
}

impl<'a> NativeTypeClassifier<'a> {
    pub fn new(registry: &'a LayoutRegistry, owner: TypeId, flags: ClassifierFlags) -> Self {
        Self {
            registry,
            owner,
            flags,
        }
    }

    pub fn flags(&self) -> ClassifierFlags {
        self.flags
    }

    /// Only fails for faults that make the owning type itself unusable, such
    /// as a value type that contains itself.
    pub fn classify(&self, field: &FieldDescriptor) -> Result<Classification, LayoutError> {
        let managed = self.managed_shape(&field.field_type)?;
        let strategy = match self.strategy(field)? {
            Ok(s) => s,
            Err(reason) => {
                debug!(
                    "field {} ({}) is not marshalable: {}",
                    field.name, field.field_type, reason
                );
                Strategy::Illegal(Illegal::new(
                    reason,
                    managed.size,
                    managed.alignment,
                    managed.is_reference,
                ))
            }
        };
        Ok(Classification { strategy, managed })
    }

    pub fn managed_shape(&self, field_type: &FieldType) -> Result<ManagedShape, LayoutError> {
        if let Some(size) = field_type.primitive_size() {
            return Ok(ManagedShape::primitive(size));
        }
        Ok(match field_type {
            FieldType::DateTime => ManagedShape::primitive(8),
            FieldType::Decimal => ManagedShape {
                size: 16,
                alignment: 8,
                is_reference: false,
            },
            FieldType::ValueType(id) => {
                self.check_embeddable(*id)?;
                match self.registry.layout(*id) {
                    Ok(l) => ManagedShape {
                        size: l.managed_size,
                        alignment: l.managed_alignment,
                        is_reference: false,
                    },
                    // the field is Illegal anyway, it only needs some room
                    Err(_) => ManagedShape::primitive(POINTER_SIZE as u32),
                }
            }
            t if t.is_reference() => ManagedShape::reference(),
            _ => ManagedShape::primitive(POINTER_SIZE as u32),
        })
    }

    fn check_embeddable(&self, id: TypeId) -> Result<(), LayoutError> {
        if reaches_by_value(self.registry.metadata(), id, self.owner) {
            let name = self.registry.metadata().require(self.owner)?.name.clone();
            return Err(LayoutError::CircularLayout(name));
        }
        Ok(())
    }

    /// `count` elements of `element_size` bytes must fit under the type size
    /// limit, which also keeps every later product in range.
    fn check_in_place_size(&self, element_size: u32, count: u32) -> Result<(), LayoutError> {
        let size = u64::from(element_size) * u64::from(count);
        let limit = self.registry.config().max_type_size;
        if size > u64::from(limit) {
            let type_name = self.registry.metadata().require(self.owner)?.name.clone();
            return Err(LayoutError::TypeTooLarge {
                type_name,
                size,
                limit,
            });
        }
        Ok(())
    }

    fn strategy(&self, field: &FieldDescriptor) -> Result<Rule, LayoutError> {
        let annotation = field.annotation;
        let native = annotation.map(|a| a.native_type);

        // 1. explicit opt-out or no representation at all
        match native {
            Some(NativeType::Unmarshalable) => return Ok(Err(IllegalReason::Unmarshalable)),
            Some(NativeType::CustomMarshaler(_)) => {
                return Ok(Err(IllegalReason::CustomMarshaler))
            }
            _ => {}
        }

        // 2, 3, and single characters; dates and decimals are scalars too
        if let Some(rule) = self.scalar(&field.field_type, native) {
            return Ok(rule.map(Strategy::Scalar));
        }

        Ok(match &field.field_type {
            FieldType::Unsupported(_) => Err(IllegalReason::UnsupportedType),
            // 4. strings
            FieldType::String => self.string(native, annotation.and_then(|a| a.size_const))?,
            // 5. embedded value types
            FieldType::ValueType(id) => match native {
                None | Some(NativeType::Struct) => self.nested_value(*id)?.map(Strategy::NestedValue),
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            // 6 and 8. classes, delegates and handles
            FieldType::Class(id) => self.class(*id, native)?,
            // 7. in-place arrays
            FieldType::Array(element) => match annotation {
                Some(a) if a.native_type == NativeType::ByValArray => match a.size_const {
                    Some(count) if count > 0 => match self.element(element, a.array_sub_type)? {
                        Some(element) => {
                            let widest = element.native_size().max(element.managed_size());
                            self.check_in_place_size(widest, count)?;
                            Ok(Strategy::Reference(FixedArray { element, count }.into()))
                        }
                        None => Err(IllegalReason::UnmarshalableArrayElement),
                    },
                    _ => Err(IllegalReason::FixedArrayWithoutSize),
                },
                _ => Err(IllegalReason::ArrayWithoutByValArray),
            },
            // 9. `object` only exists as a COM construct
            FieldType::Object => {
                if !self.flags.platform_extensions {
                    Err(IllegalReason::PlatformSpecific)
                } else {
                    match native {
                        None | Some(NativeType::Struct) => Ok(Strategy::Reference(Variant.into())),
                        Some(NativeType::Interface | NativeType::IUnknown) => {
                            Ok(Strategy::Reference(Interface.into()))
                        }
                        Some(_) => Err(IllegalReason::AnnotationMismatch),
                    }
                }
            }
            // 10.
            _ => Err(IllegalReason::AnnotationMismatch),
        })
    }

    /// `None` when `field_type` is not a scalar at all.
    fn scalar(
        &self,
        field_type: &FieldType,
        native: Option<NativeType>,
    ) -> Option<Result<ScalarStrategy, IllegalReason>> {
        use NativeType as N;
        let platform = |s: ScalarStrategy| {
            if self.flags.platform_extensions {
                Ok(s)
            } else {
                Err(IllegalReason::PlatformSpecific)
            }
        };
        Some(match field_type {
            FieldType::Boolean => match native {
                None | Some(N::Bool) => Ok(WinBool.into()),
                Some(N::I1 | N::U1) => Ok(CBool.into()),
                Some(N::VariantBool) => platform(VariantBool.into()),
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            FieldType::Char => match native {
                None if self.flags.ansi => Ok(AnsiChar.into()),
                None | Some(N::I2 | N::U2) => Ok(ScalarStrategy::copy(2, false)?),
                Some(N::I1 | N::U1) => Ok(AnsiChar.into()),
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            FieldType::DateTime => match native {
                None => platform(OleDate.into()),
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            FieldType::Decimal => match native {
                None | Some(N::Struct) => platform(OleDecimal.into()),
                Some(N::Currency) => platform(OleCurrency.into()),
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            FieldType::FunctionPointer => match native {
                None | Some(N::FunctionPtr | N::SysInt | N::SysUInt) => {
                    Ok(ScalarStrategy::copy(POINTER_SIZE as u32, false)?)
                }
                Some(_) => Err(IllegalReason::AnnotationMismatch),
            },
            t => {
                let size = t.primitive_size()?;
                let wanted = (size, t.is_float());
                match native {
                    None => Ok(ScalarStrategy::copy(size, t.is_float())?),
                    Some(n) if native_scalar(n) == Some(wanted) => {
                        Ok(ScalarStrategy::copy(size, t.is_float())?)
                    }
                    Some(_) => Err(IllegalReason::AnnotationMismatch),
                }
            }
        })
    }

    fn string(
        &self,
        native: Option<NativeType>,
        size_const: Option<u32>,
    ) -> Result<Rule, LayoutError> {
        use NativeType as N;
        let default = if self.flags.ansi {
            StringEncoding::Ansi
        } else {
            StringEncoding::Unicode
        };
        let encoding = match native {
            None | Some(N::LPTStr) => default,
            Some(N::LPStr) => StringEncoding::Ansi,
            Some(N::LPWStr) => StringEncoding::Unicode,
            Some(N::LPUTF8Str) => StringEncoding::Utf8,
            Some(N::BStr) if self.flags.platform_extensions => StringEncoding::Bstr,
            Some(N::BStr) => return Ok(Err(IllegalReason::PlatformSpecific)),
            Some(N::ByValTStr) => {
                return Ok(match size_const {
                    Some(length) if length > 0 => {
                        self.check_in_place_size(default.unit() as u32, length)?;
                        Ok(Strategy::Reference(
                            FixedString {
                                encoding: default,
                                length,
                            }
                            .into(),
                        ))
                    }
                    _ => Err(IllegalReason::FixedStringWithoutSize),
                })
            }
            Some(_) => return Ok(Err(IllegalReason::AnnotationMismatch)),
        };
        Ok(Ok(Strategy::Reference(NativeString { encoding }.into())))
    }

    fn nested_value(&self, id: TypeId) -> Result<Result<NestedValueClass, IllegalReason>, LayoutError> {
        self.check_embeddable(id)?;
        let def = self.registry.metadata().require(id)?;
        if !def.is_value_type() {
            return Ok(Err(IllegalReason::UnsupportedType));
        }
        if def.layout == LayoutKind::Auto {
            return Ok(Err(IllegalReason::NonSequentialNestedLayout));
        }
        Ok(match self.registry.layout(id) {
            Ok(layout) => Ok(NestedValueClass::new(&layout)),
            Err(e) => {
                debug!("nested layout of {} failed: {}", def.name, e);
                Err(IllegalReason::NestedLayoutFailed)
            }
        })
    }

    /// Never computes the layout of the referenced class: classes may refer
    /// to each other in cycles, and the pointer is the same size either way.
    fn class(&self, id: TypeId, native: Option<NativeType>) -> Result<Rule, LayoutError> {
        use NativeType as N;
        let def = self.registry.metadata().require(id)?;
        let com = |s: Strategy| {
            if self.flags.platform_extensions {
                Ok(s)
            } else {
                Err(IllegalReason::PlatformSpecific)
            }
        };
        Ok(match (def.kind, native) {
            (TypeKind::Delegate, None | Some(N::FunctionPtr)) => {
                Ok(Strategy::Reference(Delegate.into()))
            }
            (TypeKind::SafeHandle, None) => Ok(Strategy::Reference(SafeHandle.into())),
            (TypeKind::Interface, None | Some(N::Interface | N::IUnknown))
            | (TypeKind::Class, Some(N::Interface | N::IUnknown)) => {
                com(Strategy::Reference(Interface.into()))
            }
            (TypeKind::Class, None | Some(N::Struct)) if def.layout == LayoutKind::Auto => {
                Err(IllegalReason::NonSequentialNestedLayout)
            }
            (TypeKind::Class, None | Some(N::Struct)) => Ok(Strategy::Reference(
                NestedLayoutClass {
                    nested: TypeRef::Bound(id),
                }
                .into(),
            )),
            (TypeKind::ValueType, _) => Err(IllegalReason::UnsupportedType),
            _ => Err(IllegalReason::AnnotationMismatch),
        })
    }

    /// Elements must be plain bytes on the managed side: scalars, or value
    /// types holding no object references.
    fn element(
        &self,
        element: &FieldType,
        sub_type: Option<NativeType>,
    ) -> Result<Option<ElementStrategy>, LayoutError> {
        if let Some(rule) = self.scalar(element, sub_type) {
            return Ok(rule.ok().map(ElementStrategy::Scalar));
        }
        Ok(match element {
            FieldType::ValueType(id) if matches!(sub_type, None | Some(NativeType::Struct)) => {
                match self.nested_value(*id)? {
                    Ok(n) if !n.has_references => Some(ElementStrategy::Nested(n)),
                    _ => None,
                }
            }
            _ => None,
        })
    }
}

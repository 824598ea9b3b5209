use serde::{Deserialize, Serialize};
use std::{fmt, ops::BitOr};

/// Classification of a field's native representation, built from
/// orthogonal sub-category bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeFieldCategory(u16);

impl NativeFieldCategory {
    pub const MAYBE_BLITTABLE: Self = Self(1 << 7);
    pub const FLOAT: Self = Self(1 << 8);
    pub const NESTED: Self = Self(1 << 9);
    pub const COM_ONLY: Self = Self(1 << 10);
    pub const COM_TYPE: Self = Self(1 << 11);
    pub const INTEGER: Self = Self(1 << 12);
    pub const ARRAY: Self = Self(1 << 13);
    pub const OTHER: Self = Self(1 << 14);

    pub const R4: Self = Self(Self::FLOAT.0 | Self::MAYBE_BLITTABLE.0);
    pub const R8: Self = Self(Self::FLOAT.0 | Self::MAYBE_BLITTABLE.0 | 0x1);
    pub const NESTED_LAYOUT_CLASS: Self = Self::NESTED;
    pub const NESTED_VALUE_CLASS: Self = Self(Self::NESTED.0 | Self::MAYBE_BLITTABLE.0);
    pub const DATE: Self = Self(Self::FLOAT.0 | Self::COM_TYPE.0);
    pub const IN_PLACE_ARRAY: Self = Self(Self::ARRAY.0 | Self::NESTED.0);
    pub const INTEGER_LIKE: Self = Self::INTEGER;
    pub const BLITTABLE_INTEGER: Self = Self(Self::INTEGER.0 | Self::MAYBE_BLITTABLE.0);
    pub const INTERFACE_TYPE: Self = Self::COM_ONLY;
    pub const COM_STRUCT: Self = Self(Self::COM_ONLY.0 | 0x1);
    pub const WELL_KNOWN: Self = Self::OTHER;
    pub const ILLEGAL: Self = Self(Self::OTHER.0 | 0x1);

    const NAMED: [(Self, &'static str); 14] = [
        (Self::R4, "R4"),
        (Self::R8, "R8"),
        (Self::NESTED_LAYOUT_CLASS, "NESTED_LAYOUT_CLASS"),
        (Self::NESTED_VALUE_CLASS, "NESTED_VALUE_CLASS"),
        (Self::DATE, "DATE"),
        (Self::IN_PLACE_ARRAY, "IN_PLACE_ARRAY"),
        (Self::INTEGER_LIKE, "INTEGER_LIKE"),
        (Self::BLITTABLE_INTEGER, "BLITTABLE_INTEGER"),
        (Self::INTERFACE_TYPE, "INTERFACE_TYPE"),
        (Self::COM_STRUCT, "COM_STRUCT"),
        (Self::WELL_KNOWN, "WELL_KNOWN"),
        (Self::ILLEGAL, "ILLEGAL"),
        (Self::MAYBE_BLITTABLE, "MAYBE_BLITTABLE"),
        (Self::FLOAT, "FLOAT"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True when every sub-category bit of `flags` is set.
    pub const fn contains(self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(c, _)| *c == self)
            .map(|(_, n)| *n)
    }

    pub fn is_maybe_blittable(self) -> bool {
        self.contains(Self::MAYBE_BLITTABLE)
    }

    pub fn is_float(self) -> bool {
        self.contains(Self::FLOAT)
    }

    pub fn is_nested(self) -> bool {
        self.contains(Self::NESTED)
    }

    pub fn is_com_only(self) -> bool {
        self.contains(Self::COM_ONLY)
    }

    pub fn is_illegal(self) -> bool {
        self == Self::ILLEGAL
    }
}

impl BitOr for NativeFieldCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for NativeFieldCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => f.write_str(n),
            None => write!(f, "NativeFieldCategory({:#06x})", self.0),
        }
    }
}

impl fmt::Display for NativeFieldCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::NativeFieldCategory as C;

    #[test]
    fn named_categories_are_distinct() {
        let all = [
            C::R4,
            C::R8,
            C::NESTED_LAYOUT_CLASS,
            C::NESTED_VALUE_CLASS,
            C::DATE,
            C::IN_PLACE_ARRAY,
            C::INTEGER_LIKE,
            C::BLITTABLE_INTEGER,
            C::INTERFACE_TYPE,
            C::COM_STRUCT,
            C::WELL_KNOWN,
            C::ILLEGAL,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn sub_categories() {
        assert!(C::R8.is_float() && C::R8.is_maybe_blittable());
        assert!(C::DATE.is_float() && !C::DATE.is_maybe_blittable());
        assert!(C::NESTED_VALUE_CLASS.is_nested() && C::NESTED_VALUE_CLASS.is_maybe_blittable());
        assert!(!C::NESTED_LAYOUT_CLASS.is_maybe_blittable());
        assert!(C::IN_PLACE_ARRAY.contains(C::ARRAY | C::NESTED));
        assert!(C::COM_STRUCT.is_com_only());
        assert!(C::ILLEGAL.is_illegal() && !C::WELL_KNOWN.is_illegal());
        assert_eq!(C::FLOAT | C::MAYBE_BLITTABLE, C::R4);
    }

    #[test]
    fn debug_uses_names() {
        assert_eq!(format!("{:?}", C::BLITTABLE_INTEGER), "BLITTABLE_INTEGER");
        assert_eq!(format!("{:?}", C::ARRAY), "NativeFieldCategory(0x2000)");
    }
}

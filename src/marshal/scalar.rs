//! Strategies whose managed side is plain unwrapped bytes.
use super::{category::NativeFieldCategory, slot::MarshalTag, string};
use crate::{config::MarshalConfig, error::MarshalError};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

/// Fast path shared by every scalar strategy: both sides are byte slices of
/// exactly `managed_size()` and `native_size()` bytes.
#[enum_dispatch]
pub trait ScalarMarshaler {
    fn tag(&self) -> MarshalTag;
    fn category(&self) -> NativeFieldCategory;
    fn native_size(&self) -> u32;
    fn managed_size(&self) -> u32;

    fn alignment_requirement(&self) -> u32 {
        self.native_size()
    }

    /// Bit-identical in both representations.
    fn is_blittable(&self) -> bool {
        false
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        config: &MarshalConfig,
    ) -> Result<(), MarshalError>;

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError>;
}

#[enum_dispatch(ScalarMarshaler)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarStrategy {
    Copy1,
    Copy2,
    Copy4,
    Copy8,
    AnsiChar,
    WinBool,
    CBool,
    VariantBool,
    OleDate,
    OleDecimal,
    OleCurrency,
}

macro_rules! copy_strategy {
    ($name:ident, $size:literal, $int:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct $name {
            pub float: bool,
        }

        impl ScalarMarshaler for $name {
            fn tag(&self) -> MarshalTag {
                MarshalTag::$name
            }

            fn category(&self) -> NativeFieldCategory {
                match (self.float, $size) {
                    (true, 4) => NativeFieldCategory::R4,
                    (true, _) => NativeFieldCategory::R8,
                    (false, _) => $int,
                }
            }

            fn native_size(&self) -> u32 {
                $size
            }

            fn managed_size(&self) -> u32 {
                $size
            }

            fn is_blittable(&self) -> bool {
                true
            }

            fn scalar_update_native(
                &self,
                clr: &[u8],
                native: &mut [u8],
                _config: &MarshalConfig,
            ) -> Result<(), MarshalError> {
                native[..$size].copy_from_slice(&clr[..$size]);
                Ok(())
            }

            fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
                clr[..$size].copy_from_slice(&native[..$size]);
                Ok(())
            }
        }
    };
}

copy_strategy!(Copy1, 1, NativeFieldCategory::BLITTABLE_INTEGER);
copy_strategy!(Copy2, 2, NativeFieldCategory::BLITTABLE_INTEGER);
copy_strategy!(Copy4, 4, NativeFieldCategory::BLITTABLE_INTEGER);
copy_strategy!(Copy8, 8, NativeFieldCategory::BLITTABLE_INTEGER);

impl ScalarStrategy {
    /// Direct copy of a primitive of `size` bytes.
    pub fn copy(size: u32, float: bool) -> Option<Self> {
        Some(match size {
            1 => Copy1 { float }.into(),
            2 => Copy2 { float }.into(),
            4 => Copy4 { float }.into(),
            8 => Copy8 { float }.into(),
            _ => return None,
        })
    }
}

/// `char` as a single ANSI byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsiChar;

impl ScalarMarshaler for AnsiChar {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Ansi
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
    }

    fn native_size(&self) -> u32 {
        1
    }

    fn managed_size(&self) -> u32 {
        2
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        let c = u16::from_le_bytes([clr[0], clr[1]]);
        native[0] = string::ansi_byte(c, config)?;
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        clr[..2].copy_from_slice(&(native[0] as u16).to_le_bytes());
        Ok(())
    }
}

/// `bool` as a 4-byte Win32 `BOOL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinBool;

impl ScalarMarshaler for WinBool {
    fn tag(&self) -> MarshalTag {
        MarshalTag::WinBool
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
    }

    fn native_size(&self) -> u32 {
        4
    }

    fn managed_size(&self) -> u32 {
        1
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        native[..4].copy_from_slice(&((clr[0] != 0) as i32).to_le_bytes());
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        clr[0] = (native[..4] != [0; 4]) as u8;
        Ok(())
    }
}

/// `bool` as a one-byte C `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CBool;

impl ScalarMarshaler for CBool {
    fn tag(&self) -> MarshalTag {
        MarshalTag::CBool
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
    }

    fn native_size(&self) -> u32 {
        1
    }

    fn managed_size(&self) -> u32 {
        1
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        native[0] = (clr[0] != 0) as u8;
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        clr[0] = (native[0] != 0) as u8;
        Ok(())
    }
}

/// `bool` as an OLE `VARIANT_BOOL` (-1 is true).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantBool;

pub const VARIANT_TRUE: i16 = -1;

impl ScalarMarshaler for VariantBool {
    fn tag(&self) -> MarshalTag {
        MarshalTag::VariantBool
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::INTEGER_LIKE
    }

    fn native_size(&self) -> u32 {
        2
    }

    fn managed_size(&self) -> u32 {
        1
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        let v = if clr[0] != 0 { VARIANT_TRUE } else { 0 };
        native[..2].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        clr[0] = (native[..2] != [0; 2]) as u8;
        Ok(())
    }
}

pub mod oadate {
    use crate::error::MarshalError;

    pub const TICKS_PER_MILLISECOND: i64 = 10_000;
    pub const TICKS_PER_DAY: i64 = 864_000_000_000;
    pub const MILLIS_PER_DAY: i64 = 86_400_000;
    const DAYS_TO_1899: i64 = 693_593;
    const DAYS_TO_10000: i64 = 3_652_059;
    const DAYS_PER_100_YEARS: i64 = 36_524;
    const DAYS_PER_YEAR: i64 = 365;
    /// Ticks at 1899-12-30, the OLE epoch.
    pub const DOUBLE_DATE_OFFSET: i64 = DAYS_TO_1899 * TICKS_PER_DAY;
    const OA_DATE_MIN_AS_TICKS: i64 = (DAYS_PER_100_YEARS - DAYS_PER_YEAR) * TICKS_PER_DAY;
    const MAX_MILLIS: i64 = DAYS_TO_10000 * MILLIS_PER_DAY;
    /// The two high bits of a managed `DateTime` hold its kind.
    pub const TICKS_MASK: u64 = 0x3FFF_FFFF_FFFF_FFFF;

    pub fn ticks_to_oadate(mut ticks: i64) -> Result<f64, MarshalError> {
        if ticks == 0 {
            return Ok(0.0);
        }
        if ticks < TICKS_PER_DAY {
            // time-of-day only, anchored at the OLE epoch
            ticks += DOUBLE_DATE_OFFSET;
        }
        if ticks < OA_DATE_MIN_AS_TICKS {
            return Err(MarshalError::InvalidOleDate(ticks as f64));
        }
        let mut millis = (ticks - DOUBLE_DATE_OFFSET) / TICKS_PER_MILLISECOND;
        if millis < 0 {
            let frac = millis % MILLIS_PER_DAY;
            if frac != 0 {
                millis -= (MILLIS_PER_DAY + frac) * 2;
            }
        }
        Ok(millis as f64 / MILLIS_PER_DAY as f64)
    }

    pub fn oadate_to_ticks(value: f64) -> Result<i64, MarshalError> {
        if !(value < 2_958_466.0 && value > -657_435.0) {
            return Err(MarshalError::InvalidOleDate(value));
        }
        let half = if value >= 0.0 { 0.5 } else { -0.5 };
        let mut millis = (value * MILLIS_PER_DAY as f64 + half) as i64;
        if millis < 0 {
            millis -= (millis % MILLIS_PER_DAY) * 2;
        }
        millis += DOUBLE_DATE_OFFSET / TICKS_PER_MILLISECOND;
        if !(0..MAX_MILLIS).contains(&millis) {
            return Err(MarshalError::InvalidOleDate(value));
        }
        Ok(millis * TICKS_PER_MILLISECOND)
    }
}

/// `DateTime` (64-bit ticks) as an OLE automation `DATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OleDate;

/// The first `N` bytes of a field; slots are always at least their size.
fn prefix<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

impl ScalarMarshaler for OleDate {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Date
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::DATE
    }

    fn native_size(&self) -> u32 {
        8
    }

    fn managed_size(&self) -> u32 {
        8
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        let raw = u64::from_le_bytes(prefix(clr));
        let date = oadate::ticks_to_oadate((raw & oadate::TICKS_MASK) as i64)?;
        native[..8].copy_from_slice(&date.to_le_bytes());
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        let date = f64::from_le_bytes(prefix(native));
        let ticks = oadate::oadate_to_ticks(date)?;
        clr[..8].copy_from_slice(&ticks.to_le_bytes());
        Ok(())
    }
}

/// A managed `decimal`: `flags, hi, lo, mid` as four little-endian words,
/// with the scale in bits 16..24 of `flags` and the sign in bit 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecimalParts {
    pub negative: bool,
    pub scale: u8,
    pub mantissa: u128,
}

pub const MAX_DECIMAL_SCALE: u8 = 28;
const DECIMAL_SIGN: u32 = 0x8000_0000;

impl DecimalParts {
    pub fn read_managed(clr: &[u8]) -> Result<Self, MarshalError> {
        let word = |i: usize| u32::from_le_bytes([clr[i], clr[i + 1], clr[i + 2], clr[i + 3]]);
        let (flags, hi, lo, mid) = (word(0), word(4), word(8), word(12));
        let scale = ((flags >> 16) & 0xFF) as u8;
        if scale > MAX_DECIMAL_SCALE {
            return Err(MarshalError::InvalidDecimal(scale));
        }
        Ok(Self {
            negative: flags & DECIMAL_SIGN != 0,
            scale,
            mantissa: (hi as u128) << 64 | (mid as u128) << 32 | lo as u128,
        })
    }

    pub fn write_managed(&self, clr: &mut [u8]) {
        let flags = (self.scale as u32) << 16 | if self.negative { DECIMAL_SIGN } else { 0 };
        let hi = (self.mantissa >> 64) as u32;
        let mid = (self.mantissa >> 32) as u32;
        let lo = self.mantissa as u32;
        for (i, w) in [flags, hi, lo, mid].into_iter().enumerate() {
            clr[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    /// Native `DECIMAL`: `u16 reserved, u8 scale, u8 sign, u32 hi, u64 lo`.
    pub fn read_native(native: &[u8]) -> Result<Self, MarshalError> {
        let scale = native[2];
        if scale > MAX_DECIMAL_SCALE {
            return Err(MarshalError::InvalidDecimal(scale));
        }
        let hi = u32::from_le_bytes(prefix(&native[4..]));
        let lo = u64::from_le_bytes(prefix(&native[8..]));
        Ok(Self {
            negative: native[3] & 0x80 != 0,
            scale,
            mantissa: (hi as u128) << 64 | lo as u128,
        })
    }

    pub fn write_native(&self, native: &mut [u8]) {
        native[..2].fill(0);
        native[2] = self.scale;
        native[3] = if self.negative { 0x80 } else { 0 };
        native[4..8].copy_from_slice(&((self.mantissa >> 64) as u32).to_le_bytes());
        native[8..16].copy_from_slice(&(self.mantissa as u64).to_le_bytes());
    }

    /// Value scaled by 10^4 and rounded half-to-even, as an OLE `CY`.
    pub fn to_currency(&self) -> Result<i64, MarshalError> {
        let scaled = self.mantissa * 10_000;
        let div = 10u128.pow(self.scale as u32);
        let (mut q, r) = (scaled / div, scaled % div);
        if r * 2 > div || (r * 2 == div && q % 2 == 1) {
            q += 1;
        }
        if self.negative {
            if q > i64::MIN.unsigned_abs() as u128 {
                return Err(MarshalError::CurrencyOverflow);
            }
            Ok((q as i128).wrapping_neg() as i64)
        } else {
            i64::try_from(q).map_err(|_| MarshalError::CurrencyOverflow)
        }
    }

    pub fn from_currency(cy: i64) -> Self {
        Self {
            negative: cy < 0,
            scale: 4,
            mantissa: cy.unsigned_abs() as u128,
        }
    }
}

/// `decimal` as an OLE `DECIMAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OleDecimal;

impl ScalarMarshaler for OleDecimal {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Decimal
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::WELL_KNOWN
    }

    fn native_size(&self) -> u32 {
        16
    }

    fn managed_size(&self) -> u32 {
        16
    }

    fn alignment_requirement(&self) -> u32 {
        8
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        DecimalParts::read_managed(clr)?.write_native(native);
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        DecimalParts::read_native(native)?.write_managed(clr);
        Ok(())
    }
}

/// `decimal` as an OLE `CY` (64-bit, four implied decimal places).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OleCurrency;

impl ScalarMarshaler for OleCurrency {
    fn tag(&self) -> MarshalTag {
        MarshalTag::Currency
    }

    fn category(&self) -> NativeFieldCategory {
        NativeFieldCategory::WELL_KNOWN
    }

    fn native_size(&self) -> u32 {
        8
    }

    fn managed_size(&self) -> u32 {
        16
    }

    fn scalar_update_native(
        &self,
        clr: &[u8],
        native: &mut [u8],
        _config: &MarshalConfig,
    ) -> Result<(), MarshalError> {
        let cy = DecimalParts::read_managed(clr)?.to_currency()?;
        native[..8].copy_from_slice(&cy.to_le_bytes());
        Ok(())
    }

    fn scalar_update_clr(&self, native: &[u8], clr: &mut [u8]) -> Result<(), MarshalError> {
        let cy = i64::from_le_bytes(prefix(native));
        DecimalParts::from_currency(cy).write_managed(clr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_native(s: ScalarStrategy, clr: &[u8]) -> Vec<u8> {
        let mut native = vec![0xCC; s.native_size() as usize];
        s.scalar_update_native(clr, &mut native, &MarshalConfig::default())
            .unwrap();
        native
    }

    fn to_clr(s: ScalarStrategy, native: &[u8]) -> Vec<u8> {
        let mut clr = vec![0xCC; s.managed_size() as usize];
        s.scalar_update_clr(native, &mut clr).unwrap();
        clr
    }

    #[test]
    fn sizes_and_alignment() {
        let r4 = ScalarStrategy::copy(4, true).unwrap();
        assert_eq!((r4.native_size(), r4.alignment_requirement()), (4, 4));
        assert_eq!(r4.category(), NativeFieldCategory::R4);
        let r8 = ScalarStrategy::copy(8, true).unwrap();
        assert_eq!(r8.category(), NativeFieldCategory::R8);
        let date = ScalarStrategy::from(OleDate);
        assert_eq!((date.native_size(), date.alignment_requirement()), (8, 8));
        assert_eq!(date.category(), NativeFieldCategory::DATE);
        let dec = ScalarStrategy::from(OleDecimal);
        assert_eq!((dec.native_size(), dec.alignment_requirement()), (16, 8));
        assert_eq!(
            ScalarStrategy::copy(2, false).unwrap().category(),
            NativeFieldCategory::BLITTABLE_INTEGER
        );
        assert!(ScalarStrategy::copy(3, false).is_none());
    }

    #[test]
    fn integer_extremes_round_trip() {
        let s = ScalarStrategy::copy(8, false).unwrap();
        for v in [0i64, i64::MIN, i64::MAX, -1] {
            let n = to_native(s, &v.to_le_bytes());
            assert_eq!(to_clr(s, &n), v.to_le_bytes());
        }
    }

    #[test]
    fn booleans() {
        let win = ScalarStrategy::from(WinBool);
        assert_eq!(to_native(win, &[1]), 1i32.to_le_bytes());
        assert_eq!(to_clr(win, &0x100i32.to_le_bytes()), [1]);
        assert_eq!(to_clr(win, &[0; 4]), [0]);

        let c = ScalarStrategy::from(CBool);
        assert_eq!(to_native(c, &[7]), [1]);

        let vb = ScalarStrategy::from(VariantBool);
        assert_eq!(to_native(vb, &[1]), [0xFF, 0xFF]);
        assert_eq!(to_native(vb, &[0]), [0, 0]);
        assert_eq!(to_clr(vb, &[0xFF, 0xFF]), [1]);
    }

    #[test]
    fn ansi_chars() {
        let s = ScalarStrategy::from(AnsiChar);
        assert_eq!(to_native(s, &(b'A' as u16).to_le_bytes()), [b'A']);
        assert_eq!(to_native(s, &0x263Au16.to_le_bytes()), [b'?']);
        assert_eq!(to_clr(s, &[0xE9]), 0xE9u16.to_le_bytes());

        let strict = MarshalConfig {
            throw_on_unmappable_char: true,
            ..MarshalConfig::default()
        };
        let mut native = [0u8];
        assert_eq!(
            s.scalar_update_native(&0x263Au16.to_le_bytes(), &mut native, &strict),
            Err(MarshalError::UnmappableChar(0x263A))
        );
    }

    #[test]
    fn ole_dates() {
        // 2000-01-01T00:00:00
        let ticks: i64 = 630_822_816_000_000_000;
        assert_eq!(oadate::ticks_to_oadate(ticks).unwrap(), 36526.0);
        assert_eq!(oadate::oadate_to_ticks(36526.0).unwrap(), ticks);
        assert_eq!(oadate::ticks_to_oadate(oadate::DOUBLE_DATE_OFFSET).unwrap(), 0.0);
        // before the epoch the time of day still counts forward: 18:00 on
        // the day before is -1.75, not -0.25
        let before = oadate::DOUBLE_DATE_OFFSET - oadate::TICKS_PER_DAY / 4;
        assert_eq!(oadate::ticks_to_oadate(before).unwrap(), -1.75);
        assert_eq!(oadate::oadate_to_ticks(-1.75).unwrap(), before);
        assert!(oadate::oadate_to_ticks(3_000_000.0).is_err());
        assert!(oadate::oadate_to_ticks(f64::NAN).is_err());

        let s = ScalarStrategy::from(OleDate);
        let n = to_native(s, &ticks.to_le_bytes());
        assert_eq!(n, 36526.0f64.to_le_bytes());
        assert_eq!(to_clr(s, &n), ticks.to_le_bytes());
    }

    #[test]
    fn decimals() {
        let value = DecimalParts {
            negative: true,
            scale: 3,
            mantissa: 123_456_789_012_345_678_901,
        };
        let mut clr = [0u8; 16];
        value.write_managed(&mut clr);
        let s = ScalarStrategy::from(OleDecimal);
        let n = to_native(s, &clr);
        assert_eq!(n[2], 3);
        assert_eq!(n[3], 0x80);
        assert_eq!(DecimalParts::read_native(&n).unwrap(), value);
        assert_eq!(to_clr(s, &n), clr);

        let mut bad = clr;
        bad[2] = 29;
        assert_eq!(
            DecimalParts::read_managed(&bad),
            Err(MarshalError::InvalidDecimal(29))
        );
    }

    #[test]
    fn currency_rounds_half_even() {
        let cy = |negative, scale, mantissa| DecimalParts {
            negative,
            scale,
            mantissa,
        }
        .to_currency();
        assert_eq!(cy(false, 0, 12), Ok(120_000));
        assert_eq!(cy(false, 5, 125), Ok(12));
        assert_eq!(cy(false, 5, 135), Ok(14));
        assert_eq!(cy(true, 5, 125), Ok(-12));
        assert_eq!(cy(false, 0, 1 << 80), Err(MarshalError::CurrencyOverflow));
        assert_eq!(
            cy(true, 4, i64::MIN.unsigned_abs() as u128),
            Ok(i64::MIN)
        );

        let s = ScalarStrategy::from(OleCurrency);
        let mut clr = [0u8; 16];
        DecimalParts::from_currency(-15_000).write_managed(&mut clr);
        let n = to_native(s, &clr);
        assert_eq!(n, (-15_000i64).to_le_bytes());
        assert_eq!(to_clr(s, &n), clr);
    }
}

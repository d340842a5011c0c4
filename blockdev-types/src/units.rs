// SPDX-License-Identifier: GPL-3.0-only

//! Byte and sector arithmetic with decimal and binary SI prefixes.
//!
//! All conversions run on integers. A [`SizeValue`] holds its magnitude as
//! `u128` bytes so the yotta range (`YB`, `YiB`) stays representable without
//! falling back to floating point.

use std::fmt;
use std::str::FromStr;

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, Result};

/// Size of one kernel sector in bytes.
pub const SECTOR_SIZE: u128 = 512;

/// Number of decimals emitted by [`SizeValue::format`].
pub const FORMAT_PRECISION: u32 = 2;

/// Fraction digits beyond this are dropped while parsing; they cannot
/// change the rounded byte count.
const MAX_FRACTION_DIGITS: usize = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitFamily {
    /// Powers of 1000 (`kB`, `MB`, ...).
    Decimal,
    /// Powers of 1024 (`KiB`, `MiB`, ...).
    Binary,
}

/// A recognized size suffix. Matching is case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    B,
    KB,
    MB,
    GB,
    TB,
    PB,
    EB,
    ZB,
    YB,
    KiB,
    MiB,
    GiB,
    TiB,
    PiB,
    EiB,
    ZiB,
    YiB,
}

const DECIMAL_UNITS: [Unit; 9] = [
    Unit::B,
    Unit::KB,
    Unit::MB,
    Unit::GB,
    Unit::TB,
    Unit::PB,
    Unit::EB,
    Unit::ZB,
    Unit::YB,
];

const BINARY_UNITS: [Unit; 9] = [
    Unit::B,
    Unit::KiB,
    Unit::MiB,
    Unit::GiB,
    Unit::TiB,
    Unit::PiB,
    Unit::EiB,
    Unit::ZiB,
    Unit::YiB,
];

impl Unit {
    pub const ALL: [Unit; 17] = [
        Unit::B,
        Unit::KB,
        Unit::MB,
        Unit::GB,
        Unit::TB,
        Unit::PB,
        Unit::EB,
        Unit::ZB,
        Unit::YB,
        Unit::KiB,
        Unit::MiB,
        Unit::GiB,
        Unit::TiB,
        Unit::PiB,
        Unit::EiB,
        Unit::ZiB,
        Unit::YiB,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Unit::B => "B",
            Unit::KB => "kB",
            Unit::MB => "MB",
            Unit::GB => "GB",
            Unit::TB => "TB",
            Unit::PB => "PB",
            Unit::EB => "EB",
            Unit::ZB => "ZB",
            Unit::YB => "YB",
            Unit::KiB => "KiB",
            Unit::MiB => "MiB",
            Unit::GiB => "GiB",
            Unit::TiB => "TiB",
            Unit::PiB => "PiB",
            Unit::EiB => "EiB",
            Unit::ZiB => "ZiB",
            Unit::YiB => "YiB",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|unit| unit.suffix() == suffix)
    }

    /// Power of the family base this unit stands for (`B` is 0).
    fn exponent(self) -> u32 {
        match self {
            Unit::B => 0,
            Unit::KB | Unit::KiB => 1,
            Unit::MB | Unit::MiB => 2,
            Unit::GB | Unit::GiB => 3,
            Unit::TB | Unit::TiB => 4,
            Unit::PB | Unit::PiB => 5,
            Unit::EB | Unit::EiB => 6,
            Unit::ZB | Unit::ZiB => 7,
            Unit::YB | Unit::YiB => 8,
        }
    }

    /// The family a unit belongs to. `B` is reported as decimal but is the
    /// base unit of both families.
    pub fn family(self) -> UnitFamily {
        match self {
            Unit::KiB
            | Unit::MiB
            | Unit::GiB
            | Unit::TiB
            | Unit::PiB
            | Unit::EiB
            | Unit::ZiB
            | Unit::YiB => UnitFamily::Binary,
            _ => UnitFamily::Decimal,
        }
    }

    /// Number of bytes in one of this unit.
    pub fn factor(self) -> u128 {
        let base: u128 = match self.family() {
            UnitFamily::Decimal => 1000,
            UnitFamily::Binary => 1024,
        };
        base.pow(self.exponent())
    }

    /// Units of a family in ascending order, starting at `B`.
    pub fn family_units(family: UnitFamily) -> &'static [Unit] {
        match family {
            UnitFamily::Decimal => &DECIMAL_UNITS,
            UnitFamily::Binary => &BINARY_UNITS,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// An exact byte count.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SizeValue {
    bytes: u128,
}

impl SizeValue {
    pub const ZERO: SizeValue = SizeValue { bytes: 0 };

    pub const fn from_bytes(bytes: u128) -> Self {
        Self { bytes }
    }

    /// Build a size from a count of 512 byte sectors, as sysfs reports it.
    pub fn from_sectors(sectors: u64) -> Self {
        Self {
            bytes: u128::from(sectors) * SECTOR_SIZE,
        }
    }

    pub fn bytes(self) -> u128 {
        self.bytes
    }

    pub fn as_u64(self) -> Option<u64> {
        u64::try_from(self.bytes).ok()
    }

    pub fn is_sector_aligned(self) -> bool {
        self.bytes % SECTOR_SIZE == 0
    }

    /// Sector count of this size. Fails unless the size divides evenly.
    pub fn to_sectors(self) -> Result<u64> {
        if !self.is_sector_aligned() {
            return Err(ParseError::NotSectorAligned { bytes: self.bytes });
        }
        u64::try_from(self.bytes / SECTOR_SIZE)
            .map_err(|_| ParseError::SectorOverflow { bytes: self.bytes })
    }

    pub fn checked_add(self, other: SizeValue) -> Option<SizeValue> {
        self.bytes.checked_add(other.bytes).map(Self::from_bytes)
    }

    pub fn saturating_sub(self, other: SizeValue) -> SizeValue {
        Self::from_bytes(self.bytes.saturating_sub(other.bytes))
    }

    /// Parse `<number><suffix>`, e.g. `"1.5 GiB"`, `"512B"` or `"20 kB"`.
    ///
    /// The suffix is mandatory and must be one of the [`Unit`] tokens,
    /// compared case-sensitively (`"b"` and `"kb"` are rejected).
    pub fn parse(text: &str) -> Result<Self> {
        let input = text.trim();
        let err = |reason: &str| ParseError::UnitFormat {
            input: text.to_string(),
            reason: reason.to_string(),
        };

        let split = input
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(input.len());
        let (number, suffix) = input.split_at(split);
        let suffix = suffix.trim_start();

        if number.is_empty() {
            return Err(err("missing numeric value"));
        }
        if suffix.is_empty() {
            return Err(err("missing unit suffix"));
        }
        let unit = Unit::from_suffix(suffix).ok_or_else(|| err("unrecognized unit suffix"))?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((int_part, frac_part)) => (int_part, Some(frac_part)),
            None => (number, None),
        };
        if int_part.is_empty() {
            return Err(err("missing integer digits"));
        }
        if frac_part.is_some_and(|frac| frac.is_empty() || frac.contains('.')) {
            return Err(err("malformed fraction"));
        }

        let factor = unit.factor();
        let whole: u128 = int_part.parse().map_err(|_| err("value out of range"))?;
        let mut bytes = whole
            .checked_mul(factor)
            .ok_or_else(|| err("value out of range"))?;

        if let Some(frac) = frac_part {
            let digits = &frac[..frac.len().min(MAX_FRACTION_DIGITS)];
            let numerator: u128 = digits.parse().map_err(|_| err("malformed fraction"))?;
            let denominator = 10u128.pow(digits.len() as u32);
            let frac_bytes = mul_div_round(numerator, factor, denominator);
            bytes = bytes
                .checked_add(frac_bytes)
                .ok_or_else(|| err("value out of range"))?;
        }

        Ok(Self { bytes })
    }

    /// The largest unit of `family` in which this size is at least one.
    pub fn best_unit(self, family: UnitFamily) -> Unit {
        Unit::family_units(family)
            .iter()
            .rev()
            .copied()
            .find(|unit| self.bytes >= unit.factor())
            .unwrap_or(Unit::B)
    }

    /// Render in the largest fitting unit of `family` with
    /// [`FORMAT_PRECISION`] decimals. Plain bytes are rendered without
    /// decimals.
    pub fn format(self, family: UnitFamily) -> String {
        self.format_in(self.best_unit(family))
    }

    pub fn format_in(self, unit: Unit) -> String {
        if unit == Unit::B {
            return format!("{} B", self.bytes);
        }

        let factor = unit.factor();
        let scale = 10u128.pow(FORMAT_PRECISION);
        let whole = self.bytes / factor;
        let scaled = whole * scale + mul_div_round(self.bytes % factor, scale, factor);
        format!(
            "{}.{:0width$} {}",
            scaled / scale,
            scaled % scale,
            unit.suffix(),
            width = FORMAT_PRECISION as usize
        )
    }

    /// Like [`SizeValue::format`], followed by the exact grouped byte count.
    pub fn to_pretty_with_bytes(self, family: UnitFamily) -> String {
        format!(
            "{} ({} bytes)",
            self.format(family),
            self.bytes.to_formatted_string(&Locale::en)
        )
    }
}

impl fmt::Display for SizeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(UnitFamily::Binary))
    }
}

impl FromStr for SizeValue {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<u64> for SizeValue {
    fn from(bytes: u64) -> Self {
        Self::from_bytes(u128::from(bytes))
    }
}

/// `round(value * multiplier / divisor)` for `value < divisor`, computed
/// bit by bit so the intermediate product never overflows.
fn mul_div_round(value: u128, multiplier: u128, divisor: u128) -> u128 {
    debug_assert!(value < divisor);
    let mut quotient: u128 = 0;
    let mut remainder: u128 = 0;

    for bit in (0..u128::BITS - multiplier.leading_zeros()).rev() {
        quotient <<= 1;
        remainder <<= 1;
        if remainder >= divisor {
            quotient += 1;
            remainder -= divisor;
        }
        if (multiplier >> bit) & 1 == 1 {
            remainder += value;
            if remainder >= divisor {
                quotient += 1;
                remainder -= divisor;
            }
        }
    }

    if remainder >= divisor - remainder {
        quotient += 1;
    }
    quotient
}

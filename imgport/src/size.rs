//! Byte quantities with human-readable suffixes.
//!
//! Requested image sizes arrive as strings like `"10Gi"` or `"1.5G"`.
//! [`Quantity`] parses the binary (`Ki` `Mi` `Gi` `Ti` `Pi` `Ei`) and
//! SI (`k` `M` `G` `T` `P` `E`) suffix families into an exact byte
//! count with a total ordering.

use std::fmt;
use std::str::FromStr;

use crate::errors::ImportError;

/// Binary suffixes, powers of 1024.
const BINARY_SUFFIXES: &[(&str, i128)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

/// SI suffixes, powers of 1000. Lowercase `k` per convention.
const SI_SUFFIXES: &[(&str, i128)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// A non-negative byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    /// Wrap a raw byte count. Negative values are clamped to zero.
    pub fn from_bytes(bytes: i64) -> Self {
        Quantity(bytes.max(0))
    }

    /// The byte count.
    pub fn bytes(self) -> i64 {
        self.0
    }

    /// The smaller of two quantities.
    pub fn min(self, other: Self) -> Self {
        if self <= other { self } else { other }
    }
}

impl FromStr for Quantity {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ImportError::InvalidQuantity(s.to_string());

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }

        let multiplier = lookup_suffix(suffix).ok_or_else(invalid)?;

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.contains('.') {
            return Err(invalid());
        }

        let int_val: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut total = int_val.checked_mul(multiplier).ok_or_else(invalid)?;
        if !frac_part.is_empty() {
            let frac_val: i128 = frac_part.parse().map_err(|_| invalid())?;
            let scale = 10i128
                .checked_pow(frac_part.len() as u32)
                .ok_or_else(invalid)?;
            let frac_bytes = frac_val
                .checked_mul(multiplier)
                .ok_or_else(invalid)?
                / scale;
            total = total.checked_add(frac_bytes).ok_or_else(invalid)?;
        }

        i64::try_from(total)
            .map(Quantity)
            .map_err(|_| invalid())
    }
}

fn lookup_suffix(suffix: &str) -> Option<i128> {
    if suffix.is_empty() {
        return Some(1);
    }
    BINARY_SUFFIXES
        .iter()
        .chain(SI_SUFFIXES)
        .find(|(name, _)| *name == suffix)
        .map(|(_, mult)| *mult)
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render with the largest binary suffix that divides exactly.
        if self.0 != 0 {
            for (name, mult) in BINARY_SUFFIXES.iter().rev() {
                let mult = *mult as i64;
                if self.0 % mult == 0 {
                    return write!(f, "{}{}", self.0 / mult, name);
                }
            }
        }
        write!(f, "{}", self.0)
    }
}

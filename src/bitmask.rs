//! Refinement bitmask and HZ address conversion

use crate::error::{IdxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest supported bitmask; HZ addresses must fit in a `u64`
pub const MAX_RESOLUTION: usize = 63;

/// Axis refinement order, written `V` followed by one axis digit per level.
///
/// The digit at position `i` (1-based) names the axis whose sample density
/// doubles when going from resolution `i - 1` to `i`. `V012012` over a 4x4x4
/// volume refines x, y, z, then x, y, z again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bitmask {
    pattern: String,
    /// `axes[0]` is unused so that `axes[i]` is the axis at position `i`
    axes: Vec<usize>,
    pdim: usize,
    pow2_dims: Vec<i64>,
}

impl Bitmask {
    /// Parse a pattern such as `V012012`. The dimensionality is the highest
    /// axis digit plus one.
    pub fn parse(pattern: &str) -> Result<Self> {
        Self::parse_with_dim(pattern, 0)
    }

    /// Parse a pattern for a dataset with at least `pdim` axes. Axes that never
    /// appear in the pattern have a power-of-two extent of 1.
    pub fn parse_with_dim(pattern: &str, pdim: usize) -> Result<Self> {
        let pattern = pattern.trim();
        let digits = pattern.strip_prefix('V').ok_or_else(|| {
            IdxError::ParseError(format!("bitmask '{}' must start with 'V'", pattern))
        })?;
        if digits.len() > MAX_RESOLUTION {
            return Err(IdxError::InvalidGeometry(format!(
                "bitmask '{}' is longer than {} levels",
                pattern, MAX_RESOLUTION
            )));
        }

        let mut axes = Vec::with_capacity(digits.len() + 1);
        axes.push(0);
        let mut pdim = pdim;
        for c in digits.chars() {
            let axis = c.to_digit(10).ok_or_else(|| {
                IdxError::ParseError(format!("invalid axis digit '{}' in bitmask '{}'", c, pattern))
            })? as usize;
            if axis >= crate::geometry::MAX_DIMENSIONS {
                return Err(IdxError::InvalidGeometry(format!(
                    "bitmask '{}' names axis {}",
                    pattern, axis
                )));
            }
            axes.push(axis);
            pdim = pdim.max(axis + 1);
        }
        let pdim = pdim.max(1);

        let mut pow2_dims = vec![1i64; pdim];
        for &axis in &axes[1..] {
            pow2_dims[axis] <<= 1;
        }

        Ok(Self {
            pattern: pattern.to_string(),
            axes,
            pdim,
            pow2_dims,
        })
    }

    /// Guess a bitmask covering `dims`.
    ///
    /// With `regular_as_soon_as_possible` the finest levels cycle through the
    /// axes in order and the surplus bits of longer axes go to the coarsest
    /// levels (`V11 0101` for 4x16). Otherwise the cycling happens at the
    /// coarse end (`V0101 11`).
    pub fn guess(dims: &[i64], regular_as_soon_as_possible: bool) -> Result<Self> {
        if dims.is_empty() || dims.iter().any(|&d| d < 1) {
            return Err(IdxError::InvalidGeometry(format!(
                "cannot guess a bitmask for dims {:?}",
                dims
            )));
        }
        let pdim = dims.len();
        let mut pow2: Vec<i64> = dims
            .iter()
            .map(|&d| (d as u64).next_power_of_two() as i64)
            .collect();

        let mut digits = String::new();
        while pow2.iter().any(|&d| d > 1) {
            let order: Vec<usize> = if regular_as_soon_as_possible {
                (0..pdim).rev().collect()
            } else {
                (0..pdim).collect()
            };
            for axis in order {
                if pow2[axis] > 1 {
                    digits.push(char::from(b'0' + axis as u8));
                    pow2[axis] >>= 1;
                }
            }
        }
        if regular_as_soon_as_possible {
            digits = digits.chars().rev().collect();
        }
        Self::parse_with_dim(&format!("V{}", digits), pdim)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Number of levels above the single-sample level 0 (`maxh`)
    pub fn max_resolution(&self) -> usize {
        self.axes.len() - 1
    }

    pub fn pdim(&self) -> usize {
        self.pdim
    }

    /// Power-of-two box extent implied by the pattern
    pub fn pow2_dims(&self) -> &[i64] {
        &self.pow2_dims
    }

    /// Axis refined at position `i` (1-based)
    pub fn axis(&self, i: usize) -> usize {
        self.axes[i]
    }

    /// Per-axis count of positions `1..=level` naming that axis
    pub fn axis_counts(&self, level: usize) -> Vec<u32> {
        let mut ret = vec![0u32; self.pdim];
        for &axis in &self.axes[1..=level.min(self.max_resolution())] {
            ret[axis] += 1;
        }
        ret
    }

    /// Z-interleave the low bits of `coords` using positions `1..=len`. The
    /// last position consumes the least significant coordinate bit.
    pub fn interleave(&self, coords: &[i64], len: usize) -> u64 {
        let mut c: Vec<u64> = coords.iter().map(|&v| v as u64).collect();
        let mut z = 0u64;
        for shift in 0..len {
            let axis = self.axes[len - shift];
            z |= (c[axis] & 1) << shift;
            c[axis] >>= 1;
        }
        z
    }

    /// Inverse of [`Bitmask::interleave`] for the same `len`
    pub fn deinterleave(&self, z: u64, len: usize) -> Vec<i64> {
        let mut ret = vec![0i64; self.pdim];
        let mut consumed = vec![0u32; self.pdim];
        for shift in 0..len {
            let axis = self.axes[len - shift];
            if (z >> shift) & 1 == 1 {
                ret[axis] |= 1 << consumed[axis];
            }
            consumed[axis] += 1;
        }
        ret
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

impl TryFrom<String> for Bitmask {
    type Error = IdxError;

    fn try_from(value: String) -> Result<Self> {
        Bitmask::parse(&value)
    }
}

impl From<Bitmask> for String {
    fn from(value: Bitmask) -> Self {
        value.pattern
    }
}

/// Conversion between points, Z addresses and HZ addresses for a bitmask
#[derive(Debug, Clone)]
pub struct HzOrder {
    bitmask: Bitmask,
    maxh: usize,
}

impl HzOrder {
    pub fn new(bitmask: &Bitmask) -> Self {
        Self {
            bitmask: bitmask.clone(),
            maxh: bitmask.max_resolution(),
        }
    }

    pub fn max_resolution(&self) -> usize {
        self.maxh
    }

    pub fn interleave(&self, point: &[i64]) -> u64 {
        self.bitmask.interleave(point, self.maxh)
    }

    pub fn deinterleave(&self, z: u64) -> Vec<i64> {
        self.bitmask.deinterleave(z, self.maxh)
    }

    pub fn z_to_hz(&self, z: u64) -> u64 {
        let marked = z | (1u64 << self.maxh);
        marked >> (marked.trailing_zeros() + 1)
    }

    pub fn hz_to_z(&self, hz: u64) -> u64 {
        if hz == 0 {
            return 0;
        }
        let level = Self::level_of(hz);
        let marked = ((hz << 1) | 1) << (self.maxh - level);
        marked & !(1u64 << self.maxh)
    }

    /// Resolution level an HZ address belongs to
    pub fn level_of(hz: u64) -> usize {
        (64 - hz.leading_zeros()) as usize
    }

    /// HZ address of a point inside the power-of-two box
    pub fn address(&self, point: &[i64]) -> u64 {
        self.z_to_hz(self.interleave(point))
    }

    /// Point stored at an HZ address
    pub fn point(&self, hz: u64) -> Vec<i64> {
        self.deinterleave(self.hz_to_z(hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let b = Bitmask::parse("V0101").unwrap();
        assert_eq!(b.max_resolution(), 4);
        assert_eq!(b.pdim(), 2);
        assert_eq!(b.pow2_dims(), &[4, 4]);
        assert_eq!(b.axis(1), 0);
        assert_eq!(b.axis(4), 1);
        assert_eq!(b.axis_counts(3), vec![2, 1]);

        assert!(Bitmask::parse("0101").is_err());
        assert!(Bitmask::parse("V01x1").is_err());
        assert!(Bitmask::parse("V09").is_err());
    }

    #[test]
    fn test_guess_regular_cube() {
        let b = Bitmask::guess(&[256, 256, 256], true).unwrap();
        assert_eq!(b.pattern(), format!("V{}", "012".repeat(8)));
        assert_eq!(b.pow2_dims(), &[256, 256, 256]);
    }

    #[test]
    fn test_guess_non_cube() {
        assert_eq!(Bitmask::guess(&[4, 16], true).unwrap().pattern(), "V110101");
        assert_eq!(Bitmask::guess(&[4, 16], false).unwrap().pattern(), "V010111");
        // non power of two rounds up
        assert_eq!(Bitmask::guess(&[3, 5], true).unwrap().pow2_dims(), &[4, 8]);
        assert_eq!(Bitmask::guess(&[1, 1], true).unwrap().max_resolution(), 0);
    }

    #[test]
    fn test_interleave_table() {
        let b = Bitmask::parse("V0101").unwrap();
        let hz = HzOrder::new(&b);
        assert_eq!(hz.interleave(&[0, 0]), 0);
        assert_eq!(hz.interleave(&[1, 0]), 2);
        assert_eq!(hz.interleave(&[2, 0]), 8);
        assert_eq!(hz.interleave(&[0, 1]), 1);
        assert_eq!(hz.interleave(&[3, 3]), 15);
        assert_eq!(hz.interleave(&[2, 3]), 13);
        for z in 0..16 {
            assert_eq!(hz.interleave(&hz.deinterleave(z)), z);
        }
    }

    #[test]
    fn test_hz_levels() {
        let b = Bitmask::parse("V0101").unwrap();
        let hz = HzOrder::new(&b);
        assert_eq!(hz.address(&[0, 0]), 0);
        // level 1 refines axis 0: its single sample sits at x = 2
        assert_eq!(hz.address(&[2, 0]), 1);
        assert_eq!(HzOrder::level_of(1), 1);
        // level 2 refines axis 1
        assert_eq!(hz.address(&[0, 2]), 2);
        assert_eq!(hz.address(&[2, 2]), 3);
        assert_eq!(HzOrder::level_of(3), 2);
    }

    #[test]
    fn test_hz_bijection() {
        let b = Bitmask::guess(&[8, 4, 2], true).unwrap();
        let hz = HzOrder::new(&b);
        let total = 1u64 << b.max_resolution();
        let mut seen = std::collections::HashSet::new();
        for h in 0..total {
            let p = hz.point(h);
            assert_eq!(hz.address(&p), h);
            assert!(seen.insert(p));
        }
    }
}

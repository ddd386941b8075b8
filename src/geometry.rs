//! Integer boxes, sample lattices and the copy kernel that moves samples
//! between buffers described by different lattices.
//!
//! Every buffer handled by the crate is row-major with axis 0 varying fastest.

use crate::error::{IdxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of axes a dataset may have
pub const MAX_DIMENSIONS: usize = 5;

/// Smallest `v >= value` with `v ≡ origin (mod step)`
pub fn align_right(value: i64, origin: i64, step: i64) -> i64 {
    debug_assert!(step > 0);
    origin + (value - origin + step - 1).div_euclid(step) * step
}

/// Largest `v <= value` with `v ≡ origin (mod step)`
pub fn align_left(value: i64, origin: i64, step: i64) -> i64 {
    debug_assert!(step > 0);
    origin + (value - origin).div_euclid(step) * step
}

/// Axis-aligned half-open integer box `[lo, hi)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicBox {
    pub lo: Vec<i64>,
    pub hi: Vec<i64>,
}

impl LogicBox {
    /// Create a box, checking `lo[i] <= hi[i]` on every axis
    pub fn new(lo: Vec<i64>, hi: Vec<i64>) -> Result<Self> {
        if lo.len() != hi.len() {
            return Err(IdxError::InvalidGeometry(format!(
                "box corners have different dimensionality ({} vs {})",
                lo.len(),
                hi.len()
            )));
        }
        if lo.is_empty() || lo.len() > MAX_DIMENSIONS {
            return Err(IdxError::InvalidGeometry(format!(
                "dimensionality must be between 1 and {}",
                MAX_DIMENSIONS
            )));
        }
        if lo.iter().zip(&hi).any(|(a, b)| a > b) {
            return Err(IdxError::InvalidGeometry(format!(
                "box lower corner {:?} exceeds upper corner {:?}",
                lo, hi
            )));
        }
        Ok(Self { lo, hi })
    }

    /// Box `[0, dims)`
    pub fn from_dims(dims: &[i64]) -> Result<Self> {
        Self::new(vec![0; dims.len()], dims.to_vec())
    }

    pub fn dim(&self) -> usize {
        self.lo.len()
    }

    pub fn size(&self) -> Vec<i64> {
        self.lo.iter().zip(&self.hi).map(|(a, b)| b - a).collect()
    }

    /// True when any axis has zero extent
    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(&self.hi).any(|(a, b)| a >= b)
    }

    pub fn num_samples(&self) -> u64 {
        self.size().iter().map(|&s| s.max(0) as u64).product()
    }

    /// Non-empty intersection, or `None`
    pub fn intersection(&self, other: &LogicBox) -> Option<LogicBox> {
        if self.dim() != other.dim() {
            return None;
        }
        let lo: Vec<i64> = self.lo.iter().zip(&other.lo).map(|(a, b)| *a.max(b)).collect();
        let hi: Vec<i64> = self.hi.iter().zip(&other.hi).map(|(a, b)| *a.min(b)).collect();
        let ret = LogicBox { lo, hi };
        if ret.is_empty() {
            None
        } else {
            Some(ret)
        }
    }

    pub fn intersects(&self, other: &LogicBox) -> bool {
        self.intersection(other).is_some()
    }

    pub fn contains_box(&self, other: &LogicBox) -> bool {
        self.dim() == other.dim()
            && (0..self.dim()).all(|d| self.lo[d] <= other.lo[d] && other.hi[d] <= self.hi[d])
    }

    pub fn contains_point(&self, p: &[i64]) -> bool {
        p.len() == self.dim() && (0..self.dim()).all(|d| self.lo[d] <= p[d] && p[d] < self.hi[d])
    }
}

impl fmt::Display for LogicBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[i64]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(" ");
        write!(f, "[{}]-({})", join(&self.lo), join(&self.hi))
    }
}

/// A regular lattice of samples `lo + k * delta` inside a box. `delta` is a
/// power of two per axis and the box extent is a multiple of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicSamples {
    pub logic_box: LogicBox,
    pub delta: Vec<i64>,
}

impl LogicSamples {
    pub fn new(logic_box: LogicBox, delta: Vec<i64>) -> Self {
        let ret = Self { logic_box, delta };
        debug_assert!(ret.is_valid(), "invalid lattice {:?}", ret);
        ret
    }

    pub fn is_valid(&self) -> bool {
        self.delta.len() == self.logic_box.dim()
            && self
                .delta
                .iter()
                .zip(self.logic_box.size())
                .all(|(&d, s)| d > 0 && (d as u64).is_power_of_two() && s >= 0 && s % d == 0)
    }

    pub fn dim(&self) -> usize {
        self.delta.len()
    }

    /// Samples per axis
    pub fn dims(&self) -> Vec<usize> {
        self.logic_box
            .size()
            .iter()
            .zip(&self.delta)
            .map(|(s, d)| (s / d) as usize)
            .collect()
    }

    pub fn num_samples(&self) -> u64 {
        self.dims().iter().map(|&n| n as u64).product()
    }

    /// Logic coordinates of the sample with per-axis index `index`
    pub fn point(&self, index: &[usize]) -> Vec<i64> {
        (0..self.dim())
            .map(|d| self.logic_box.lo[d] + index[d] as i64 * self.delta[d])
            .collect()
    }

    /// Row-major offset of the sample at `p`, or `None` when `p` is not on
    /// the lattice
    pub fn offset_of(&self, p: &[i64]) -> Option<usize> {
        if p.len() != self.dim() {
            return None;
        }
        let dims = self.dims();
        let mut offset = 0usize;
        let mut stride = 1usize;
        for d in 0..self.dim() {
            let rel = p[d] - self.logic_box.lo[d];
            if rel < 0 || rel % self.delta[d] != 0 {
                return None;
            }
            let index = (rel / self.delta[d]) as usize;
            if index >= dims[d] {
                return None;
            }
            offset += index * stride;
            stride *= dims[d];
        }
        Some(offset)
    }
}

impl fmt::Display for LogicSamples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} delta {:?}", self.logic_box, self.delta)
    }
}

/// Row-major strides (in samples) for `dims`, axis 0 fastest
pub fn strides(dims: &[usize]) -> Vec<usize> {
    let mut ret = Vec::with_capacity(dims.len());
    let mut acc = 1usize;
    for &n in dims {
        ret.push(acc);
        acc *= n;
    }
    ret
}

struct AxisPlan {
    count: usize,
    dst_start: usize,
    dst_step: usize,
    src_start: usize,
    src_step: usize,
}

fn plan_axis(dst: &LogicSamples, src: &LogicSamples, d: usize) -> Option<AxisPlan> {
    let (dlo, dhi, dd) = (dst.logic_box.lo[d], dst.logic_box.hi[d], dst.delta[d]);
    let (slo, shi, sd) = (src.logic_box.lo[d], src.logic_box.hi[d], src.delta[d]);

    let lo = dlo.max(slo);
    let hi = dhi.min(shi);
    if lo >= hi {
        return None;
    }

    // the coarser lattice must sit on the finer one
    let (coarse_origin, coarse_delta, fine_origin, fine_delta) = if dd >= sd {
        (dlo, dd, slo, sd)
    } else {
        (slo, sd, dlo, dd)
    };
    if coarse_delta % fine_delta != 0
        || (coarse_origin - fine_origin).rem_euclid(fine_delta) != 0
    {
        return None;
    }

    let first = align_right(lo, coarse_origin, coarse_delta);
    if first >= hi {
        return None;
    }
    let count = ((hi - first + coarse_delta - 1) / coarse_delta) as usize;

    Some(AxisPlan {
        count,
        dst_start: ((first - dlo) / dd) as usize,
        dst_step: (coarse_delta / dd) as usize,
        src_start: ((first - slo) / sd) as usize,
        src_step: (coarse_delta / sd) as usize,
    })
}

/// Copy every sample present in both lattices from `src_buf` into `dst_buf`.
/// Returns the number of samples copied.
pub fn copy_samples(
    dst: &LogicSamples,
    dst_buf: &mut [u8],
    src: &LogicSamples,
    src_buf: &[u8],
    sample_size: usize,
) -> usize {
    if dst.dim() != src.dim() {
        return 0;
    }

    let mut plans = Vec::with_capacity(dst.dim());
    for d in 0..dst.dim() {
        match plan_axis(dst, src, d) {
            Some(plan) => plans.push(plan),
            None => return 0,
        }
    }

    let dst_strides = strides(&dst.dims());
    let src_strides = strides(&src.dims());
    debug_assert!(dst_buf.len() >= dst.num_samples() as usize * sample_size);
    debug_assert!(src_buf.len() >= src.num_samples() as usize * sample_size);

    let inner = &plans[0];
    let contiguous = inner.dst_step == 1 && inner.src_step == 1;
    let outer_dims = plans.len() - 1;
    let mut counter = vec![0usize; outer_dims];
    let mut copied = 0usize;

    loop {
        let mut dst_off = inner.dst_start;
        let mut src_off = inner.src_start;
        for (k, &c) in counter.iter().enumerate() {
            let plan = &plans[k + 1];
            dst_off += (plan.dst_start + c * plan.dst_step) * dst_strides[k + 1];
            src_off += (plan.src_start + c * plan.src_step) * src_strides[k + 1];
        }

        if contiguous {
            let len = inner.count * sample_size;
            let (a, b) = (dst_off * sample_size, src_off * sample_size);
            dst_buf[a..a + len].copy_from_slice(&src_buf[b..b + len]);
        } else {
            for i in 0..inner.count {
                let a = (dst_off + i * inner.dst_step) * sample_size;
                let b = (src_off + i * inner.src_step) * sample_size;
                dst_buf[a..a + sample_size].copy_from_slice(&src_buf[b..b + sample_size]);
            }
        }
        copied += inner.count;

        // odometer over the outer axes
        let mut k = 0;
        loop {
            if k == outer_dims {
                return copied;
            }
            counter[k] += 1;
            if counter[k] < plans[k + 1].count {
                break;
            }
            counter[k] = 0;
            k += 1;
        }
    }
}

/// Per-axis range of lattice points of `samples` that fall inside `region`,
/// as `(first, last)` logic coordinates. `None` when some axis has no point.
pub fn lattice_extent(samples: &LogicSamples, region: &LogicBox) -> Option<Vec<(i64, i64)>> {
    let mut ret = Vec::with_capacity(samples.dim());
    for d in 0..samples.dim() {
        let lo = samples.logic_box.lo[d].max(region.lo[d]);
        let hi = samples.logic_box.hi[d].min(region.hi[d]);
        if lo >= hi {
            return None;
        }
        let first = align_right(lo, samples.logic_box.lo[d], samples.delta[d]);
        let last = align_left(hi - 1, samples.logic_box.lo[d], samples.delta[d]);
        if first > last {
            return None;
        }
        ret.push((first, last));
    }
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lbox(lo: &[i64], hi: &[i64]) -> LogicBox {
        LogicBox::new(lo.to_vec(), hi.to_vec()).unwrap()
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_right(5, 0, 4), 8);
        assert_eq!(align_right(8, 0, 4), 8);
        assert_eq!(align_right(5, 2, 4), 6);
        assert_eq!(align_left(5, 0, 4), 4);
        assert_eq!(align_left(-1, 0, 4), -4);
    }

    #[test]
    fn test_box_validation() {
        assert!(LogicBox::new(vec![0, 0], vec![4, 4]).is_ok());
        assert!(LogicBox::new(vec![5, 0], vec![4, 4]).is_err());
        assert!(LogicBox::new(vec![0], vec![4, 4]).is_err());
        assert!(LogicBox::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_box_intersection() {
        let a = lbox(&[0, 0], &[10, 10]);
        let b = lbox(&[5, -3], &[20, 4]);
        assert_eq!(a.intersection(&b), Some(lbox(&[5, 0], &[10, 4])));
        let c = lbox(&[10, 0], &[12, 4]);
        assert_eq!(a.intersection(&c), None);
        assert!(a.contains_box(&lbox(&[1, 1], &[10, 10])));
        assert!(!a.contains_box(&b));
        assert_eq!(a.num_samples(), 100);
    }

    #[test]
    fn test_lattice_dims() {
        let s = LogicSamples::new(lbox(&[0, 4], &[16, 12]), vec![4, 2]);
        assert_eq!(s.dims(), vec![4, 4]);
        assert_eq!(s.num_samples(), 16);
        assert_eq!(s.point(&[1, 3]), vec![4, 10]);
    }

    #[test]
    fn test_offset_of() {
        let samples = LogicSamples::new(lbox(&[2, 0], &[10, 8]), vec![2, 4]);
        assert_eq!(samples.dims(), vec![4, 2]);
        assert_eq!(samples.offset_of(&[2, 0]), Some(0));
        assert_eq!(samples.offset_of(&[6, 0]), Some(2));
        assert_eq!(samples.offset_of(&[8, 4]), Some(7));
        assert_eq!(samples.point(&[3, 1]), vec![8, 4]);
        assert_eq!(samples.offset_of(&[3, 0]), None);
        assert_eq!(samples.offset_of(&[10, 0]), None);
        assert_eq!(samples.offset_of(&[0, 0]), None);
        assert_eq!(samples.offset_of(&[2]), None);
    }

    #[test]
    fn test_copy_same_lattice_crop() {
        // 4x4 source, copy its interior 2x2 into a 2x2 destination
        let src = LogicSamples::new(lbox(&[0, 0], &[4, 4]), vec![1, 1]);
        let src_buf: Vec<u8> = (0..16).collect();
        let dst = LogicSamples::new(lbox(&[1, 1], &[3, 3]), vec![1, 1]);
        let mut dst_buf = vec![0u8; 4];
        assert_eq!(copy_samples(&dst, &mut dst_buf, &src, &src_buf, 1), 4);
        assert_eq!(dst_buf, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_copy_coarse_into_fine() {
        // coarse lattice at stride 2 lands on every other sample of the fine one
        let src = LogicSamples::new(lbox(&[0, 0], &[4, 4]), vec![2, 2]);
        let src_buf = vec![1u8, 2, 3, 4];
        let dst = LogicSamples::new(lbox(&[0, 0], &[4, 4]), vec![1, 1]);
        let mut dst_buf = vec![0u8; 16];
        assert_eq!(copy_samples(&dst, &mut dst_buf, &src, &src_buf, 1), 4);
        assert_eq!(dst_buf[0], 1);
        assert_eq!(dst_buf[2], 2);
        assert_eq!(dst_buf[8], 3);
        assert_eq!(dst_buf[10], 4);
        assert_eq!(dst_buf.iter().filter(|&&v| v != 0).count(), 4);
    }

    #[test]
    fn test_copy_fine_into_coarse_with_offset_origin() {
        // odd columns only (origin 1, delta 2) taken from a dense source
        let src = LogicSamples::new(lbox(&[0], &[8]), vec![1]);
        let src_buf: Vec<u8> = (10..18).collect();
        let dst = LogicSamples::new(lbox(&[1], &[9]), vec![2]);
        let mut dst_buf = vec![0u8; 4];
        assert_eq!(copy_samples(&dst, &mut dst_buf, &src, &src_buf, 1), 4);
        assert_eq!(dst_buf, vec![11, 13, 15, 17]);
    }

    #[test]
    fn test_copy_disjoint_lattices() {
        // even vs odd positions never meet
        let a = LogicSamples::new(lbox(&[0], &[8]), vec![2]);
        let b = LogicSamples::new(lbox(&[1], &[9]), vec![2]);
        let mut buf = vec![0u8; 4];
        assert_eq!(copy_samples(&a, &mut buf, &b, &[1, 2, 3, 4], 1), 0);
    }

    #[test]
    fn test_copy_multibyte_samples() {
        let src = LogicSamples::new(lbox(&[0, 0], &[2, 2]), vec![1, 1]);
        let src_buf: Vec<u8> = (0..8).collect();
        let dst = LogicSamples::new(lbox(&[1, 0], &[2, 2]), vec![1, 1]);
        let mut dst_buf = vec![0u8; 4];
        copy_samples(&dst, &mut dst_buf, &src, &src_buf, 2);
        assert_eq!(dst_buf, vec![2, 3, 6, 7]);
    }

    #[test]
    fn test_lattice_extent() {
        let s = LogicSamples::new(lbox(&[1, 0], &[17, 8]), vec![2, 4]);
        let region = lbox(&[4, 1], &[9, 8]);
        assert_eq!(lattice_extent(&s, &region), Some(vec![(5, 7), (4, 4)]));
        let thin = lbox(&[4, 1], &[5, 3]);
        assert_eq!(lattice_extent(&s, &thin), None);
    }
}

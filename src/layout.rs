//! HZ block layout - maps block ids to the sample lattices they store

use crate::bitmask::{Bitmask, HzOrder};
use crate::error::{IdxError, Result};
use crate::geometry::{align_left, align_right, lattice_extent, LogicBox, LogicSamples};
use std::ops::{Range, RangeInclusive};

/// Samples held by one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSamples {
    pub block: u64,
    /// Finest level stored in the block (block 0 holds every level up to this one)
    pub level: usize,
    pub samples: LogicSamples,
}

/// Block addressing for a bitmask and a block size of `2^bits_per_block`
/// HZ addresses.
///
/// Block 0 stores levels `0..=B` as the full resolution-`B` lattice. Every
/// other block stores a regular piece of exactly one level `H > B`; level `H`
/// owns blocks `2^(H-B-1)..2^(H-B)`, ordered by the Z-interleave of their grid
/// position.
#[derive(Debug, Clone)]
pub struct HzLayout {
    bitmask: Bitmask,
    hzorder: HzOrder,
    bits_per_block: usize,
    logic_box: LogicBox,
    /// `counts[h][d]`: positions `1..=h` of the bitmask naming axis `d`
    counts: Vec<Vec<u32>>,
}

impl HzLayout {
    pub fn new(bitmask: Bitmask, bits_per_block: usize, logic_box: LogicBox) -> Result<Self> {
        if bitmask.pdim() != logic_box.dim() {
            return Err(IdxError::InvalidGeometry(format!(
                "bitmask {} has {} axes but the logic box has {}",
                bitmask,
                bitmask.pdim(),
                logic_box.dim()
            )));
        }
        let pow2 = bitmask.pow2_dims();
        for d in 0..logic_box.dim() {
            if logic_box.lo[d] < 0 || logic_box.hi[d] > pow2[d] {
                return Err(IdxError::InvalidGeometry(format!(
                    "logic box {} is not covered by bitmask {} (power of two box {:?})",
                    logic_box, bitmask, pow2
                )));
            }
        }

        let maxh = bitmask.max_resolution();
        let counts = (0..=maxh).map(|h| bitmask.axis_counts(h)).collect();
        Ok(Self {
            hzorder: HzOrder::new(&bitmask),
            bits_per_block: bits_per_block.min(maxh),
            bitmask,
            logic_box,
            counts,
        })
    }

    pub fn bitmask(&self) -> &Bitmask {
        &self.bitmask
    }

    pub fn hz_order(&self) -> &HzOrder {
        &self.hzorder
    }

    pub fn logic_box(&self) -> &LogicBox {
        &self.logic_box
    }

    pub fn pdim(&self) -> usize {
        self.bitmask.pdim()
    }

    pub fn max_resolution(&self) -> usize {
        self.bitmask.max_resolution()
    }

    pub fn bits_per_block(&self) -> usize {
        self.bits_per_block
    }

    pub fn samples_per_block(&self) -> u64 {
        1u64 << self.bits_per_block
    }

    pub fn total_blocks(&self) -> u64 {
        1u64 << (self.max_resolution() - self.bits_per_block)
    }

    /// Distance between resolution-`h` lattice points on each axis
    pub fn level_stride(&self, h: usize) -> Vec<i64> {
        let h = h.min(self.max_resolution());
        self.bitmask
            .pow2_dims()
            .iter()
            .zip(&self.counts[h])
            .map(|(&p, &c)| p >> c)
            .collect()
    }

    /// Origin and spacing of the samples that appear first at level `h >= 1`
    fn level_lattice(&self, h: usize) -> (Vec<i64>, Vec<i64>) {
        let axis = self.bitmask.axis(h);
        let stride = self.level_stride(h);
        let mut origin = vec![0i64; self.pdim()];
        origin[axis] = stride[axis];
        let mut delta = stride;
        delta[axis] *= 2;
        (origin, delta)
    }

    /// Finest level stored in `block`
    pub fn block_level(&self, block: u64) -> usize {
        if block == 0 {
            self.bits_per_block
        } else {
            self.bits_per_block + 1 + (63 - block.leading_zeros() as usize)
        }
    }

    /// Block ids that hold samples of level `h`
    pub fn level_blocks(&self, h: usize) -> Range<u64> {
        if h <= self.bits_per_block {
            0..1
        } else {
            let l = h - self.bits_per_block - 1;
            (1u64 << l)..(1u64 << (l + 1))
        }
    }

    /// HZ addresses covered by `block`
    pub fn hz_range(&self, block: u64) -> Range<u64> {
        let n = self.samples_per_block();
        block * n..(block + 1) * n
    }

    fn check_block(&self, block: u64) -> Result<()> {
        if block >= self.total_blocks() {
            return Err(IdxError::OutOfBounds(format!(
                "block {} (dataset has {} blocks)",
                block,
                self.total_blocks()
            )));
        }
        Ok(())
    }

    /// Level and grid position of a block within its level
    pub fn block_coords(&self, block: u64) -> Result<(usize, Vec<i64>)> {
        self.check_block(block)?;
        let level = self.block_level(block);
        if block == 0 {
            return Ok((level, vec![0; self.pdim()]));
        }
        let l = level - self.bits_per_block - 1;
        let coords = self.bitmask.deinterleave(block - (1u64 << l), l);
        Ok((level, coords))
    }

    /// Inverse of [`HzLayout::block_coords`]
    pub fn block_id(&self, level: usize, coords: &[i64]) -> Result<u64> {
        if level > self.max_resolution() {
            return Err(IdxError::OutOfBounds(format!(
                "level {} exceeds max resolution {}",
                level,
                self.max_resolution()
            )));
        }
        if level <= self.bits_per_block {
            return Ok(0);
        }
        let l = level - self.bits_per_block - 1;
        let grid = self.level_stride(l);
        let pow2 = self.bitmask.pow2_dims();
        for d in 0..self.pdim() {
            if coords[d] < 0 || coords[d] >= pow2[d] / grid[d] {
                return Err(IdxError::OutOfBounds(format!(
                    "block position {:?} at level {}",
                    coords, level
                )));
            }
        }
        Ok((1u64 << l) + self.bitmask.interleave(coords, l))
    }

    /// Sample lattice stored by `block`, row-major with axis 0 fastest
    pub fn block_samples(&self, block: u64) -> Result<BlockSamples> {
        let (level, coords) = self.block_coords(block)?;
        let pow2 = self.bitmask.pow2_dims().to_vec();

        if block == 0 {
            let logic_box = LogicBox { lo: vec![0; self.pdim()], hi: pow2 };
            let delta = self.level_stride(self.bits_per_block);
            return Ok(BlockSamples {
                block,
                level,
                samples: LogicSamples::new(logic_box, delta),
            });
        }

        let period = self.level_stride(level - self.bits_per_block - 1);
        let (origin, delta) = self.level_lattice(level);
        let lo: Vec<i64> = (0..self.pdim()).map(|d| origin[d] + coords[d] * period[d]).collect();
        let hi: Vec<i64> = lo.iter().zip(&period).map(|(a, p)| a + p).collect();
        Ok(BlockSamples {
            block,
            level,
            samples: LogicSamples::new(LogicBox { lo, hi }, delta),
        })
    }

    fn pow2_box(&self) -> LogicBox {
        LogicBox {
            lo: vec![0; self.pdim()],
            hi: self.bitmask.pow2_dims().to_vec(),
        }
    }

    /// Blocks, ascending, holding at least one sample inside `region` for the
    /// given levels
    pub fn blocks_in_box(&self, region: &LogicBox, levels: RangeInclusive<usize>) -> Vec<u64> {
        let mut ret = Vec::new();
        let region = match region.intersection(&self.pow2_box()) {
            Some(r) => r,
            None => return ret,
        };
        let (h0, h1) = (*levels.start(), (*levels.end()).min(self.max_resolution()));
        if h0 > h1 {
            return ret;
        }

        if h0 <= self.bits_per_block {
            if let Ok(block0) = self.block_samples(0) {
                if lattice_extent(&block0.samples, &region).is_some() {
                    ret.push(0);
                }
            }
        }

        for h in h0.max(self.bits_per_block + 1)..=h1 {
            let l = h - self.bits_per_block - 1;
            let period = self.level_stride(l);
            let (origin, delta) = self.level_lattice(h);

            let mut ranges = Vec::with_capacity(self.pdim());
            for d in 0..self.pdim() {
                let first = align_right(region.lo[d], origin[d], delta[d]);
                let last = align_left(region.hi[d] - 1, origin[d], delta[d]);
                if first > last {
                    break;
                }
                ranges.push(((first - origin[d]) / period[d], (last - origin[d]) / period[d]));
            }
            if ranges.len() != self.pdim() {
                continue;
            }

            let base = 1u64 << l;
            let mut c: Vec<i64> = ranges.iter().map(|r| r.0).collect();
            'odometer: loop {
                ret.push(base + self.bitmask.interleave(&c, l));
                let mut d = 0;
                loop {
                    if d == c.len() {
                        break 'odometer;
                    }
                    c[d] += 1;
                    if c[d] <= ranges[d].1 {
                        break;
                    }
                    c[d] = ranges[d].0;
                    d += 1;
                }
            }
        }

        ret.sort_unstable();
        ret
    }

    /// Resolution-`h` lattice aligned outward so that its box covers `region`
    pub fn resolution_samples(&self, region: &LogicBox, h: usize) -> LogicSamples {
        let delta = self.level_stride(h);
        let lo = (0..region.dim()).map(|d| align_left(region.lo[d], 0, delta[d])).collect();
        let hi = (0..region.dim()).map(|d| align_right(region.hi[d], 0, delta[d])).collect();
        LogicSamples::new(LogicBox { lo, hi }, delta)
    }

    /// Finest level whose lattice over `region` has at most `max_samples`
    /// samples. Level 0 when nothing fits.
    pub fn max_resolution_for_budget(&self, region: &LogicBox, max_samples: u64) -> usize {
        (0..=self.max_resolution())
            .rev()
            .find(|&h| self.resolution_samples(region, h).num_samples() <= max_samples)
            .unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "{}D logic box {}, bitmask {}, {} samples/block, {} blocks",
            self.pdim(),
            self.logic_box,
            self.bitmask,
            self.samples_per_block(),
            self.total_blocks()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn create_test_layout(dims: &[i64], bits_per_block: usize) -> HzLayout {
        let bitmask = Bitmask::guess(dims, true).unwrap();
        HzLayout::new(bitmask, bits_per_block, LogicBox::from_dims(dims).unwrap()).unwrap()
    }

    fn points_of(samples: &LogicSamples) -> Vec<Vec<i64>> {
        let dims = samples.dims();
        let total = samples.num_samples() as usize;
        (0..total)
            .map(|mut i| {
                let idx: Vec<usize> = dims
                    .iter()
                    .map(|&n| {
                        let v = i % n;
                        i /= n;
                        v
                    })
                    .collect();
                samples.point(&idx)
            })
            .collect()
    }

    #[test]
    fn test_cube_layout() {
        let layout = create_test_layout(&[256, 256, 256], 18);
        assert_eq!(layout.max_resolution(), 24);
        assert_eq!(layout.total_blocks(), 64);

        let block0 = layout.block_samples(0).unwrap();
        assert_eq!(block0.level, 18);
        assert_eq!(block0.samples.dims(), vec![64, 64, 64]);
        assert_eq!(block0.samples.delta, vec![4, 4, 4]);

        // every block holds exactly 2^B samples
        for b in 0..layout.total_blocks() {
            let bs = layout.block_samples(b).unwrap();
            assert_eq!(bs.samples.num_samples(), layout.samples_per_block());
        }
    }

    #[test]
    fn test_block_id_bijection() {
        let layout = create_test_layout(&[16, 8, 4], 3);
        for b in 0..layout.total_blocks() {
            let (level, coords) = layout.block_coords(b).unwrap();
            assert_eq!(layout.block_id(level, &coords).unwrap(), b);
            assert!(layout.level_blocks(level).contains(&b));
        }
        assert!(layout.block_samples(layout.total_blocks()).is_err());
    }

    #[test]
    fn test_blocks_partition_the_volume() {
        let layout = create_test_layout(&[8, 8], 2);
        let mut seen = HashSet::new();
        for b in 0..layout.total_blocks() {
            let bs = layout.block_samples(b).unwrap();
            for p in points_of(&bs.samples) {
                assert!(seen.insert(p.clone()), "point {:?} stored twice", p);
                // the block stores exactly the HZ addresses it covers
                let hz = layout.hz_order().address(&p);
                assert!(layout.hz_range(b).contains(&hz), "block {} point {:?}", b, p);
            }
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_coarse_lattices_nest() {
        let layout = create_test_layout(&[32, 16, 8], 4);
        for h in 0..layout.max_resolution() {
            let coarse = layout.level_stride(h);
            let fine = layout.level_stride(h + 1);
            for d in 0..3 {
                assert_eq!(coarse[d] % fine[d], 0);
            }
        }
        assert_eq!(layout.level_stride(0), vec![32, 16, 8]);
        assert_eq!(layout.level_stride(layout.max_resolution()), vec![1, 1, 1]);
    }

    #[test]
    fn test_blocks_in_box_matches_brute_force() {
        let layout = create_test_layout(&[16, 16], 3);
        let region = LogicBox::new(vec![3, 5], vec![11, 9]).unwrap();
        let maxh = layout.max_resolution();
        for h0 in 0..=maxh {
            for h1 in h0..=maxh {
                let got = layout.blocks_in_box(&region, h0..=h1);
                let mut want = Vec::new();
                for b in 0..layout.total_blocks() {
                    let bs = layout.block_samples(b).unwrap();
                    let first_level = if b == 0 { 0 } else { bs.level };
                    if bs.level < h0 || first_level > h1 {
                        continue;
                    }
                    if lattice_extent(&bs.samples, &region).is_some() {
                        want.push(b);
                    }
                }
                assert_eq!(got, want, "levels {}..={}", h0, h1);
            }
        }
    }

    #[test]
    fn test_full_box_needs_every_block() {
        let layout = create_test_layout(&[64, 64, 64], 9);
        let all = layout.blocks_in_box(layout.logic_box(), 0..=layout.max_resolution());
        assert_eq!(all, (0..layout.total_blocks()).collect::<Vec<_>>());
    }

    #[test]
    fn test_resolution_samples_align_outward() {
        let layout = create_test_layout(&[256, 256, 256], 18);
        let region = LogicBox::new(vec![10, 0, 0], vec![30, 256, 256]).unwrap();
        let s = layout.resolution_samples(&region, 12);
        assert_eq!(s.delta, vec![16, 16, 16]);
        assert_eq!(s.logic_box.lo, vec![0, 0, 0]);
        assert_eq!(s.logic_box.hi, vec![32, 256, 256]);
        assert!(s.logic_box.contains_box(&region));
    }

    #[test]
    fn test_budget() {
        let layout = create_test_layout(&[256, 256, 256], 18);
        let full = layout.logic_box().clone();
        let h = layout.max_resolution_for_budget(&full, 4096);
        assert_eq!(h, 12);
        assert_eq!(layout.resolution_samples(&full, h).dims(), vec![16, 16, 16]);
        assert_eq!(layout.max_resolution_for_budget(&full, u64::MAX), 24);
        assert_eq!(layout.max_resolution_for_budget(&full, 0), 0);
    }

    #[test]
    fn test_logic_box_must_fit_bitmask() {
        let bitmask = Bitmask::parse("V0101").unwrap();
        let too_big = LogicBox::from_dims(&[8, 4]).unwrap();
        assert!(HzLayout::new(bitmask.clone(), 2, too_big).is_err());
        let wrong_dim = LogicBox::from_dims(&[4, 4, 4]).unwrap();
        assert!(HzLayout::new(bitmask, 2, wrong_dim).is_err());
    }
}

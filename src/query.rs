//! Progressive box queries, point queries and region writes
//!
//! A [`BoxQuery`] walks `Created -> Began -> (Executing -> Refined)* -> Ended`.
//! Each step fetches only the blocks of the levels it adds and merges them
//! into a lattice that keeps the coarser samples already read.

use crate::access::{AccessMode, AccessSession};
use crate::blockstore::BlockKey;
use crate::descriptor::{Descriptor, Field};
use crate::error::{IdxError, Result};
use crate::geometry::{align_left, copy_samples, lattice_extent, LogicBox, LogicSamples};
use crate::layout::HzLayout;
use crate::types::filled_buffer;
use bytes::Bytes;
use futures::stream::{self, Stream};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tuning of a box query
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Upper bound on the number of output samples
    pub max_samples: Option<u64>,
    /// Explicit, strictly increasing end resolutions
    pub end_resolutions: Vec<usize>,
    /// Number of steps, `pdim` levels apart, when no explicit list is given
    pub num_refinements: usize,
    /// Non-positive offset applied to the finest affordable level
    pub quality: i32,
    /// Checked between block fetches
    pub abort: CancellationToken,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_samples: None,
            end_resolutions: Vec::new(),
            num_refinements: 1,
            quality: 0,
            abort: CancellationToken::new(),
        }
    }
}

impl QueryOptions {
    pub fn with_max_samples(mut self, max_samples: u64) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    pub fn with_end_resolutions(mut self, levels: Vec<usize>) -> Self {
        self.end_resolutions = levels;
        self
    }

    pub fn with_num_refinements(mut self, n: usize) -> Self {
        self.num_refinements = n;
        self
    }

    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Created,
    Began,
    Running,
    Ended,
}

/// What a query has produced so far
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryProgress {
    /// Achieved resolution level
    pub level: usize,
    /// Achieved box and sample spacing
    pub samples: LogicSamples,
    /// Samples per axis of the buffer
    pub dims: Vec<usize>,
    /// Whether a refinement step remains
    pub finer_available: bool,
    /// Blocks merged by the last step
    pub blocks_read: usize,
    /// Blocks of the last step never written to storage
    pub blocks_missing: usize,
}

/// One step of [`BoxQuery::stream`]
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub progress: QueryProgress,
    pub buffer: Bytes,
}

/// Resumable, progressively refined read of a box of one field
#[derive(Debug)]
pub struct BoxQuery {
    layout: Arc<HzLayout>,
    descriptor: Descriptor,
    field_name: String,
    timestep: u32,
    requested: LogicBox,
    options: QueryOptions,
    state: QueryState,

    field_index: usize,
    field: Option<Field>,
    region: Option<LogicBox>,
    end_resolutions: Vec<usize>,
    cursor: usize,

    level: Option<usize>,
    samples: Option<LogicSamples>,
    buffer: Vec<u8>,
    last_read: (usize, usize),
}

impl BoxQuery {
    pub fn new(
        descriptor: Descriptor,
        layout: Arc<HzLayout>,
        field: impl Into<String>,
        timestep: u32,
        region: LogicBox,
        options: QueryOptions,
    ) -> Self {
        Self {
            layout,
            descriptor,
            field_name: field.into(),
            timestep,
            requested: region,
            options,
            state: QueryState::Created,
            field_index: 0,
            field: None,
            region: None,
            end_resolutions: Vec::new(),
            cursor: 0,
            level: None,
            samples: None,
            buffer: Vec::new(),
            last_read: (0, 0),
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Requested box clamped to the dataset, once begun
    pub fn region(&self) -> Option<&LogicBox> {
        self.region.as_ref()
    }

    pub fn end_resolutions(&self) -> &[usize] {
        &self.end_resolutions
    }

    /// Achieved level
    pub fn level(&self) -> Option<usize> {
        self.level
    }

    pub fn samples(&self) -> Option<&LogicSamples> {
        self.samples.as_ref()
    }

    /// Output buffer, row-major with axis 0 fastest
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Validate the query and compute its resolution schedule.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != QueryState::Created {
            return Err(IdxError::InvalidState(format!(
                "begin() on a query in state {:?}",
                self.state
            )));
        }

        let logic_box = self.layout.logic_box();
        if self.requested.dim() != logic_box.dim() {
            return Err(IdxError::InvalidGeometry(format!(
                "{}D query box on a {}D dataset",
                self.requested.dim(),
                logic_box.dim()
            )));
        }
        self.field_index = self.descriptor.field_index(&self.field_name)?;
        if self.timestep >= self.descriptor.timesteps {
            return Err(IdxError::OutOfBounds(format!(
                "timestep {} (dataset has {})",
                self.timestep, self.descriptor.timesteps
            )));
        }
        let region = self.requested.intersection(logic_box).ok_or_else(|| {
            IdxError::OutOfBounds(format!(
                "query box {} does not intersect {}",
                self.requested, logic_box
            ))
        })?;

        let maxh = self.layout.max_resolution();
        let mut cap = match self.options.max_samples {
            Some(budget) => self.layout.max_resolution_for_budget(&region, budget),
            None => maxh,
        };
        if self.options.quality < 0 {
            cap = cap.saturating_sub(self.options.quality.unsigned_abs() as usize);
        }

        self.end_resolutions = if self.options.end_resolutions.is_empty() {
            let pdim = self.layout.pdim();
            let steps = self.options.num_refinements.max(1);
            let mut levels: Vec<usize> = (0..steps)
                .rev()
                .filter_map(|k| cap.checked_sub(k * pdim))
                .collect();
            levels.dedup();
            levels
        } else {
            let explicit = &self.options.end_resolutions;
            if explicit.windows(2).any(|w| w[0] >= w[1]) {
                return Err(IdxError::InvalidGeometry(format!(
                    "end resolutions {:?} are not strictly increasing",
                    explicit
                )));
            }
            if let Some(&h) = explicit.iter().find(|&&h| h > maxh) {
                return Err(IdxError::OutOfBounds(format!(
                    "end resolution {} exceeds max resolution {}",
                    h, maxh
                )));
            }
            let mut levels: Vec<usize> = explicit.iter().map(|&h| h.min(cap)).collect();
            levels.dedup();
            levels
        };

        debug!(
            field = %self.field_name,
            timestep = self.timestep,
            region = %region,
            levels = ?self.end_resolutions,
            "query begun"
        );
        self.field = self.descriptor.fields.get(self.field_index).cloned();
        self.region = Some(region);
        self.cursor = 0;
        self.state = QueryState::Began;
        Ok(())
    }

    /// Read up to the first end resolution. Repeating the call after a
    /// successful step returns the current progress.
    pub async fn execute(&mut self, session: &AccessSession) -> Result<QueryProgress> {
        match self.state {
            QueryState::Began | QueryState::Running => {}
            state => {
                return Err(IdxError::InvalidState(format!(
                    "execute() on a query in state {:?}",
                    state
                )))
            }
        }
        let target = self.end_resolutions[self.cursor];
        if self.level != Some(target) {
            self.run_to(session, target).await?;
        }
        self.state = QueryState::Running;
        self.progress()
    }

    /// Advance to the next end resolution. At the last one this is a no-op
    /// reporting `finer_available == false`.
    pub async fn refine(&mut self, session: &AccessSession) -> Result<QueryProgress> {
        match self.state {
            QueryState::Began => return self.execute(session).await,
            QueryState::Running => {}
            state => {
                return Err(IdxError::InvalidState(format!(
                    "refine() on a query in state {:?}",
                    state
                )))
            }
        }
        if self.level != Some(self.end_resolutions[self.cursor]) {
            // previous step was aborted or failed
            return self.execute(session).await;
        }
        if self.cursor + 1 < self.end_resolutions.len() {
            let target = self.end_resolutions[self.cursor + 1];
            self.run_to(session, target).await?;
            self.cursor += 1;
        }
        self.progress()
    }

    /// Finish the query; the output buffer stays readable.
    pub fn end(&mut self) {
        self.end_resolutions.clear();
        self.cursor = 0;
        self.state = QueryState::Ended;
    }

    /// Drive the query to completion as a stream of snapshots, one per level.
    pub fn stream(self, session: &AccessSession) -> impl Stream<Item = Result<QuerySnapshot>> + '_ {
        stream::try_unfold((self, false), move |(query, done)| stream_step(query, session, done))
    }

    fn progress(&self) -> Result<QueryProgress> {
        let (level, samples) = match (self.level, &self.samples) {
            (Some(level), Some(samples)) => (level, samples.clone()),
            _ => return Err(IdxError::InvalidState("query has not run".to_string())),
        };
        Ok(QueryProgress {
            level,
            dims: samples.dims(),
            samples,
            finer_available: self.cursor + 1 < self.end_resolutions.len(),
            blocks_read: self.last_read.0,
            blocks_missing: self.last_read.1,
        })
    }

    /// Build the lattice for `target` in a scratch buffer and swap it in once
    /// every block has been merged.
    async fn run_to(&mut self, session: &AccessSession, target: usize) -> Result<()> {
        let (field, region) = match (&self.field, &self.region) {
            (Some(f), Some(r)) => (f.clone(), r.clone()),
            _ => return Err(IdxError::InvalidState("query has not begun".to_string())),
        };
        let sample_size = field.dtype.sample_size();
        let samples = self.layout.resolution_samples(&region, target);
        let mut buffer = filled_buffer(field.dtype, samples.num_samples(), field.default_value);

        let first_level = match (&self.samples, self.level) {
            (Some(old), Some(level)) if level < target => {
                copy_samples(&samples, &mut buffer, old, &self.buffer, sample_size);
                level + 1
            }
            _ => 0,
        };

        let fetch_box = samples
            .logic_box
            .intersection(self.layout.logic_box())
            .unwrap_or_else(|| region.clone());
        let blocks = self.layout.blocks_in_box(&fetch_box, first_level..=target);
        debug!(
            field = %field.name,
            levels = ?(first_level..=target),
            blocks = blocks.len(),
            "fetching blocks"
        );

        let (mut read, mut missing) = (0usize, 0usize);
        for block in blocks {
            if self.options.abort.is_cancelled() {
                return Err(IdxError::Aborted);
            }
            let key = BlockKey::new(self.field_index, self.timestep, block);
            match session.fetch(&key).await? {
                Some(data) => {
                    let block_samples = self.layout.block_samples(block)?;
                    copy_samples(&samples, &mut buffer, &block_samples.samples, &data, sample_size);
                    read += 1;
                }
                None => missing += 1,
            }
        }

        self.samples = Some(samples);
        self.buffer = buffer;
        self.level = Some(target);
        self.last_read = (read, missing);
        Ok(())
    }
}

async fn stream_step(
    mut query: BoxQuery,
    session: &AccessSession,
    done: bool,
) -> Result<Option<(QuerySnapshot, (BoxQuery, bool))>> {
    if done {
        return Ok(None);
    }
    if query.state == QueryState::Created {
        query.begin()?;
    }
    let progress = if query.level.is_none() {
        query.execute(session).await?
    } else {
        query.refine(session).await?
    };
    let finished = !progress.finer_available;
    let snapshot = QuerySnapshot {
        progress,
        buffer: Bytes::copy_from_slice(&query.buffer),
    };
    if finished {
        query.end();
    }
    Ok(Some((snapshot, (query, finished))))
}

/// Outcome of a [`PointQuery`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointProgress {
    /// Resolution the points were snapped to
    pub resolution: usize,
    pub points: usize,
    /// Points outside the dataset, left at the default value
    pub points_outside: usize,
    pub blocks_read: usize,
    pub blocks_missing: usize,
}

/// Samples of one field at arbitrary integer points.
///
/// Every point is snapped down to the lattice of the query resolution and
/// read from the block that stores it. Blocks are fetched once however many
/// points they serve. The output holds one sample per point, in input order.
#[derive(Debug)]
pub struct PointQuery {
    layout: Arc<HzLayout>,
    descriptor: Descriptor,
    field_name: String,
    timestep: u32,
    points: Vec<Vec<i64>>,
    resolution: Option<usize>,
    abort: CancellationToken,
    state: QueryState,

    field_index: usize,
    field: Option<Field>,
    buffer: Vec<u8>,
}

impl PointQuery {
    pub fn new(
        descriptor: Descriptor,
        layout: Arc<HzLayout>,
        field: impl Into<String>,
        timestep: u32,
        points: Vec<Vec<i64>>,
    ) -> Self {
        Self {
            layout,
            descriptor,
            field_name: field.into(),
            timestep,
            points,
            resolution: None,
            abort: CancellationToken::new(),
            state: QueryState::Created,
            field_index: 0,
            field: None,
            buffer: Vec::new(),
        }
    }

    /// Read at level `h` instead of the finest level
    pub fn with_resolution(mut self, h: usize) -> Self {
        self.resolution = Some(h);
        self
    }

    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = token;
        self
    }

    /// `counts[d]` evenly spaced points per axis over `region`, axis 0 fastest
    pub fn grid(region: &LogicBox, counts: &[usize]) -> Result<Vec<Vec<i64>>> {
        if counts.len() != region.dim() || counts.contains(&0) {
            return Err(IdxError::InvalidGeometry(format!(
                "point grid {:?} over box {}",
                counts, region
            )));
        }
        let size = region.size();
        let total: usize = counts.iter().product();
        let mut ret = Vec::with_capacity(total);
        let mut index = vec![0usize; counts.len()];
        for _ in 0..total {
            ret.push(
                (0..counts.len())
                    .map(|d| region.lo[d] + (index[d] as i64 * size[d]) / counts[d] as i64)
                    .collect(),
            );
            for d in 0..counts.len() {
                index[d] += 1;
                if index[d] < counts[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        Ok(ret)
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn points(&self) -> &[Vec<i64>] {
        &self.points
    }

    /// Level the points are read at
    pub fn resolution(&self) -> usize {
        self.resolution.unwrap_or_else(|| self.layout.max_resolution())
    }

    /// One sample per point, in input order
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state != QueryState::Created {
            return Err(IdxError::InvalidState(format!(
                "begin() on a point query in state {:?}",
                self.state
            )));
        }
        self.field_index = self.descriptor.field_index(&self.field_name)?;
        if self.timestep >= self.descriptor.timesteps {
            return Err(IdxError::OutOfBounds(format!(
                "timestep {} (dataset has {})",
                self.timestep, self.descriptor.timesteps
            )));
        }
        let maxh = self.layout.max_resolution();
        if self.resolution() > maxh {
            return Err(IdxError::OutOfBounds(format!(
                "resolution {} exceeds max resolution {}",
                self.resolution(),
                maxh
            )));
        }
        let pdim = self.layout.pdim();
        if let Some(p) = self.points.iter().find(|p| p.len() != pdim) {
            return Err(IdxError::InvalidGeometry(format!(
                "point {:?} on a {}D dataset",
                p, pdim
            )));
        }
        self.field = self.descriptor.fields.get(self.field_index).cloned();
        self.state = QueryState::Began;
        Ok(())
    }

    /// Fetch every block holding a point. A failed or aborted run leaves the
    /// query begun so it can be retried.
    pub async fn execute(&mut self, session: &AccessSession) -> Result<PointProgress> {
        if self.state != QueryState::Began {
            return Err(IdxError::InvalidState(format!(
                "execute() on a point query in state {:?}",
                self.state
            )));
        }
        let field = self
            .field
            .clone()
            .ok_or_else(|| IdxError::InvalidState("point query has not begun".to_string()))?;
        let resolution = self.resolution();
        let stride = self.layout.level_stride(resolution);
        let order = self.layout.hz_order();
        let bits = self.layout.bits_per_block();
        let logic_box = self.layout.logic_box();

        let mut plan: BTreeMap<u64, Vec<(usize, Vec<i64>)>> = BTreeMap::new();
        let mut outside = 0usize;
        for (i, p) in self.points.iter().enumerate() {
            if !logic_box.contains_point(p) {
                outside += 1;
                continue;
            }
            let snapped: Vec<i64> = p.iter().zip(&stride).map(|(&x, &s)| align_left(x, 0, s)).collect();
            let block = order.address(&snapped) >> bits;
            plan.entry(block).or_default().push((i, snapped));
        }
        debug!(
            field = %field.name,
            points = self.points.len(),
            resolution,
            blocks = plan.len(),
            "fetching point blocks"
        );

        let sample_size = field.dtype.sample_size();
        let mut buffer = filled_buffer(field.dtype, self.points.len() as u64, field.default_value);
        let (mut read, mut missing) = (0usize, 0usize);
        for (block, points) in plan {
            if self.abort.is_cancelled() {
                return Err(IdxError::Aborted);
            }
            let key = BlockKey::new(self.field_index, self.timestep, block);
            let data = match session.fetch(&key).await? {
                Some(data) => data,
                None => {
                    missing += 1;
                    continue;
                }
            };
            let samples = self.layout.block_samples(block)?.samples;
            for (i, p) in points {
                let sample = samples
                    .offset_of(&p)
                    .and_then(|o| data.get(o * sample_size..(o + 1) * sample_size))
                    .ok_or_else(|| {
                        IdxError::ReadFailure(format!("{} does not hold point {:?}", key, p))
                    })?;
                buffer[i * sample_size..(i + 1) * sample_size].copy_from_slice(sample);
            }
            read += 1;
        }

        self.buffer = buffer;
        self.state = QueryState::Ended;
        Ok(PointProgress {
            resolution,
            points: self.points.len(),
            points_outside: outside,
            blocks_read: read,
            blocks_missing: missing,
        })
    }
}

/// Outcome of [`write_box`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Blocks fully covered and written fresh
    pub blocks_written: usize,
    /// Blocks read, merged and written back
    pub blocks_merged: usize,
}

/// Write a full-resolution buffer covering `region` of one field.
pub async fn write_box(
    session: &AccessSession,
    layout: &HzLayout,
    field_index: usize,
    field: &Field,
    timestep: u32,
    region: &LogicBox,
    buffer: &[u8],
) -> Result<WriteSummary> {
    if session.mode() != AccessMode::Write {
        return Err(IdxError::WriteError("session was opened read-only".to_string()));
    }
    let logic_box = layout.logic_box();
    if region.dim() != logic_box.dim() || region.is_empty() {
        return Err(IdxError::InvalidGeometry(format!(
            "cannot write box {} into a {}D dataset",
            region,
            logic_box.dim()
        )));
    }
    if !logic_box.contains_box(region) {
        return Err(IdxError::OutOfBounds(format!(
            "write box {} is outside {}",
            region, logic_box
        )));
    }
    let expected = field.dtype.byte_size(region.num_samples());
    if buffer.len() != expected {
        return Err(IdxError::InvalidGeometry(format!(
            "buffer holds {} bytes, box {} needs {}",
            buffer.len(),
            region,
            expected
        )));
    }

    let sample_size = field.dtype.sample_size();
    let source = LogicSamples::new(region.clone(), vec![1; region.dim()]);
    let mut plan = Vec::new();
    for block in layout.blocks_in_box(region, 0..=layout.max_resolution()) {
        let block_samples = layout.block_samples(block)?.samples;
        let full = lattice_extent(&block_samples, logic_box) == lattice_extent(&block_samples, region);
        plan.push((BlockKey::new(field_index, timestep, block), block_samples, full));
    }
    // nothing is stored unless every partial block can be merged
    if !session.is_exclusive() {
        if let Some((key, _, _)) = plan.iter().find(|(_, _, full)| !full) {
            return Err(IdxError::WriteError(format!(
                "{} is partially covered by {} and the session does not hold the dataset lock",
                key, region
            )));
        }
    }

    let mut summary = WriteSummary::default();
    let mut blocks = Vec::with_capacity(plan.len());
    for (key, block_samples, full) in plan {
        let mut data = if full {
            summary.blocks_written += 1;
            filled_buffer(field.dtype, block_samples.num_samples(), field.default_value)
        } else {
            summary.blocks_merged += 1;
            match session.fetch(&key).await? {
                Some(existing) => existing.to_vec(),
                None => filled_buffer(field.dtype, block_samples.num_samples(), field.default_value),
            }
        };
        copy_samples(&block_samples, &mut data, &source, buffer, sample_size);
        blocks.push((key, Bytes::from(data)));
    }
    session.store_blocks(&blocks, None).await?;

    debug!(
        field = %field.name,
        region = %region,
        written = summary.blocks_written,
        merged = summary.blocks_merged,
        "wrote box"
    );
    Ok(summary)
}

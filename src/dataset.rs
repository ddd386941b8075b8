//! Dataset handle - main API for creating, reading, writing and
//! recompressing datasets

use crate::access::{AccessMode, AccessSession};
use crate::blockstore::{BlockKey, BlockStore};
use crate::compression::{CodecRegistry, CodecSpec};
use crate::config::AccessConfig;
use crate::descriptor::{Descriptor, StorageLayout, DESCRIPTOR_FILE};
use crate::error::{IdxError, Result};
use crate::geometry::{LogicBox, LogicSamples};
use crate::io::{create_io_manager, IOManager};
use crate::layout::HzLayout;
use crate::query::{write_box, BoxQuery, PointQuery, QueryOptions, WriteSummary};
use crate::types::{bytes_to_samples, DType, Sample};
use bytes::Bytes;
use ndarray::{ArrayD, IxDyn};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Parameters of a one-shot read
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Field name; the first field when unset
    pub field: Option<String>,
    pub timestep: u32,
    /// Box to read; the whole dataset when unset
    pub region: Option<LogicBox>,
    /// Upper bound on the number of output samples
    pub max_samples: Option<u64>,
    /// Resolution to read; the finest affordable one when unset
    pub resolution: Option<usize>,
    pub abort: Option<CancellationToken>,
}

impl ReadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_timestep(mut self, timestep: u32) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn with_region(mut self, region: LogicBox) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_max_samples(mut self, max_samples: u64) -> Self {
        self.max_samples = Some(max_samples);
        self
    }

    pub fn with_resolution(mut self, resolution: usize) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_abort(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }
}

/// Samples produced by [`Dataset::read`]
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Row-major, axis 0 fastest, little-endian
    pub buffer: Bytes,
    pub samples: LogicSamples,
    pub level: usize,
    pub dims: Vec<usize>,
    pub dtype: DType,
}

/// Outcome of recompressing one field
#[derive(Debug, Clone, Serialize)]
pub struct CompressionReport {
    pub field: String,
    pub codec: CodecSpec,
    pub blocks: usize,
    pub stored_bytes_before: u64,
    pub stored_bytes_after: u64,
}

impl CompressionReport {
    pub fn ratio(&self) -> f64 {
        if self.stored_bytes_after == 0 {
            0.0
        } else {
            self.stored_bytes_before as f64 / self.stored_bytes_after as f64
        }
    }
}

struct DatasetInner {
    url: String,
    io: Arc<dyn IOManager>,
    descriptor: Arc<RwLock<Descriptor>>,
    layout: Arc<HzLayout>,
    store: Arc<BlockStore>,
    config: AccessConfig,
}

/// Handle to an open dataset. Clones share the descriptor, the codec
/// registry and the storage backend.
#[derive(Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

impl Dataset {
    /// Create a new dataset at `url`. Fails with [`IdxError::AlreadyExists`]
    /// when a descriptor is already present.
    pub async fn create(url: impl Into<String>, descriptor: Descriptor, config: AccessConfig) -> Result<Self> {
        let url = url.into();
        let io = create_io_manager(&url)?;
        Self::create_with_io(url, io, descriptor, config).await
    }

    /// Create a new dataset on a caller-supplied backend
    pub async fn create_with_io(
        url: impl Into<String>,
        io: Arc<dyn IOManager>,
        descriptor: Descriptor,
        config: AccessConfig,
    ) -> Result<Self> {
        let url = url.into();
        config.validate()?;
        let descriptor = config.apply(descriptor);
        descriptor.validate()?;

        if io.exists(DESCRIPTOR_FILE).await? {
            return Err(IdxError::AlreadyExists(format!("{} at {}", DESCRIPTOR_FILE, url)));
        }
        io.write(DESCRIPTOR_FILE, &descriptor.serialize()?).await?;

        info!(%url, descriptor = %descriptor.summary(), "created dataset");
        Self::build(url, io, descriptor, config, CodecRegistry::with_defaults())
    }

    /// Open an existing dataset
    pub async fn open(url: impl Into<String>, config: AccessConfig) -> Result<Self> {
        let url = url.into();
        let io = create_io_manager(&url)?;
        Self::open_with_io(url, io, config).await
    }

    /// Open an existing dataset on a caller-supplied backend
    pub async fn open_with_io(url: impl Into<String>, io: Arc<dyn IOManager>, config: AccessConfig) -> Result<Self> {
        let url = url.into();
        config.validate()?;
        let bytes = io.read(DESCRIPTOR_FILE).await.map_err(|e| {
            if e.is_not_found() {
                IdxError::NotFound(format!("no dataset at {}", url))
            } else {
                e
            }
        })?;
        let descriptor = Descriptor::parse(&bytes)?;

        info!(%url, descriptor = %descriptor.summary(), "opened dataset");
        Self::build(url, io, descriptor, config, CodecRegistry::with_defaults())
    }

    fn build(
        url: String,
        io: Arc<dyn IOManager>,
        descriptor: Descriptor,
        config: AccessConfig,
        registry: CodecRegistry,
    ) -> Result<Self> {
        let layout = Arc::new(descriptor.layout()?);
        let descriptor = Arc::new(RwLock::new(descriptor));
        let store = Arc::new(BlockStore::new(io.clone(), descriptor.clone(), Arc::new(registry)));
        Ok(Self {
            inner: Arc::new(DatasetInner {
                url,
                io,
                descriptor,
                layout,
                store,
                config,
            }),
        })
    }

    /// Handle using `registry` for encoding and decoding blocks
    pub fn with_codec_registry(self, registry: CodecRegistry) -> Result<Self> {
        let inner = &self.inner;
        let descriptor = inner.descriptor.read().clone();
        Self::build(inner.url.clone(), inner.io.clone(), descriptor, inner.config.clone(), registry)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Snapshot of the descriptor
    pub fn descriptor(&self) -> Descriptor {
        self.inner.descriptor.read().clone()
    }

    pub fn layout(&self) -> Arc<HzLayout> {
        self.inner.layout.clone()
    }

    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.inner.io
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        self.inner.store.registry()
    }

    /// Open an access session
    pub async fn access(&self, mode: AccessMode) -> Result<AccessSession> {
        AccessSession::open(self.inner.store.clone(), mode, &self.inner.config).await
    }

    fn resolve_field(&self, field: Option<&str>) -> Result<(usize, crate::descriptor::Field)> {
        let d = self.inner.descriptor.read();
        let index = match field {
            Some(name) => d.field_index(name)?,
            None => 0,
        };
        Ok((index, d.fields[index].clone()))
    }

    fn check_timestep(&self, timestep: u32) -> Result<()> {
        let timesteps = self.inner.descriptor.read().timesteps;
        if timestep >= timesteps {
            return Err(IdxError::OutOfBounds(format!(
                "timestep {} (dataset has {})",
                timestep, timesteps
            )));
        }
        Ok(())
    }

    /// Build a progressive query over `region` of a field
    pub fn create_box_query(
        &self,
        field: Option<&str>,
        timestep: u32,
        region: LogicBox,
        options: QueryOptions,
    ) -> Result<BoxQuery> {
        let (_, field) = self.resolve_field(field)?;
        Ok(BoxQuery::new(
            self.descriptor(),
            self.layout(),
            field.name,
            timestep,
            region,
            options,
        ))
    }

    /// Build a query sampling a field at individual points
    pub fn create_point_query(
        &self,
        field: Option<&str>,
        timestep: u32,
        points: Vec<Vec<i64>>,
    ) -> Result<PointQuery> {
        let (_, field) = self.resolve_field(field)?;
        Ok(PointQuery::new(self.descriptor(), self.layout(), field.name, timestep, points))
    }

    /// Read a box in one step with a short-lived session
    pub async fn read(&self, request: ReadRequest) -> Result<ReadResult> {
        let session = self.access(AccessMode::Read).await?;
        self.read_with(&session, request).await
    }

    /// Read a box in one step through an existing session
    pub async fn read_with(&self, session: &AccessSession, request: ReadRequest) -> Result<ReadResult> {
        let (_, field) = self.resolve_field(request.field.as_deref())?;
        let region = request
            .region
            .clone()
            .unwrap_or_else(|| self.inner.layout.logic_box().clone());

        let mut options = QueryOptions::default();
        if let Some(max_samples) = request.max_samples {
            options = options.with_max_samples(max_samples);
        }
        if let Some(resolution) = request.resolution {
            options = options.with_end_resolutions(vec![resolution]);
        }
        if let Some(abort) = request.abort {
            options = options.with_abort(abort);
        }

        let mut query = self.create_box_query(Some(&field.name), request.timestep, region, options)?;
        query.begin()?;
        let progress = query.execute(session).await?;
        query.end();

        Ok(ReadResult {
            buffer: Bytes::from(query.take_buffer()),
            samples: progress.samples,
            level: progress.level,
            dims: progress.dims,
            dtype: field.dtype,
        })
    }

    /// Read a box as an n-dimensional array.
    ///
    /// The array shape lists the slowest axis first (`[.., y, x]`), followed by
    /// a component axis for multi-component fields.
    pub async fn read_array<T: Sample>(&self, request: ReadRequest) -> Result<ArrayD<T>> {
        let result = self.read(request).await?;
        if result.dtype.scalar != T::DATA_TYPE {
            return Err(IdxError::InvalidGeometry(format!(
                "field holds {}, requested {}",
                result.dtype, T::DATA_TYPE
            )));
        }
        let values: Vec<T> = bytes_to_samples(&result.buffer)?;
        let mut shape: Vec<usize> = result.dims.iter().rev().copied().collect();
        if result.dtype.components > 1 {
            shape.push(result.dtype.components as usize);
        }
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| IdxError::InvalidGeometry(format!("array shape {:?}: {}", shape, e)))
    }

    /// Write a full-resolution buffer covering `region` with a short-lived
    /// write session
    pub async fn write(
        &self,
        region: &LogicBox,
        buffer: &[u8],
        field: Option<&str>,
        timestep: u32,
    ) -> Result<WriteSummary> {
        let mut session = self.access(AccessMode::Write).await?;
        let summary = self.write_with(&session, region, buffer, field, timestep).await;
        session.close()?;
        summary
    }

    /// Write a full-resolution buffer through an existing write session
    pub async fn write_with(
        &self,
        session: &AccessSession,
        region: &LogicBox,
        buffer: &[u8],
        field: Option<&str>,
        timestep: u32,
    ) -> Result<WriteSummary> {
        let (index, field) = self.resolve_field(field)?;
        self.check_timestep(timestep)?;
        write_box(session, &self.inner.layout, index, &field, timestep, region, buffer).await
    }

    /// Decoded block content, `None` when never written
    pub async fn read_block(&self, field: Option<&str>, timestep: u32, block: u64) -> Result<Option<Bytes>> {
        let (index, _) = self.resolve_field(field)?;
        match self.inner.store.read_block(&BlockKey::new(index, timestep, block)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Store a raw block, bypassing the lattice mapping
    pub async fn write_block(&self, field: Option<&str>, timestep: u32, block: u64, data: &[u8]) -> Result<()> {
        let (index, _) = self.resolve_field(field)?;
        let session = self.access(AccessMode::Write).await?;
        session.store(&BlockKey::new(index, timestep, block), data).await
    }

    /// Recompress every field
    pub async fn compress(&self, codec: CodecSpec) -> Result<Vec<CompressionReport>> {
        let names: Vec<String> = self
            .inner
            .descriptor
            .read()
            .fields
            .iter()
            .map(|f| f.name.clone())
            .collect();
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(self.compress_field(&name, codec).await?);
        }
        Ok(reports)
    }

    /// Rewrite every stored block of a field with `codec` and record the
    /// codec in the descriptor.
    pub async fn compress_field(&self, name: &str, codec: CodecSpec) -> Result<CompressionReport> {
        // unknown codecs fail before any block is touched
        self.registry().get(codec.name())?;
        let (index, _) = self.resolve_field(Some(name))?;
        let timesteps = self.inner.descriptor.read().timesteps;

        let mut session = self.access(AccessMode::Write).await?;
        if !session.is_exclusive() {
            warn!(field = name, "recompressing without the dataset lock");
        }

        let store = &self.inner.store;
        let mut report = CompressionReport {
            field: name.to_string(),
            codec,
            blocks: 0,
            stored_bytes_before: 0,
            stored_bytes_after: 0,
        };

        for timestep in 0..timesteps {
            let blocks = match store.stored_blocks(index, timestep).await {
                Ok(blocks) => blocks,
                Err(IdxError::Configuration(reason)) => {
                    warn!(field = name, timestep, %reason, "cannot list blocks, probing every block");
                    (0..store.total_blocks()).collect()
                }
                Err(e) => return Err(e),
            };

            // one batch per container
            let per_container = store.blocks_per_container();
            let mut start = 0;
            while start < blocks.len() {
                let container = blocks[start] / per_container;
                let end = blocks[start..]
                    .iter()
                    .position(|b| b / per_container != container)
                    .map_or(blocks.len(), |n| start + n);

                let mut batch = Vec::with_capacity(end - start);
                for &block in &blocks[start..end] {
                    let key = BlockKey::new(index, timestep, block);
                    if let Some(data) = session.fetch(&key).await? {
                        report.stored_bytes_before +=
                            BlockStore::inspect_record(&store.read_record(&key).await?)?.stored_len;
                        batch.push((key, data));
                    }
                }
                session.store_blocks(&batch, Some(&codec)).await?;
                for (key, _) in &batch {
                    report.stored_bytes_after += BlockStore::inspect_record(&store.read_record(key).await?)?.stored_len;
                }
                report.blocks += batch.len();
                start = end;
            }
        }

        // the handle changes only once dataset.json holds the update
        let mut updated = self.inner.descriptor.read().clone();
        updated.set_field_codec(name, codec)?;
        self.inner.io.write(DESCRIPTOR_FILE, &updated.serialize()?).await?;
        *self.inner.descriptor.write() = updated;
        session.close()?;

        info!(
            field = name,
            codec = %codec,
            blocks = report.blocks,
            before = report.stored_bytes_before,
            after = report.stored_bytes_after,
            "recompressed field"
        );
        Ok(report)
    }

    /// Get statistics about the dataset
    pub fn stats(&self) -> DatasetStats {
        let d = self.inner.descriptor.read();
        let layout = &self.inner.layout;
        let samples = d.logic_box.num_samples();
        DatasetStats {
            dimensionality: layout.pdim(),
            logic_box: d.logic_box.clone(),
            bitmask: d.bitmask.clone(),
            max_resolution: layout.max_resolution(),
            total_samples: samples,
            total_blocks: layout.total_blocks(),
            samples_per_block: layout.samples_per_block(),
            fields: d.fields.iter().map(|f| (f.name.clone(), f.dtype, f.codec)).collect(),
            timesteps: d.timesteps,
            storage: d.storage,
            uncompressed_size: d.fields.iter().map(|f| f.dtype.byte_size(samples) as u64).sum::<u64>()
                * d.timesteps as u64,
        }
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("url", &self.inner.url)
            .field("backend", &self.inner.io.backend())
            .field("descriptor", &self.inner.descriptor.read().summary())
            .finish()
    }
}

/// Dataset statistics
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub dimensionality: usize,
    pub logic_box: LogicBox,
    pub bitmask: String,
    pub max_resolution: usize,
    pub total_samples: u64,
    pub total_blocks: u64,
    pub samples_per_block: u64,
    pub fields: Vec<(String, DType, CodecSpec)>,
    pub timesteps: u32,
    pub storage: StorageLayout,
    pub uncompressed_size: u64,
}

impl DatasetStats {
    pub fn summary(&self) -> String {
        format!(
            "{}D dataset {}: {} samples, {} blocks of {}, {} field(s), {} timestep(s), {} uncompressed",
            self.dimensionality,
            self.logic_box,
            self.total_samples,
            self.total_blocks,
            self.samples_per_block,
            self.fields.len(),
            self.timesteps,
            crate::utils::format_bytes(self.uncompressed_size),
        )
    }
}

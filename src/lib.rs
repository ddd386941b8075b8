//! idxstore - multiresolution block-addressed array storage
//!
//! Stores large N-dimensional arrays so that any box can be read back
//! progressively, coarse to fine, without touching the rest of the dataset.
//!
//! # Features
//!
//! - 1 to 5 dimensional arrays with multiple typed fields and timesteps
//! - HZ-order block addressing: coarse levels live in few blocks, each finer
//!   level only adds the samples it introduces
//! - Progressive box queries with sample budgets, refinement and abort
//! - Per-field codecs: raw, lz4, zip, zstd and a bounded-error quantizer
//! - Filesystem and in-memory backends (HTTP behind the `http-client` feature);
//!   implement [`IOManager`] for other stores
//! - Exclusive write sessions guarded by a lock object
//!
//! # Example
//!
//! ```rust,ignore
//! use idxstore::{AccessConfig, Dataset, Descriptor, Field, LogicBox, ReadRequest};
//! use idxstore::types::{DType, DataType};
//!
//! # async fn example() -> idxstore::Result<()> {
//! let descriptor = Descriptor::create(
//!     LogicBox::from_dims(&[256, 256, 256])?,
//!     vec![Field::new("density", DType::scalar(DataType::U8))],
//!     &[64, 64, 64],
//! )?;
//! let dataset = Dataset::create("file:///data/volume", descriptor, AccessConfig::from_env()).await?;
//!
//! // coarse preview of the whole volume
//! let preview = dataset.read(ReadRequest::new().with_max_samples(4096)).await?;
//! println!("level {} dims {:?}", preview.level, preview.dims);
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod bitmask;
pub mod blockstore;
pub mod cache;
pub mod compression;
pub mod config;
pub mod dataset;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod io;
pub mod layout;
pub mod query;
pub mod types;
pub mod utils;

// Re-exports
pub use access::{AccessMode, AccessSession};
pub use bitmask::{Bitmask, HzOrder};
pub use blockstore::{BlockKey, BlockStore};
pub use cache::CacheStats;
pub use compression::{CodecRegistry, CodecSpec, Compressor, QuantizeMode};
pub use config::{AccessConfig, AccessGranularity};
pub use dataset::{CompressionReport, Dataset, DatasetStats, ReadRequest, ReadResult};
pub use descriptor::{Descriptor, Field, FormatVersion, StorageLayout};
pub use error::{IdxError, Result};
pub use geometry::{LogicBox, LogicSamples};
pub use io::{IOManager, StorageBackend};
pub use layout::{BlockSamples, HzLayout};
pub use query::{BoxQuery, PointProgress, PointQuery, QueryOptions, QueryProgress, QueryState, WriteSummary};
pub use types::{DType, DataType, Sample};

/// Version of the idxstore implementation
pub const IDXSTORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!IDXSTORE_VERSION.is_empty());
        assert_eq!(FormatVersion::CURRENT.major, 1);
    }
}

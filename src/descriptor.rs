//! Dataset descriptor: geometry, fields and storage layout, persisted as
//! `dataset.json` at the dataset root

use crate::bitmask::Bitmask;
use crate::compression::CodecSpec;
use crate::error::{IdxError, Result};
use crate::geometry::LogicBox;
use crate::layout::HzLayout;
use crate::types::DType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Object name of the descriptor inside a dataset
pub const DESCRIPTOR_FILE: &str = "dataset.json";

/// Samples per block when no block dims are given
pub const DEFAULT_BITS_PER_BLOCK: usize = 16;

/// Uncompressed size a container file is sized for when guessing
/// blocks per file
pub const TARGET_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// Descriptor format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// How blocks map to storage objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageLayout {
    /// One object per block
    PerBlock,
    /// Container files of `blocks_per_file` consecutive blocks
    Packed { blocks_per_file: u64 },
}

/// A named array stored in the dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub dtype: DType,
    /// Codec applied to newly written blocks
    pub codec: CodecSpec,
    /// Value reported for samples that were never written
    #[serde(default)]
    pub default_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            codec: CodecSpec::Raw,
            default_value: 0.0,
            description: None,
        }
    }

    pub fn with_codec(mut self, codec: CodecSpec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_default_value(mut self, value: f64) -> Self {
        self.default_value = value;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: FormatVersion,
}

/// Complete description of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Format version
    pub version: FormatVersion,

    /// Extent of the stored array
    pub logic_box: LogicBox,

    /// Axis refinement order
    pub bitmask: String,

    /// log2 of the number of samples per block
    pub bits_per_block: usize,

    /// Block dims requested at creation
    pub block_dims: Vec<i64>,

    /// Mapping of blocks to storage objects
    pub storage: StorageLayout,

    pub fields: Vec<Field>,

    /// Number of timesteps, numbered from 0
    pub timesteps: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// Free-form key/value pairs
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe a new dataset. `block_dims` are the per-axis power-of-two
    /// block extents; an empty slice selects 2^16 samples per block.
    pub fn create(logic_box: LogicBox, fields: Vec<Field>, block_dims: &[i64]) -> Result<Self> {
        if logic_box.is_empty() {
            return Err(IdxError::InvalidGeometry(format!(
                "logic box {} is empty",
                logic_box
            )));
        }
        if logic_box.lo.iter().any(|&v| v < 0) {
            return Err(IdxError::InvalidGeometry(format!(
                "logic box {} has negative coordinates",
                logic_box
            )));
        }
        Self::check_fields(&fields)?;

        let bitmask = Bitmask::guess(&logic_box.hi, true)?;
        let maxh = bitmask.max_resolution();

        let requested_bits: usize = if block_dims.is_empty() {
            DEFAULT_BITS_PER_BLOCK
        } else {
            Self::check_block_dims(&logic_box, block_dims)?;
            block_dims
                .iter()
                .map(|&d| (d as u64).trailing_zeros() as usize)
                .sum()
        };
        let bits_per_block = requested_bits.min(maxh);

        let now = Utc::now();
        let mut ret = Self {
            version: FormatVersion::CURRENT,
            logic_box,
            bitmask: bitmask.pattern().to_string(),
            bits_per_block,
            block_dims: block_dims.to_vec(),
            storage: StorageLayout::PerBlock,
            fields,
            timesteps: 1,
            created_at: now,
            modified_at: now,
            custom_metadata: BTreeMap::new(),
        };
        ret.storage = StorageLayout::Packed {
            blocks_per_file: ret.guess_blocks_per_file(),
        };
        Ok(ret)
    }

    fn check_fields(fields: &[Field]) -> Result<()> {
        if fields.is_empty() {
            return Err(IdxError::InvalidGeometry(
                "a dataset needs at least one field".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for field in fields {
            // names become path segments of the block objects
            let name = field.name.as_str();
            if name.trim().is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(IdxError::InvalidGeometry(format!(
                    "invalid field name '{}'",
                    name
                )));
            }
            if !names.insert(field.name.as_str()) {
                return Err(IdxError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    fn check_block_dims(logic_box: &LogicBox, block_dims: &[i64]) -> Result<()> {
        if block_dims.len() != logic_box.dim() {
            return Err(IdxError::InvalidGeometry(format!(
                "block dims {:?} do not match a {}D box",
                block_dims,
                logic_box.dim()
            )));
        }
        if block_dims.iter().any(|&d| d < 1 || !(d as u64).is_power_of_two()) {
            return Err(IdxError::InvalidGeometry(format!(
                "block dims {:?} must be powers of two",
                block_dims
            )));
        }
        Ok(())
    }

    /// Replace the guessed bitmask
    pub fn with_bitmask(mut self, pattern: &str) -> Result<Self> {
        let bitmask = Bitmask::parse_with_dim(pattern, self.logic_box.dim())?;
        self.bits_per_block = self.bits_per_block.min(bitmask.max_resolution());
        self.bitmask = bitmask.pattern().to_string();
        // fails when the pattern does not cover the box
        self.layout()?;
        if let StorageLayout::Packed { blocks_per_file } = self.storage {
            self.storage = StorageLayout::Packed {
                blocks_per_file: blocks_per_file.min(self.total_blocks()),
            };
        }
        Ok(self)
    }

    pub fn with_timesteps(mut self, timesteps: u32) -> Self {
        self.timesteps = timesteps.max(1);
        self
    }

    /// Choose the storage layout; `blocks_per_file` is clamped to the block count
    pub fn with_storage(mut self, storage: StorageLayout) -> Self {
        self.storage = match storage {
            StorageLayout::PerBlock => StorageLayout::PerBlock,
            StorageLayout::Packed { blocks_per_file } => StorageLayout::Packed {
                blocks_per_file: blocks_per_file.clamp(1, self.total_blocks()),
            },
        };
        self
    }

    /// Every block of a field and timestep in one file
    pub fn with_monolithic_storage(self) -> Self {
        let total = self.total_blocks();
        self.with_storage(StorageLayout::Packed {
            blocks_per_file: total,
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }

    /// Parse a serialized descriptor and validate it
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if !probe.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(IdxError::UnsupportedVersion(probe.version.major));
        }
        let ret: Descriptor = serde_json::from_slice(bytes)?;
        ret.validate()?;
        Ok(ret)
    }

    /// Pretty JSON with a fixed key order
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.logic_box.is_empty() {
            return Err(IdxError::InvalidGeometry(format!(
                "logic box {} is empty",
                self.logic_box
            )));
        }
        Self::check_fields(&self.fields)?;
        if !self.block_dims.is_empty() {
            Self::check_block_dims(&self.logic_box, &self.block_dims)?;
        }
        let layout = self.layout()?;
        if self.bits_per_block > layout.max_resolution() {
            return Err(IdxError::InvalidGeometry(format!(
                "bits per block {} exceeds max resolution {}",
                self.bits_per_block,
                layout.max_resolution()
            )));
        }
        if let StorageLayout::Packed { blocks_per_file } = self.storage {
            if blocks_per_file == 0 {
                return Err(IdxError::InvalidGeometry(
                    "blocks per file must be positive".to_string(),
                ));
            }
            if blocks_per_file > self.total_blocks() {
                return Err(IdxError::InvalidGeometry(format!(
                    "{} blocks per file but the dataset has {} blocks",
                    blocks_per_file,
                    self.total_blocks()
                )));
            }
        }
        if self.timesteps == 0 {
            return Err(IdxError::InvalidGeometry("dataset has no timesteps".to_string()));
        }
        Ok(())
    }

    pub fn bitmask(&self) -> Result<Bitmask> {
        Bitmask::parse_with_dim(&self.bitmask, self.logic_box.dim())
    }

    pub fn layout(&self) -> Result<HzLayout> {
        HzLayout::new(self.bitmask()?, self.bits_per_block, self.logic_box.clone())
    }

    pub fn max_resolution(&self) -> usize {
        self.bitmask().map(|b| b.max_resolution()).unwrap_or(0)
    }

    pub fn total_blocks(&self) -> u64 {
        1u64 << self.max_resolution().saturating_sub(self.bits_per_block)
    }

    /// Blocks per container sized for [`TARGET_FILE_SIZE`] of the widest field
    pub fn guess_blocks_per_file(&self) -> u64 {
        let samples = 1u64 << self.bits_per_block;
        let widest = self
            .fields
            .iter()
            .map(|f| f.dtype.sample_size() as u64)
            .max()
            .unwrap_or(1);
        (TARGET_FILE_SIZE / (samples * widest).max(1)).clamp(1, self.total_blocks())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| IdxError::NotFound(format!("field '{}'", name)))
    }

    pub fn default_field(&self) -> &Field {
        &self.fields[0]
    }

    /// Change the codec new blocks of a field are written with
    pub fn set_field_codec(&mut self, name: &str, codec: CodecSpec) -> Result<()> {
        let index = self.field_index(name)?;
        self.fields[index].codec = codec;
        self.touch();
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn summary(&self) -> String {
        let fields = self
            .fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.dtype))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "box {} bitmask {} ({} blocks of 2^{}), fields [{}], {} timestep(s)",
            self.logic_box,
            self.bitmask,
            self.total_blocks(),
            self.bits_per_block,
            fields,
            self.timesteps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn cube(n: i64) -> LogicBox {
        LogicBox::from_dims(&[n, n, n]).unwrap()
    }

    fn u8_field(name: &str) -> Field {
        Field::new(name, DType::scalar(DataType::U8))
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = FormatVersion::new(1, 0);
        let v1_3 = FormatVersion::new(1, 3);
        let v2_0 = FormatVersion::new(2, 0);

        assert!(v1_0.is_compatible(&v1_3));
        assert!(!v1_0.is_compatible(&v2_0));
    }

    #[test]
    fn test_create_derives_geometry() {
        let d = Descriptor::create(cube(256), vec![u8_field("data")], &[64, 64, 64]).unwrap();
        assert_eq!(d.bitmask, format!("V{}", "012".repeat(8)));
        assert_eq!(d.bits_per_block, 18);
        assert_eq!(d.total_blocks(), 64);
        assert_eq!(d.timesteps, 1);
        // 32 MiB of 256 KiB blocks, capped by the block count
        assert_eq!(d.storage, StorageLayout::Packed { blocks_per_file: 64 });
    }

    #[test]
    fn test_create_validation() {
        match Descriptor::create(LogicBox::from_dims(&[0, 4]).unwrap(), vec![u8_field("a")], &[]) {
            Err(IdxError::InvalidGeometry(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match Descriptor::create(cube(8), vec![u8_field("a"), u8_field("a")], &[]) {
            Err(IdxError::DuplicateField(name)) => assert_eq!(name, "a"),
            other => panic!("unexpected {:?}", other),
        }
        match Descriptor::create(cube(8), vec![u8_field("a")], &[3, 4, 4]) {
            Err(IdxError::InvalidGeometry(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(Descriptor::create(cube(8), vec![], &[]).is_err());
    }

    #[test]
    fn test_bits_per_block_clamped() {
        let d = Descriptor::create(cube(4), vec![u8_field("a")], &[64, 64, 64]).unwrap();
        assert_eq!(d.bits_per_block, 6);
        assert_eq!(d.total_blocks(), 1);
    }

    #[test]
    fn test_serialize_round_trip() {
        let d = Descriptor::create(
            cube(32),
            vec![
                u8_field("a").with_codec(CodecSpec::zip()),
                Field::new("b", "float32[3]".parse().unwrap())
                    .with_default_value(-1.5)
                    .with_description("velocity"),
            ],
            &[8, 8, 8],
        )
        .unwrap()
        .with_timesteps(4)
        .with_metadata("source", "unit-test")
        .with_metadata("author", "someone");

        let bytes = d.serialize().unwrap();
        let parsed = Descriptor::parse(&bytes).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(parsed.serialize().unwrap(), bytes);
        assert_eq!(parsed.get_metadata("source"), Some("unit-test"));
    }

    #[test]
    fn test_parse_rejects_bad_documents() {
        assert!(matches!(
            Descriptor::parse(b"{not json"),
            Err(IdxError::ParseError(_))
        ));

        let d = Descriptor::create(cube(8), vec![u8_field("a")], &[]).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&d.serialize().unwrap()).unwrap();
        value["version"]["major"] = serde_json::json!(9);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Descriptor::parse(&bytes),
            Err(IdxError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_parse_rejects_oversized_containers() {
        let d = Descriptor::create(cube(8), vec![u8_field("a")], &[2, 2, 2])
            .unwrap()
            .with_storage(StorageLayout::Packed { blocks_per_file: 4 });
        let mut value: serde_json::Value = serde_json::from_slice(&d.serialize().unwrap()).unwrap();
        value["storage"]["blocks_per_file"] = serde_json::json!(u64::MAX / 2);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(matches!(
            Descriptor::parse(&bytes),
            Err(IdxError::InvalidGeometry(_))
        ));

        value["storage"]["blocks_per_file"] = serde_json::json!(d.total_blocks());
        assert!(Descriptor::parse(&serde_json::to_vec(&value).unwrap()).is_ok());
    }

    #[test]
    fn test_explicit_bitmask() {
        let d = Descriptor::create(LogicBox::from_dims(&[4, 16]).unwrap(), vec![u8_field("a")], &[])
            .unwrap()
            .with_bitmask("V010111")
            .unwrap();
        assert_eq!(d.bitmask().unwrap().pattern(), "V010111");
        let short = Descriptor::create(LogicBox::from_dims(&[4, 16]).unwrap(), vec![u8_field("a")], &[])
            .unwrap()
            .with_bitmask("V0101");
        assert!(short.is_err());
    }

    #[test]
    fn test_set_field_codec() {
        let mut d = Descriptor::create(cube(8), vec![u8_field("a")], &[]).unwrap();
        let before = d.modified_at;
        d.set_field_codec("a", CodecSpec::Lz4).unwrap();
        assert_eq!(d.field("a").unwrap().codec, CodecSpec::Lz4);
        assert!(d.modified_at >= before);
        assert!(d.set_field_codec("missing", CodecSpec::Lz4).is_err());
    }

    #[test]
    fn test_storage_clamped() {
        let d = Descriptor::create(cube(64), vec![u8_field("a")], &[8, 8, 8])
            .unwrap()
            .with_storage(StorageLayout::Packed { blocks_per_file: 1 << 20 });
        assert_eq!(d.storage, StorageLayout::Packed { blocks_per_file: 512 });
        let mono = d.clone().with_monolithic_storage();
        assert_eq!(mono.storage, StorageLayout::Packed { blocks_per_file: 512 });
        let per_block = d.with_storage(StorageLayout::PerBlock);
        assert_eq!(per_block.storage, StorageLayout::PerBlock);
    }
}

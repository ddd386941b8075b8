//! Configuration for dataset access.

use crate::descriptor::{Descriptor, StorageLayout};
use crate::error::{IdxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Environment variable disabling the dataset write lock
pub const ENV_DISABLE_WRITE_LOCK: &str = "IDX_DISABLE_WRITE_LOCK";

/// Environment variable choosing the storage layout of new datasets
pub const ENV_ACCESS_GRANULARITY: &str = "IDX_ACCESS_GRANULARITY";

/// Environment variable with the per-session cache budget in megabytes
pub const ENV_CACHE_SIZE_MB: &str = "IDX_CACHE_SIZE_MB";

/// How blocks of a new dataset are grouped into storage objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccessGranularity {
    /// One object per block
    PerBlock,
    /// One container per field and timestep
    Monolithic,
    /// Containers of this many blocks
    Packed(u64),
}

impl AccessGranularity {
    /// Storage layout for a dataset with `total_blocks` blocks
    pub fn storage_layout(&self, total_blocks: u64) -> StorageLayout {
        match self {
            AccessGranularity::PerBlock => StorageLayout::PerBlock,
            AccessGranularity::Monolithic => StorageLayout::Packed {
                blocks_per_file: total_blocks,
            },
            AccessGranularity::Packed(n) => StorageLayout::Packed {
                blocks_per_file: *n,
            },
        }
    }
}

impl FromStr for AccessGranularity {
    type Err = IdxError;

    /// Parse from string (case-insensitive).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "per-block" | "block" => Ok(Self::PerBlock),
            "monolithic" | "single" => Ok(Self::Monolithic),
            other => {
                let n = other
                    .strip_prefix("packed:")
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(|| {
                        IdxError::Configuration(format!("unknown access granularity '{}'", s))
                    })?;
                Ok(Self::Packed(n))
            }
        }
    }
}

impl fmt::Display for AccessGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerBlock => f.write_str("per-block"),
            Self::Monolithic => f.write_str("monolithic"),
            Self::Packed(n) => write!(f, "packed:{}", n),
        }
    }
}

impl TryFrom<String> for AccessGranularity {
    type Error = IdxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AccessGranularity> for String {
    fn from(value: AccessGranularity) -> Self {
        value.to_string()
    }
}

/// Configuration for opening and creating datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Skip the exclusive lock object when opening for writing.
    pub disable_write_lock: bool,

    /// Storage layout override for newly created datasets.
    pub granularity: Option<AccessGranularity>,

    /// Memory budget for each session's block cache in megabytes.
    /// Zero disables caching.
    pub cache_size_mb: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            disable_write_lock: false,
            granularity: None,
            cache_size_mb: 64,
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl AccessConfig {
    /// Load configuration from environment variables. Unparsable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var(ENV_DISABLE_WRITE_LOCK) {
            match parse_bool(&val) {
                Some(flag) => config.disable_write_lock = flag,
                None => warn!(var = ENV_DISABLE_WRITE_LOCK, value = %val, "ignoring invalid value"),
            }
        }

        if let Ok(val) = std::env::var(ENV_ACCESS_GRANULARITY) {
            match val.parse() {
                Ok(g) => config.granularity = Some(g),
                Err(_) => warn!(var = ENV_ACCESS_GRANULARITY, value = %val, "ignoring invalid value"),
            }
        }

        if let Ok(val) = std::env::var(ENV_CACHE_SIZE_MB) {
            match val.trim().parse() {
                Ok(size) => config.cache_size_mb = size,
                Err(_) => warn!(var = ENV_CACHE_SIZE_MB, value = %val, "ignoring invalid value"),
            }
        }

        config
    }

    pub fn with_disable_write_lock(mut self, disable: bool) -> Self {
        self.disable_write_lock = disable;
        self
    }

    pub fn with_granularity(mut self, granularity: AccessGranularity) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn with_cache_size_mb(mut self, size: usize) -> Self {
        self.cache_size_mb = size;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Some(AccessGranularity::Packed(0)) = self.granularity {
            return Err(IdxError::Configuration(
                "packed granularity needs at least one block per file".to_string(),
            ));
        }
        if self.cache_size_mb > 1 << 20 {
            return Err(IdxError::Configuration(format!(
                "cache size of {} MB is not plausible",
                self.cache_size_mb
            )));
        }
        Ok(())
    }

    /// Get the block cache size in bytes.
    pub fn cache_size_bytes(&self) -> usize {
        self.cache_size_mb * 1024 * 1024
    }

    /// Apply the storage layout override to a new descriptor
    pub fn apply(&self, descriptor: Descriptor) -> Descriptor {
        match self.granularity {
            Some(g) => {
                let layout = g.storage_layout(descriptor.total_blocks());
                descriptor.with_storage(layout)
            }
            None => descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AccessConfig::default();
        assert!(!config.disable_write_lock);
        assert_eq!(config.granularity, None);
        assert_eq!(config.cache_size_bytes(), 64 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("per-block".parse::<AccessGranularity>().unwrap(), AccessGranularity::PerBlock);
        assert_eq!("Monolithic".parse::<AccessGranularity>().unwrap(), AccessGranularity::Monolithic);
        assert_eq!("packed:8".parse::<AccessGranularity>().unwrap(), AccessGranularity::Packed(8));
        assert!("packed:x".parse::<AccessGranularity>().is_err());
        assert!("bricks".parse::<AccessGranularity>().is_err());
        assert_eq!(AccessGranularity::Packed(8).to_string(), "packed:8");
    }

    #[test]
    fn test_validate() {
        let bad = AccessConfig::default().with_granularity(AccessGranularity::Packed(0));
        assert!(matches!(bad.validate(), Err(IdxError::Configuration(_))));
        assert!(AccessConfig::default().with_cache_size_mb(0).validate().is_ok());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var(ENV_DISABLE_WRITE_LOCK, "1");
        std::env::set_var(ENV_ACCESS_GRANULARITY, "packed:4");
        std::env::set_var(ENV_CACHE_SIZE_MB, "not-a-number");
        let config = AccessConfig::from_env();
        std::env::remove_var(ENV_DISABLE_WRITE_LOCK);
        std::env::remove_var(ENV_ACCESS_GRANULARITY);
        std::env::remove_var(ENV_CACHE_SIZE_MB);

        assert!(config.disable_write_lock);
        assert_eq!(config.granularity, Some(AccessGranularity::Packed(4)));
        assert_eq!(config.cache_size_mb, 64);
    }
}

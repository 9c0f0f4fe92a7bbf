//! Store configuration.
//!
//! Settings come from a builder, a TOML file, or both, with
//! `HYBRIDKV__SECTION__FIELD` environment variables taking final precedence.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::utility::is_power_of_two;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
    #[error("invalid environment override {var}: {reason}")]
    InvalidEnv { var: String, reason: String },
    #[error("page memory allocation failed")]
    AllocationFailed,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Hash index settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Number of hash buckets. Must be a power of two.
    pub table_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig { table_size: 1 << 16 }
    }
}

/// Hybrid-log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// log2 of the in-memory page size. At most 25 (the address offset
    /// width).
    pub page_size_bits: u32,
    /// log2 of the total in-memory log budget. The frame ring holds
    /// `2^(memory_size_bits - page_size_bits)` pages.
    pub memory_size_bits: u32,
    /// Fraction of in-memory pages kept mutable; the rest are sealed
    /// read-only as the tail advances.
    pub mutable_fraction: f64,
    /// log2 of the backing-device segment size (file devices).
    pub segment_size_bits: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            page_size_bits: 16,
            memory_size_bits: 22,
            mutable_fraction: 0.5,
            segment_size_bits: 30,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(6..=25).contains(&self.page_size_bits) {
            return Err(invalid("log.page_size_bits", "must be between 6 and 25"));
        }
        if self.memory_size_bits <= self.page_size_bits {
            return Err(invalid(
                "log.memory_size_bits",
                "must exceed page_size_bits (need at least two pages)",
            ));
        }
        if self.memory_size_bits - self.page_size_bits > 20 {
            return Err(invalid(
                "log.memory_size_bits",
                "frame ring larger than 2^20 pages",
            ));
        }
        if self.segment_size_bits < self.page_size_bits {
            return Err(invalid(
                "log.segment_size_bits",
                "segment must be at least one page",
            ));
        }
        if !(self.mutable_fraction > 0.0 && self.mutable_fraction <= 1.0) {
            return Err(invalid(
                "log.mutable_fraction",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Read-cache settings. Absent means the cache is disabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadCacheConfig {
    /// log2 of the cache memory budget.
    pub memory_size_bits: u32,
}

impl Default for ReadCacheConfig {
    fn default() -> Self {
        ReadCacheConfig {
            memory_size_bits: 20,
        }
    }
}

/// Top-level store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub index: IndexConfig,
    pub log: LogConfig,
    pub read_cache: Option<ReadCacheConfig>,
}

impl StoreConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: StoreConfig = toml::from_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HYBRIDKV__SECTION__FIELD` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (var, value) in std::env::vars() {
            let Some(rest) = var.strip_prefix("HYBRIDKV__") else {
                continue;
            };
            let parse_u64 = |field: &str| -> Result<u64, ConfigError> {
                value.parse::<u64>().map_err(|e| ConfigError::InvalidEnv {
                    var: format!("HYBRIDKV__{field}"),
                    reason: e.to_string(),
                })
            };
            match rest {
                "INDEX__TABLE_SIZE" => self.index.table_size = parse_u64(rest)?,
                "LOG__PAGE_SIZE_BITS" => self.log.page_size_bits = parse_u64(rest)? as u32,
                "LOG__MEMORY_SIZE_BITS" => self.log.memory_size_bits = parse_u64(rest)? as u32,
                "LOG__SEGMENT_SIZE_BITS" => self.log.segment_size_bits = parse_u64(rest)? as u32,
                "LOG__MUTABLE_FRACTION" => {
                    self.log.mutable_fraction =
                        value.parse::<f64>().map_err(|e| ConfigError::InvalidEnv {
                            var,
                            reason: e.to_string(),
                        })?
                }
                "READ_CACHE__MEMORY_SIZE_BITS" => {
                    self.read_cache = Some(ReadCacheConfig {
                        memory_size_bits: parse_u64(rest)? as u32,
                    })
                }
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var,
                        reason: "unknown setting".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.table_size == 0 || !is_power_of_two(self.index.table_size) {
            return Err(invalid(
                "index.table_size",
                "must be a non-zero power of two",
            ));
        }
        self.log.validate()?;
        if let Some(cache) = &self.read_cache {
            if cache.memory_size_bits < 12 {
                return Err(invalid(
                    "read_cache.memory_size_bits",
                    "cache smaller than 4 KiB",
                ));
            }
        }
        Ok(())
    }

    // Builder-style setters, mainly for tests and embedders.

    pub fn with_table_size(mut self, table_size: u64) -> Self {
        self.index.table_size = table_size;
        self
    }

    pub fn with_page_size_bits(mut self, bits: u32) -> Self {
        self.log.page_size_bits = bits;
        self
    }

    pub fn with_memory_size_bits(mut self, bits: u32) -> Self {
        self.log.memory_size_bits = bits;
        self
    }

    pub fn with_mutable_fraction(mut self, fraction: f64) -> Self {
        self.log.mutable_fraction = fraction;
        self
    }

    pub fn with_read_cache(mut self, memory_size_bits: u32) -> Self {
        self.read_cache = Some(ReadCacheConfig { memory_size_bits });
        self
    }
}

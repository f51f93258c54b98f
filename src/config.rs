//! Centralized configuration and builder for the database handle.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - `Config::from_env()` lets a deployment override defaults without
//!   touching caller code.
//! - A small `ConfigBuilder` for callers that prefer fluent construction
//!   over field literals.

use std::fmt;

use crate::consts::FIRST_TABLE_MAX_COUNT;

/// Value compression applied to stored values. Fixed for a database at
/// create time; it cannot be changed on an existing file because the
/// codec id is persisted in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionType {
    Raw,
    Lz4,
}

impl CompressionType {
    pub fn id(self) -> u8 {
        match self {
            CompressionType::Raw => 0,
            CompressionType::Lz4 => 1,
        }
    }

    pub fn from_id(id: u8) -> crate::error::Result<Self> {
        match id {
            0 => Ok(CompressionType::Raw),
            1 => Ok(CompressionType::Lz4),
            other => Err(crate::error::Error::corrupted(format!(
                "unknown compression codec id {other}"
            ))),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::Raw => write!(f, "raw"),
            CompressionType::Lz4 => write!(f, "lz4"),
        }
    }
}

/// Top-level configuration for a database handle.
#[derive(Clone, Debug)]
pub struct Config {
    /// Value compression codec, fixed at create time.
    /// Env: KVDB_COMPRESSION ("raw" | "lz4", default "raw")
    pub compression: CompressionType,

    /// Whether commits and recovery call fsync(). Disabling trades
    /// durability for speed; format consistency is unaffected.
    /// Env: KVDB_FSYNC_ENABLED (default true; "0|false|off|no" => false)
    pub fsync_enabled: bool,

    /// Size in bytes of the write buffer used to coalesce newly
    /// appended blocks into a single pwrite. 0 disables buffering.
    /// Env: KVDB_WRITE_BUFFER_SIZE (default 0)
    pub write_buffer_size: usize,

    /// Bucket count of the first hash table, created with the database.
    /// Lowering this is useful in tests that want to exercise table
    /// growth without huge fixtures.
    pub first_table_max_count: u64,

    /// Operation count threshold after which an implicit transaction
    /// auto-commits.
    pub implicit_transaction_max_op: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression: CompressionType::Raw,
            fsync_enabled: true,
            write_buffer_size: 0,
            first_table_max_count: FIRST_TABLE_MAX_COUNT,
            implicit_transaction_max_op: crate::consts::IMPLICIT_TRANSACTION_MAX_OP,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// the programmatic default on anything malformed (never panics).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("KVDB_COMPRESSION") {
            match v.trim().to_ascii_lowercase().as_str() {
                "raw" => cfg.compression = CompressionType::Raw,
                "lz4" => cfg.compression = CompressionType::Lz4,
                _ => {}
            }
        }

        if let Ok(v) = std::env::var("KVDB_FSYNC_ENABLED") {
            let s = v.trim().to_ascii_lowercase();
            cfg.fsync_enabled = !(s == "0" || s == "false" || s == "off" || s == "no");
        }

        if let Ok(v) = std::env::var("KVDB_WRITE_BUFFER_SIZE") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.write_buffer_size = n;
            }
        }

        cfg
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_fsync_enabled(mut self, on: bool) -> Self {
        self.fsync_enabled = on;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_first_table_max_count(mut self, count: u64) -> Self {
        self.first_table_max_count = count;
        self
    }

    pub fn with_implicit_transaction_max_op(mut self, count: u64) -> Self {
        self.implicit_transaction_max_op = count;
        self
    }
}

/// Fluent builder producing a `Config`.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    cfg: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self { cfg: Config::from_env() }
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.cfg.compression = compression;
        self
    }

    pub fn fsync_enabled(mut self, on: bool) -> Self {
        self.cfg.fsync_enabled = on;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.cfg.write_buffer_size = bytes;
        self
    }

    pub fn first_table_max_count(mut self, count: u64) -> Self {
        self.cfg.first_table_max_count = count;
        self
    }

    pub fn build(self) -> Config {
        self.cfg
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config {{ compression: {}, fsync_enabled: {}, write_buffer_size: {}, first_table_max_count: {} }}",
            self.compression, self.fsync_enabled, self.write_buffer_size, self.first_table_max_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_the_documented_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.compression, CompressionType::Raw);
        assert!(cfg.fsync_enabled);
        assert_eq!(cfg.write_buffer_size, 0);
        assert_eq!(cfg.first_table_max_count, FIRST_TABLE_MAX_COUNT);
    }

    #[test]
    fn builder_overrides_compose() {
        let cfg = ConfigBuilder::new()
            .compression(CompressionType::Lz4)
            .fsync_enabled(false)
            .write_buffer_size(4096)
            .build();
        assert_eq!(cfg.compression, CompressionType::Lz4);
        assert!(!cfg.fsync_enabled);
        assert_eq!(cfg.write_buffer_size, 4096);
    }
}

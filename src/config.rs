//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) gives
//! the stock tuning: 64 KiB chunks, at most 4 sends in flight per file and
//! 10 concurrent content pulls.

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Size of each content read on the sender (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum chunks sent but not yet completed, per file (default 4).
    #[serde(default = "default_max_outstanding_sends")]
    pub max_outstanding_sends: usize,

    /// Maximum content channels the receiver keeps open at once (default 10).
    #[serde(default = "default_max_concurrent_pulls")]
    pub max_concurrent_pulls: usize,

    /// Threads in the sender's file read pool.
    #[serde(default = "default_workers")]
    pub read_workers: usize,

    /// Threads in the receiver's file write pool.
    #[serde(default = "default_workers")]
    pub write_workers: usize,

    /// Largest control frame payload accepted. Larger frames are skipped.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,

    /// Idle timeout enforced by the transport, in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Extension appended to in-progress files.
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,
}

fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_max_outstanding_sends() -> usize {
    4
}
fn default_max_concurrent_pulls() -> usize {
    10
}
fn default_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}
fn default_max_frame_len() -> u32 {
    u32::MAX
}
fn default_idle_timeout_ms() -> u64 {
    10_000
}
fn default_temp_suffix() -> String {
    "qsync".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_outstanding_sends: default_max_outstanding_sends(),
            max_concurrent_pulls: default_max_concurrent_pulls(),
            read_workers: default_workers(),
            write_workers: default_workers(),
            max_frame_len: default_max_frame_len(),
            idle_timeout_ms: default_idle_timeout_ms(),
            temp_suffix: default_temp_suffix(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| SyncError::io_path(path, e))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("chunk_size", self.chunk_size),
            ("max_outstanding_sends", self.max_outstanding_sends),
            ("max_concurrent_pulls", self.max_concurrent_pulls),
            ("read_workers", self.read_workers),
            ("write_workers", self.write_workers),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.temp_suffix.is_empty() || self.temp_suffix.contains('/') {
            return Err(SyncError::Config(format!(
                "invalid temp_suffix {:?}",
                self.temp_suffix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.max_outstanding_sends, 4);
        assert_eq!(config.max_concurrent_pulls, 10);
        assert_eq!(config.max_frame_len, u32::MAX);
        assert_eq!(config.temp_suffix, "qsync");
        assert!(config.read_workers >= 1);
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml("chunk_size = 4096\nmax_outstanding_sends = 2\n").unwrap();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_outstanding_sends, 2);
        assert_eq!(config.idle_timeout_ms, 10_000);
    }

    #[test]
    fn test_zero_rejected() {
        let err = Config::from_toml("max_outstanding_sends = 0").unwrap_err();
        assert!(err.to_string().contains("max_outstanding_sends"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_toml("chunk_sise = 10").is_err());
    }

    #[test]
    fn test_bad_suffix_rejected() {
        assert!(Config::from_toml("temp_suffix = \"a/b\"").is_err());
    }
}

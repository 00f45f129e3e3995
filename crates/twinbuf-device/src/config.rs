//! Device configuration

use crate::error::{DeviceError, Result};
use std::env;

/// Settings for constructing an emulated accelerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Bytes of device memory allocations may use (`None` = unbounded)
    pub memory_limit: Option<usize>,
    /// Threads executing kernel blocks (`None` = one per available core)
    pub compute_threads: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "emulated-accelerator".to_string(),
            memory_limit: None,
            compute_threads: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_compute_threads(mut self, threads: usize) -> Self {
        self.compute_threads = Some(threads);
        self
    }

    /// Build a configuration from environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `TWINBUF_DEVICE_NAME` - device name reported in logs
    /// - `TWINBUF_DEVICE_MEMORY_LIMIT` - bytes, with optional `k`, `m` or `g` suffix
    /// - `TWINBUF_DEVICE_THREADS` - kernel worker threads
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = env::var("TWINBUF_DEVICE_NAME") {
            if !name.trim().is_empty() {
                config.name = name.trim().to_string();
            }
        }

        if let Ok(limit) = env::var("TWINBUF_DEVICE_MEMORY_LIMIT") {
            config.memory_limit = Some(parse_byte_size(&limit)?);
        }

        if let Ok(threads) = env::var("TWINBUF_DEVICE_THREADS") {
            let threads = threads
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| DeviceError::Configuration(format!("TWINBUF_DEVICE_THREADS={threads:?} is not a positive integer")))?;
            config.compute_threads = Some(threads);
        }

        Ok(config)
    }
}

/// Parse `"4096"`, `"64k"`, `"512M"` or `"2g"` into bytes.
pub fn parse_byte_size(value: &str) -> Result<usize> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1usize << 10),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1usize << 20),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1usize << 30),
        _ => (trimmed, 1),
    };

    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| DeviceError::Configuration(format!("invalid byte size {value:?}")))
}

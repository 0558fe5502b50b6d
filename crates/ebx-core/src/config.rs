use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{EbxError, EbxResult};
use crate::types::RateLimits;

/// Top-level configuration (loaded from ebx.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EbxConfig {
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
    pub batch: BatchConfig,
    pub limits: LimitsConfig,
    pub polling: PollingConfig,
}

impl EbxConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error: defaults are returned and a warning is logged.
    pub fn load(path: &Path) -> EbxResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| EbxError::Config(format!("reading config {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| EbxError::Config(format!("parsing config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive (default: info). `RUST_LOG` takes precedence.
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// RSA modulus size for generated CSR key pairs (default: 2048)
    pub rsa_key_bits: usize,
    /// Material is treated as expired this many seconds before its validTo
    pub refresh_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Read buffer for streaming encryption and hashing (default: 64 KiB)
    pub io_chunk_size: usize,
    /// Largest part the server accepts (default: 100 MiB)
    pub max_part_size: u64,
    /// Largest archive the server accepts (default: 5 GiB)
    pub max_archive_size: u64,
    /// Directory for spooled archives and parts (default: system temp dir)
    pub spool_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Limits for endpoints without an entry in `endpoints`
    pub default: RateLimits,
    /// Static per-endpoint limits, keyed by logical endpoint name
    pub endpoints: HashMap<String, RateLimits>,
    /// Delay used when a throttle response carries no usable Retry-After
    pub throttle_floor_secs: u64,
    /// Attempts per call before a throttled call is surfaced as an error
    pub max_throttle_attempts: u32,
    /// Parts submitted concurrently by the uploader
    pub upload_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Backoff mode: "fixed" or "exponential"
    pub backoff: String,
    pub multiplier: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            rsa_key_bits: 2048,
            refresh_margin_secs: 300,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            io_chunk_size: 64 * 1024,
            max_part_size: 100 * 1024 * 1024,
            max_archive_size: 5 * 1024 * 1024 * 1024,
            spool_dir: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimits::default(),
            endpoints: HashMap::new(),
            throttle_floor_secs: 1,
            max_throttle_attempts: 5,
            upload_concurrency: 4,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: "exponential".into(),
            multiplier: 2.0,
        }
    }
}

use serde::{Deserialize, Serialize};

/// Size and SHA-256 digest of a byte source.
///
/// The same type describes both the plaintext and the ciphertext form of a
/// payload; which one it is depends on where it was computed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size_bytes: u64,
    /// Standard base64 of the 32-byte SHA-256 digest
    pub content_hash: String,
}

impl FileMetadata {
    pub fn new(size_bytes: u64, content_hash: impl Into<String>) -> Self {
        Self {
            size_bytes,
            content_hash: content_hash.into(),
        }
    }
}

/// Per-endpoint request ceilings.
///
/// A ceiling of 0 disables that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
}

impl RateLimits {
    pub const fn new(per_second: u32, per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_second,
            per_minute,
            per_hour,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new(10, 30, 120)
    }
}

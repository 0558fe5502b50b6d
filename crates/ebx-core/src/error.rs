use std::time::Duration;

use thiserror::Error;

pub type EbxResult<T> = Result<T, EbxError>;

#[derive(Debug, Error)]
pub enum EbxError {
    /// No key material is cached and fetching it failed.
    #[error("key material unavailable: {0}")]
    MaterialUnavailable(String),

    /// Envelope or token encryption requested before warm-up completed.
    #[error("key material not ready: call warmup() first")]
    MaterialNotReady,

    /// A forced refresh failed; the previously cached material is still active.
    #[error("key material refresh failed (previous material retained): {0}")]
    RefreshFailed(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("batch contains no documents")]
    EmptyBatch,

    #[error("too many parts requested for archive size: {requested} parts for {archive_size} bytes")]
    InvalidPartCount { requested: usize, archive_size: u64 },

    #[error("duplicate document name in batch: {0}")]
    DuplicateDocument(String),

    #[error("archive is {size} bytes, exceeding the {limit} byte limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    #[error(
        "server throttled after {attempts} attempts, last recommended delay was {}s",
        last_delay.as_secs_f64()
    )]
    RateLimitExceeded { attempts: u32, last_delay: Duration },

    #[error("condition not met after {attempts} poll attempts")]
    PollTimeout { attempts: u32 },

    #[error("part {ordinal} rejected: {reason}")]
    PartRejected { ordinal: u32, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_message_names_attempts_and_delay() {
        let err = EbxError::RateLimitExceeded {
            attempts: 4,
            last_delay: Duration::from_secs(5),
        };
        assert_eq!(
            err.to_string(),
            "server throttled after 4 attempts, last recommended delay was 5s"
        );
    }

    #[test]
    fn part_count_message_is_distinct() {
        let err = EbxError::InvalidPartCount {
            requested: 9,
            archive_size: 4,
        };
        assert!(err.to_string().contains("too many parts"));
    }
}

//! Concurrent upload of a prepared batch's parts
//!
//! The uploader only shapes calls; the HTTP request itself belongs to a
//! [`PartSubmitter`] supplied by the transport layer.

use std::sync::Arc;

use async_trait::async_trait;
use ebx_batch::{BatchPart, PreparedBatch};
use ebx_core::config::LimitsConfig;
use ebx_core::{EbxError, EbxResult};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::limiter::RateLimiter;
use crate::retry::{retry_throttled, Attempt};
use crate::throttle::ThrottleSignal;

/// Logical endpoint name used for part uploads.
pub const PART_ENDPOINT: &str = "batch-part";

/// What the transport observed for one part submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    Throttled(ThrottleSignal),
    Rejected(anyhow::Error),
}

#[async_trait]
pub trait PartSubmitter: Send + Sync {
    async fn submit(&self, part: &BatchPart) -> SubmitOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadReport {
    pub parts: usize,
    /// Submissions including throttled retries
    pub attempts: u32,
}

pub struct BatchUploader {
    limiter: Arc<RateLimiter>,
    endpoint: String,
    concurrency: usize,
    max_throttle_attempts: u32,
}

impl BatchUploader {
    pub fn new(limiter: Arc<RateLimiter>, concurrency: usize, max_throttle_attempts: u32) -> Self {
        Self {
            limiter,
            endpoint: PART_ENDPOINT.to_string(),
            concurrency: concurrency.max(1),
            max_throttle_attempts,
        }
    }

    pub fn from_config(limiter: Arc<RateLimiter>, cfg: &LimitsConfig) -> Self {
        Self::new(limiter, cfg.upload_concurrency, cfg.max_throttle_attempts)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Submit every part, at most `concurrency` at a time. The first part
    /// that fails aborts the remaining submissions.
    pub async fn upload_all(
        &self,
        batch: &PreparedBatch,
        submitter: &dyn PartSubmitter,
        cancel: &CancellationToken,
    ) -> EbxResult<UploadReport> {
        let attempts: Vec<u32> = stream::iter(&batch.parts)
            .map(|part| self.upload_part(part, submitter, cancel))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let report = UploadReport {
            parts: attempts.len(),
            attempts: attempts.iter().sum(),
        };
        info!(
            endpoint = %self.endpoint,
            parts = report.parts,
            attempts = report.attempts,
            "batch parts uploaded"
        );
        Ok(report)
    }

    async fn upload_part(
        &self,
        part: &BatchPart,
        submitter: &dyn PartSubmitter,
        cancel: &CancellationToken,
    ) -> EbxResult<u32> {
        let ordinal = part.ordinal_number;
        let mut used = 0;
        retry_throttled(
            &self.limiter,
            &self.endpoint,
            self.max_throttle_attempts,
            cancel,
            |attempt| {
                used = attempt;
                async move {
                    debug!(ordinal, attempt, bytes = part.ciphertext_metadata.size_bytes, "submitting part");
                    match submitter.submit(part).await {
                        SubmitOutcome::Accepted => Attempt::Complete(()),
                        SubmitOutcome::Throttled(signal) => Attempt::Throttled(signal),
                        SubmitOutcome::Rejected(e) => Attempt::Failed(EbxError::PartRejected {
                            ordinal,
                            reason: format!("{e:#}"),
                        }),
                    }
                }
            },
        )
        .await?;
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebx_batch::{BatchEnvelopeBuilder, Document};
    use ebx_core::types::RateLimits;
    use ebx_crypto::{EncryptionEnvelope, PublicKeyMaterial};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    fn batch(parts: usize) -> PreparedBatch {
        static KEY: OnceLock<rsa::RsaPublicKey> = OnceLock::new();
        let key = KEY.get_or_init(|| {
            rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048)
                .unwrap()
                .to_public_key()
        });
        let envelope = EncryptionEnvelope::generate(&PublicKeyMaterial::Rsa(key.clone())).unwrap();
        let docs: Vec<Document> = (0..4)
            .map(|i| Document::from_bytes(format!("doc-{i}.xml"), vec![i as u8; 3000]))
            .collect();
        BatchEnvelopeBuilder::new(4096, 1 << 30)
            .build(&docs, parts, envelope)
            .unwrap()
    }

    /// Throttles each ordinal a fixed number of times before accepting.
    #[derive(Default)]
    struct ScriptedSubmitter {
        throttle_first: HashMap<u32, usize>,
        reject: Option<u32>,
        seen: Mutex<HashMap<u32, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PartSubmitter for ScriptedSubmitter {
        async fn submit(&self, part: &BatchPart) -> SubmitOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let ordinal = part.ordinal_number;
            let calls = {
                let mut seen = self.seen.lock();
                let n = seen.entry(ordinal).or_default();
                *n += 1;
                *n
            };
            if self.reject == Some(ordinal) {
                return SubmitOutcome::Rejected(anyhow::anyhow!("HTTP 400: invalid part hash"));
            }
            if calls <= self.throttle_first.get(&ordinal).copied().unwrap_or(0) {
                return SubmitOutcome::Throttled(ThrottleSignal::after_seconds(2));
            }
            SubmitOutcome::Accepted
        }
    }

    fn uploader(concurrency: usize) -> BatchUploader {
        let limiter = Arc::new(RateLimiter::new(RateLimits::new(0, 0, 0)));
        BatchUploader::new(limiter, concurrency, 4)
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_every_part_with_retries() {
        let batch = batch(5);
        let submitter = ScriptedSubmitter {
            throttle_first: HashMap::from([(2, 2), (4, 1)]),
            ..Default::default()
        };

        let report = uploader(3)
            .upload_all(&batch, &submitter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.parts, 5);
        assert_eq!(report.attempts, 5 + 3);
        let seen = submitter.seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[&2], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let batch = batch(7);
        let submitter = ScriptedSubmitter::default();

        uploader(2)
            .upload_all(&batch, &submitter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(submitter.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_part_fails_upload() {
        let batch = batch(3);
        let submitter = ScriptedSubmitter {
            reject: Some(2),
            ..Default::default()
        };

        let err = uploader(1)
            .upload_all(&batch, &submitter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EbxError::PartRejected { ordinal: 2, ref reason } if reason.contains("HTTP 400")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_throttling_surfaces_rate_limit_error() {
        let batch = batch(1);
        let submitter = ScriptedSubmitter {
            throttle_first: HashMap::from([(1, usize::MAX)]),
            ..Default::default()
        };

        let err = uploader(1)
            .upload_all(&batch, &submitter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EbxError::RateLimitExceeded { attempts: 4, .. }));
    }
}

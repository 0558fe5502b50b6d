//! Throttle-aware retry around a single outbound call

use std::future::Future;

use ebx_core::{EbxError, EbxResult};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::limiter::RateLimiter;
use crate::throttle::ThrottleSignal;

/// Result of one attempt as classified by the transport.
#[derive(Debug)]
pub enum Attempt<T> {
    Complete(T),
    /// HTTP 429 or equivalent; retried after the recommended delay
    Throttled(ThrottleSignal),
    /// Anything else; surfaced immediately
    Failed(EbxError),
}

/// Run `call` behind the limiter, retrying throttled attempts.
///
/// Every attempt waits for admission on `endpoint`. After `max_attempts`
/// throttled attempts the call fails with `RateLimitExceeded`.
pub async fn retry_throttled<T, F, Fut>(
    limiter: &RateLimiter,
    endpoint: &str,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut call: F,
) -> EbxResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        limiter.await_admission(endpoint, cancel).await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EbxError::Cancelled),
            outcome = call(attempt) => outcome,
        };
        let signal = match outcome {
            Attempt::Complete(value) => return Ok(value),
            Attempt::Failed(e) => return Err(e),
            Attempt::Throttled(signal) => signal,
        };

        let delay = limiter.on_throttle_signal(&signal);
        if attempt >= max_attempts {
            return Err(EbxError::RateLimitExceeded {
                attempts: attempt,
                last_delay: delay,
            });
        }
        warn!(
            endpoint,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "throttled by server, backing off"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EbxError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebx_core::types::RateLimits;
    use std::time::Duration;
    use tokio::time::Instant;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimits::new(0, 0, 0))
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_call_succeeds_after_delay() {
        let limiter = limiter();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let value = retry_throttled(&limiter, "e", 5, &cancel, |attempt| async move {
            if attempt < 3 {
                Attempt::Throttled(ThrottleSignal::after_seconds(5))
            } else {
                Attempt::Complete(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_report_last_delay() {
        let limiter = limiter();
        let cancel = CancellationToken::new();

        let err = retry_throttled(&limiter, "e", 3, &cancel, |_| async {
            Attempt::<()>::Throttled(ThrottleSignal::after_seconds(7))
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            EbxError::RateLimitExceeded { attempts: 3, last_delay } if last_delay == Duration::from_secs(7)
        ));
        assert_eq!(
            err.to_string(),
            "server throttled after 3 attempts, last recommended delay was 7s"
        );
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let limiter = limiter();
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let err = retry_throttled(&limiter, "e", 5, &cancel, |_| {
            calls += 1;
            async { Attempt::<()>::Failed(EbxError::Crypto("bad padding".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EbxError::Crypto(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff() {
        let limiter = limiter();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = retry_throttled(&limiter, "e", 5, &cancel, |_| async {
            Attempt::<()>::Throttled(ThrottleSignal::after_seconds(60))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EbxError::Cancelled));
    }
}

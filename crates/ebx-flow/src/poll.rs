//! Probe-until-predicate polling for asynchronous server-side processing

use std::future::Future;
use std::time::Duration;

use ebx_core::config::PollingConfig;
use ebx_core::{EbxError, EbxResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delay between probe attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * multiplier^(n-1)` after the n-th attempt, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay after the `attempt`-th probe (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                Duration::try_from_secs_f64(secs).unwrap_or(max).min(max)
            }
        }
    }
}

/// Result of a poll that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome<T> {
    /// Last probe result
    pub value: T,
    pub attempts: u32,
    /// False when attempts ran out before the predicate held
    pub converged: bool,
}

type ErrorFilter = Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

pub struct Poller {
    max_attempts: u32,
    backoff: Backoff,
    strict: bool,
    retry_on_error: Option<ErrorFilter>,
}

impl Poller {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            strict: false,
            retry_on_error: None,
        }
    }

    pub fn from_config(cfg: &PollingConfig) -> EbxResult<Self> {
        let initial = Duration::from_millis(cfg.initial_delay_ms);
        let backoff = match cfg.backoff.as_str() {
            "fixed" => Backoff::Fixed(initial),
            "exponential" => Backoff::Exponential {
                initial,
                max: Duration::from_millis(cfg.max_delay_ms),
                multiplier: cfg.multiplier,
            },
            other => {
                return Err(EbxError::Config(format!(
                    "unknown polling backoff {other:?} (expected \"fixed\" or \"exponential\")"
                )))
            }
        };
        Ok(Self::new(cfg.max_attempts, backoff))
    }

    /// Exhaustion becomes `Err(PollTimeout)` instead of a non-converged outcome.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Probe errors matching `filter` are retried; all others propagate.
    pub fn retry_on_error<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on_error = Some(Box::new(filter));
        self
    }

    /// Call `probe` until `predicate` accepts its result or attempts run out.
    pub async fn poll_until<T, P, Fut, C>(
        &self,
        mut probe: P,
        predicate: C,
        cancel: &CancellationToken,
    ) -> EbxResult<PollOutcome<T>>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        C: Fn(&T) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EbxError::Cancelled),
                result = probe() => result,
            };
            let last_attempt = attempt >= self.max_attempts;

            match result {
                Ok(value) if predicate(&value) => {
                    debug!(attempt, "poll converged");
                    return Ok(PollOutcome {
                        value,
                        attempts: attempt,
                        converged: true,
                    });
                }
                Ok(value) if last_attempt => {
                    if self.strict {
                        return Err(EbxError::PollTimeout { attempts: attempt });
                    }
                    debug!(attempt, "poll gave up without converging");
                    return Ok(PollOutcome {
                        value,
                        attempts: attempt,
                        converged: false,
                    });
                }
                Ok(_) => {}
                Err(e) if !last_attempt && self.is_transient(&e) => {
                    warn!(attempt, "transient probe failure: {e:#}");
                }
                Err(e) => return Err(e.context(format!("probe failed on attempt {attempt}")).into()),
            }

            let delay = self.backoff.delay_after(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EbxError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn is_transient(&self, e: &anyhow::Error) -> bool {
        self.retry_on_error.as_ref().is_some_and(|filter| filter(e))
    }
}

//! Per-endpoint admission control over three sliding windows
//!
//! Each endpoint owns a `tokio::sync::Mutex` around its windows. A caller
//! holds that lock from the capacity check, through any sleep, to the
//! timestamp recording, so two callers can never both see the last free
//! slot. Tokio's mutex is FIFO, so waiters are admitted in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ebx_core::config::LimitsConfig;
use ebx_core::types::RateLimits;
use ebx_core::{EbxError, EbxResult};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::throttle::{ThrottleSignal, DEFAULT_THROTTLE_FLOOR};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Admission timestamps within the last `span`.
///
/// The window is half-open, `(now - span, now]`: a stamp exactly `span` old
/// has expired, so the computed wait always ends with capacity available.
#[derive(Debug)]
struct SlidingWindow {
    span: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .stamps
            .front()
            .is_some_and(|&t| t + self.span <= now)
        {
            self.stamps.pop_front();
        }
    }

    /// Time until one more call fits under `limit`, or `None` if it fits now.
    /// A limit of 0 disables the window.
    fn wait_for(&self, limit: u32, now: Instant) -> Option<Duration> {
        let limit = limit as usize;
        if limit == 0 || self.stamps.len() < limit {
            return None;
        }
        // after a limit decrease more than one stamp may need to expire
        let blocking = self.stamps[self.stamps.len() - limit];
        Some((blocking + self.span).saturating_duration_since(now))
    }
}

#[derive(Debug)]
struct EndpointWindows {
    second: SlidingWindow,
    minute: SlidingWindow,
    hour: SlidingWindow,
}

impl EndpointWindows {
    fn new() -> Self {
        Self {
            second: SlidingWindow::new(SECOND),
            minute: SlidingWindow::new(MINUTE),
            hour: SlidingWindow::new(HOUR),
        }
    }

    fn prune(&mut self, now: Instant) {
        self.second.prune(now);
        self.minute.prune(now);
        self.hour.prune(now);
    }

    /// Longest wait demanded by any saturated window.
    fn required_wait(&self, limits: &RateLimits, now: Instant) -> Option<Duration> {
        [
            self.second.wait_for(limits.per_second, now),
            self.minute.wait_for(limits.per_minute, now),
            self.hour.wait_for(limits.per_hour, now),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    fn record(&mut self, now: Instant) {
        self.second.stamps.push_back(now);
        self.minute.stamps.push_back(now);
        self.hour.stamps.push_back(now);
    }
}

/// Sliding-window rate limiter keyed by logical endpoint name.
#[derive(Debug)]
pub struct RateLimiter {
    default: RateLimits,
    static_limits: HashMap<String, RateLimits>,
    dynamic_limits: RwLock<HashMap<String, RateLimits>>,
    windows: Mutex<HashMap<String, Arc<tokio::sync::Mutex<EndpointWindows>>>>,
    throttle_floor: Duration,
}

impl RateLimiter {
    pub fn new(default: RateLimits) -> Self {
        Self {
            default,
            static_limits: HashMap::new(),
            dynamic_limits: RwLock::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            throttle_floor: DEFAULT_THROTTLE_FLOOR,
        }
    }

    pub fn from_config(cfg: &LimitsConfig) -> Self {
        let mut limiter = Self::new(cfg.default);
        limiter.static_limits = cfg.endpoints.clone();
        limiter.throttle_floor = Duration::from_secs(cfg.throttle_floor_secs.max(1));
        limiter
    }

    /// Static limits for one endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, limits: RateLimits) -> Self {
        self.static_limits.insert(endpoint.into(), limits);
        self
    }

    /// Effective limits: server-reported quota, then static table, then default.
    pub fn limits_for(&self, endpoint: &str) -> RateLimits {
        if let Some(limits) = self.dynamic_limits.read().get(endpoint) {
            return *limits;
        }
        self.static_limits
            .get(endpoint)
            .copied()
            .unwrap_or(self.default)
    }

    /// Install server-reported quotas. They supersede static limits until
    /// replaced or cleared.
    pub fn apply_quota(&self, quotas: HashMap<String, RateLimits>) {
        let mut dynamic = self.dynamic_limits.write();
        for (endpoint, limits) in quotas {
            debug!(endpoint = %endpoint, ?limits, "applying server quota");
            dynamic.insert(endpoint, limits);
        }
    }

    pub fn clear_dynamic(&self, endpoint: &str) {
        self.dynamic_limits.write().remove(endpoint);
    }

    /// Wait until `endpoint` has capacity under its effective limits, then
    /// record the call.
    pub async fn await_admission(&self, endpoint: &str, cancel: &CancellationToken) -> EbxResult<()> {
        let limits = self.limits_for(endpoint);
        self.await_admission_with(endpoint, &limits, cancel).await
    }

    /// As [`await_admission`](Self::await_admission) with explicit limits.
    pub async fn await_admission_with(
        &self,
        endpoint: &str,
        limits: &RateLimits,
        cancel: &CancellationToken,
    ) -> EbxResult<()> {
        let slot = self.windows_for(endpoint);
        let mut windows = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EbxError::Cancelled),
            guard = slot.lock() => guard,
        };

        loop {
            let now = Instant::now();
            windows.prune(now);
            let Some(wait) = windows.required_wait(limits, now) else {
                windows.record(now);
                return Ok(());
            };
            debug!(endpoint, wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EbxError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Recommended delay for a throttle response, floored at the configured minimum.
    pub fn on_throttle_signal(&self, signal: &ThrottleSignal) -> Duration {
        signal.recommended_delay(self.throttle_floor)
    }

    /// Calls recorded for `endpoint` in the last second, minute and hour.
    pub fn usage(&self, endpoint: &str) -> Option<(usize, usize, usize)> {
        let slot = Arc::clone(self.windows.lock().get(endpoint)?);
        let mut windows = slot.try_lock().ok()?;
        windows.prune(Instant::now());
        Some((
            windows.second.stamps.len(),
            windows.minute.stamps.len(),
            windows.hour.stamps.len(),
        ))
    }

    fn windows_for(&self, endpoint: &str) -> Arc<tokio::sync::Mutex<EndpointWindows>> {
        let mut all = self.windows.lock();
        Arc::clone(
            all.entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(EndpointWindows::new()))),
        )
    }
}

//! Server throttling signals (HTTP 429 + Retry-After)

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Delay used when a signal carries nothing usable.
pub const DEFAULT_THROTTLE_FLOOR: Duration = Duration::from_secs(1);

/// A "too many requests" response, as reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleSignal {
    pub retry_after_seconds: Option<u64>,
    pub retry_after_at: Option<DateTime<Utc>>,
}

impl ThrottleSignal {
    pub fn after_seconds(seconds: u64) -> Self {
        Self {
            retry_after_seconds: Some(seconds),
            retry_after_at: None,
        }
    }

    pub fn at(when: DateTime<Utc>) -> Self {
        Self {
            retry_after_seconds: None,
            retry_after_at: Some(when),
        }
    }

    /// Parse a Retry-After header value: delta-seconds or an HTTP-date.
    /// Unparseable values yield an empty signal.
    pub fn from_retry_after(value: &str) -> Self {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Self::after_seconds(seconds);
        }
        match DateTime::parse_from_rfc2822(value) {
            Ok(when) => Self::at(when.with_timezone(&Utc)),
            Err(e) => {
                tracing::debug!(value, "ignoring unparseable Retry-After: {e}");
                Self::default()
            }
        }
    }

    /// Recommended wait, evaluated at `now`. Always strictly positive.
    ///
    /// Seconds win over the absolute time; a zero or past value falls back
    /// to `floor`.
    pub fn recommended_delay_at(&self, now: DateTime<Utc>, floor: Duration) -> Duration {
        let floor = floor.max(Duration::from_millis(1));
        if let Some(seconds) = self.retry_after_seconds.filter(|s| *s > 0) {
            return Duration::from_secs(seconds);
        }
        self.retry_after_at
            .and_then(|at| (at - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero())
            .unwrap_or(floor)
    }

    pub fn recommended_delay(&self, floor: Duration) -> Duration {
        self.recommended_delay_at(Utc::now(), floor)
    }
}

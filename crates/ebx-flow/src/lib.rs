//! ebx-flow: shaping outbound calls to the e-invoicing service
//!
//! - `limiter`: per-endpoint second/minute/hour sliding windows
//! - `throttle`: Retry-After parsing and recommended delays
//! - `retry`: throttle-aware retry around one call
//! - `upload`: bounded-concurrency part upload through limiter + retry
//! - `poll`: probe-until-predicate with fixed or exponential backoff

pub mod limiter;
pub mod poll;
pub mod retry;
pub mod throttle;
pub mod upload;

pub use limiter::RateLimiter;
pub use poll::{Backoff, PollOutcome, Poller};
pub use retry::{retry_throttled, Attempt};
pub use throttle::ThrottleSignal;
pub use upload::{BatchUploader, PartSubmitter, SubmitOutcome, UploadReport};

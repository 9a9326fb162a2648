//! Reconnect policy for the client listener
//!
//! Exponential backoff with jitter, always clamped to a hard floor so a
//! misconfigured policy can never spin in a tight reconnect loop.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// No reconnect delay is ever shorter than this
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Backoff configuration for reconnect attempts
///
/// # Example
///
/// ```
/// use depot_core::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(30))
///     .with_max_retries(Some(10));
///
/// // First reconnect after ~1 second, then ~2, ~4, ... capped at 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive failures
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,

    /// Consecutive failed attempts tolerated before giving up; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl ReconnectPolicy {
    /// 1s initial, 30s cap, 2x growth, 10% jitter, unlimited retries
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            max_retries: None,
        }
    }

    /// Same delay for every attempt
    pub fn fixed(interval: Duration) -> Self {
        let interval = interval.max(MIN_RECONNECT_DELAY);
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            max_retries: None,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval.max(MIN_RECONNECT_DELAY);
        self.max_interval = self.max_interval.max(self.initial_interval);
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval.max(self.initial_interval).max(MIN_RECONNECT_DELAY);
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before reconnect attempt number `failures` (1-based count of
    /// consecutive failures so far). Never below [`MIN_RECONNECT_DELAY`].
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            capped + offset
        } else {
            capped
        };

        let floor = MIN_RECONNECT_DELAY.as_secs_f64();
        Duration::from_secs_f64(jittered.max(floor))
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn has_retries_remaining(&self, failures: u32) -> bool {
        match self.max_retries {
            Some(max) => failures <= max,
            None => true,
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

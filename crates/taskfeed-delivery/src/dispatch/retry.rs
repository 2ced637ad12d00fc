//! Delivery retry policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for delivery retries
///
/// Supports exponential backoff with jitter to avoid thundering herd when
/// many (subscriber, partition) loops back off at once.
///
/// # Example
///
/// ```
/// use taskfeed_delivery::dispatch::DeliveryRetryPolicy;
/// use std::time::Duration;
///
/// let policy = DeliveryRetryPolicy::default()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(100));
///
/// // First resend after ~100ms, then ~200ms, then ~400ms
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRetryPolicy {
    /// Maximum number of attempts per event (including the initial send)
    pub max_attempts: u32,

    /// Delay before the first resend
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between resends
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for DeliveryRetryPolicy {
    fn default() -> Self {
        // 200ms base, 30s cap, ceiling of 8 attempts
        Self {
            max_attempts: 8,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.25,
        }
    }
}

impl DeliveryRetryPolicy {
    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial resend interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum resend interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate the delay to wait before a given attempt number (1-based)
    ///
    /// Attempt 1 is the initial send and has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if there are attempts remaining after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
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
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

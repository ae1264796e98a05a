use rand::Rng;
use std::time::Duration;

pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAXIMUM_REDELIVERY_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const COLLISION_AVOIDANCE_FACTOR: f64 = 0.15;

/// How often and how slowly a failed exchange is redelivered to the node that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Negative means redeliver forever.
    pub maximum_redeliveries: i32,
    pub redelivery_delay: Duration,
    pub maximum_redelivery_delay: Duration,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
    pub use_collision_avoidance: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
            maximum_redelivery_delay: DEFAULT_MAXIMUM_REDELIVERY_DELAY,
            use_exponential_backoff: false,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            use_collision_avoidance: false,
        }
    }
}

impl RedeliveryPolicy {
    /// `attempt` is the 1-based redelivery about to happen.
    pub fn allows(&self, attempt: u32) -> bool {
        if self.maximum_redeliveries < 0 {
            return true;
        }
        attempt <= self.maximum_redeliveries as u32
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.redelivery_delay;
        if self.use_exponential_backoff && self.backoff_multiplier > 1.0 && attempt > 1 {
            let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
            delay = scale(delay, factor);
        }
        if self.use_collision_avoidance {
            delay = jitter_between(
                scale(delay, 1.0 - COLLISION_AVOIDANCE_FACTOR),
                scale(delay, 1.0 + COLLISION_AVOIDANCE_FACTOR),
            );
        }
        if !self.maximum_redelivery_delay.is_zero() && delay > self.maximum_redelivery_delay {
            delay = self.maximum_redelivery_delay;
        }
        delay
    }

    /// Copy with exception-clause overrides applied.
    pub fn overridden(
        &self,
        maximum_redeliveries: Option<i32>,
        redelivery_delay: Option<Duration>,
    ) -> Self {
        let mut policy = self.clone();
        if let Some(max) = maximum_redeliveries {
            policy.maximum_redeliveries = max;
        }
        if let Some(delay) = redelivery_delay {
            policy.redelivery_delay = delay;
        }
        policy
    }
}

fn scale(duration: Duration, factor: f64) -> Duration {
    let secs = duration.as_secs_f64() * factor;
    if !secs.is_finite() || secs > u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}

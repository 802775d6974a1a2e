use std::time::Duration;

/// Reconnect delay policy: exponential growth from a seed, capped at a
/// ceiling, with proportional jitter to spread simultaneous reconnects.
///
/// The policy is a pure function of the retry count; randomness comes in
/// as an argument so callers can test delays without a live RNG.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub seed: Duration,
    pub factor: u32,
    pub ceiling: Duration,
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            seed: Duration::from_secs(1),
            factor: 2,
            ceiling: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `retry_count`. Counts 0 and 1 both map to the
    /// seed; each further failed attempt doubles (or multiplies by
    /// `factor`) until the ceiling.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let multiplier = u64::from(self.factor.max(1))
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let millis = u64::try_from(self.seed.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(multiplier);
        Duration::from_millis(millis).min(self.ceiling)
    }

    /// Base delay scattered by `rand01` (uniform in `[0, 1)`) across
    /// `base * (1 ± jitter_ratio)`.
    pub fn jittered_delay(&self, retry_count: u32, rand01: f64) -> Duration {
        let base = self.base_delay(retry_count);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return base;
        }
        let spread = (rand01.clamp(0.0, 1.0) * 2.0 - 1.0) * ratio;
        let millis = base.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

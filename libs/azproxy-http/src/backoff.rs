use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy.
///
/// The delay before retry number `attempt` (0-based) is
/// `min(initial * multiplier^attempt, max)`, plus up to 25% jitter when
/// enabled (still capped at `max`).
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 250ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 4s)
    pub max: Duration,

    /// Growth factor (default: 2.0)
    pub multiplier: f64,

    /// Add 0-25% random delay (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Deterministic variant of [`new`](Self::new).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Delay before retry number `attempt` (0 = first retry).
///
/// Non-finite or negative parameters are sanitised rather than trusted, so a
/// bad config value degrades to a sane delay instead of a panic inside
/// `Duration::from_secs_f64`.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    const MAX_BACKOFF_SECS: f64 = 86_400.0;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };
    let initial = backoff.initial.as_secs_f64();
    let max = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let raw = initial * multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.clamp(0.0, max)
    } else {
        max
    };
    let delay = Duration::from_secs_f64(capped);

    let delay = if backoff.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        delay + delay.mul_f64(factor)
    } else {
        delay
    };

    delay.min(Duration::from_secs_f64(max))
}

//! Delay handlers deciding how long to sleep between attempts.

use std::time::Duration;

use rand::Rng;

use super::RetryState;

/// The default delay handler.
///
/// `min(max_wait, random(base_wait, last_sleep * try^exp_factor)) + random(0, max_jitter)`
///
/// The first retry has no previous sleep, so it waits `base_wait` plus jitter. Every later
/// retry draws from a range whose upper end grows with the previous sleep, so waits drift
/// towards `max_wait` the more attempts fail. Loosely based on
/// <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.
pub fn randomized_backoff(state: &RetryState) -> Duration {
    let options = &state.options;
    let grown_ms = state.last_sleep.as_millis() as f64
        * f64::from(state.try_number).powf(options.exp_factor);

    let wait_ms = random_between(millis(options.base_wait), grown_ms as u64)
        .min(millis(options.max_wait));
    let jitter_ms = random_between(0, millis(options.max_jitter));

    Duration::from_millis(wait_ms.saturating_add(jitter_ms))
}

/// Uniform in `lo..=hi`; collapses to `lo` when the range is empty.
fn random_between(lo: u64, hi: u64) -> u64 {
    if hi <= lo {
        return lo;
    }
    rand::rng().random_range(lo..=hi)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A deterministic back-off: `initial * factor^(try - 1)`, optionally capped.
///
/// ```rust
/// use std::time::Duration;
/// use autoscale_retry::retry::backoff::ExponentialBackoff;
///
/// let backoff = ExponentialBackoff::from_millis(100)
///     .factor(2)
///     .max_delay(Duration::from_millis(500));
///
/// assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
/// assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
/// assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_ms: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub const fn from_millis(initial_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_ms,
            factor: 1,
            max_delay: None,
        }
    }

    /// Growth applied per failed try. Default is `1` (constant delay).
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Delay to sleep after try number `try_number` (1-based) failed.
    pub fn delay_for(&self, try_number: u32) -> Duration {
        let exponent = try_number.saturating_sub(1);
        let ms = self
            .factor
            .checked_pow(exponent)
            .and_then(|scale| scale.checked_mul(self.initial_ms))
            .unwrap_or(u64::MAX);
        let delay = Duration::from_millis(ms);

        match self.max_delay {
            Some(max) if delay > max => max,
            _ => delay,
        }
    }

    pub fn into_handler(self) -> impl Fn(&RetryState) -> Duration + Send + Sync + 'static {
        move |state: &RetryState| self.delay_for(state.try_number)
    }
}

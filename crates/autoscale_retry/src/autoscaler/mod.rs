//! Admission control that discovers how much parallelism a backend tolerates.

mod controller;
mod failure;
mod service;

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

pub use controller::MetricsSnapshot;
pub use failure::{ClassifyFn, FailureLogic, FailureVerdict, NeverBusy, classify_fn};
pub use service::{Autoscaler, AutoscalerDiagnostics, RequestId};

/// Configuration of the autoscaler's control loop.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `min_parallel` | required | Starting and lowest ceiling |
/// | `max_parallel` | unbounded | Hard cap on in-flight calls |
/// | `grow_delay` | required | Saturated time needed per +1 step; also the heartbeat period |
/// | `busy_grow_delay` | required | Cool-down after a "too busy" verdict, during which growth stops |
/// | `idle_or_busy_decrease` | disabled | Interval at which an idle or distressed ceiling shrinks |
/// | `busy_extra_penalty` | 1 | Immediate decrease on the first "too busy" of a cool-down |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use autoscale_retry::autoscaler::AutoscalerSettings;
///
/// let settings = AutoscalerSettings::builder()
///     .min_parallel(4)
///     .grow_delay(Duration::from_millis(500))
///     .busy_grow_delay(Duration::from_secs(3))
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoscalerSettings {
    /// Lowest concurrency ceiling, and the one the autoscaler starts with. At least 1.
    pub(crate) min_parallel: usize,

    /// Never run more than this many backend calls at once, whatever the ceiling says.
    #[serde(default)]
    pub(crate) max_parallel: Option<usize>,

    /// How long every slot has to stay busy before the ceiling grows by one.
    ///
    /// While work is blocked on the ceiling, the autoscaler wakes itself up at this period to
    /// re-evaluate, even when no call completes.
    pub(crate) grow_delay: Duration,

    /// After a "too busy" verdict, growth is suspended for this long, and further "too busy"
    /// verdicts inside the window do not penalize the ceiling again.
    pub(crate) busy_grow_delay: Duration,

    /// Shrink the ceiling when the autoscaler has been idle, or is still hearing "too busy",
    /// for this long. `None` disables decay.
    #[serde(default)]
    pub(crate) idle_or_busy_decrease: Option<Duration>,

    /// Ceiling decrease applied by the first "too busy" verdict of a window. `0` leaves the
    /// ceiling alone and only pauses growth.
    #[builder(default = default_busy_extra_penalty())]
    #[serde(default = "default_busy_extra_penalty")]
    pub(crate) busy_extra_penalty: usize,
}

const fn default_busy_extra_penalty() -> usize {
    1
}

impl AutoscalerSettings {
    pub const fn get_min_parallel(&self) -> usize {
        self.min_parallel
    }

    pub const fn get_max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    pub const fn get_grow_delay(&self) -> Duration {
        self.grow_delay
    }

    pub const fn get_busy_grow_delay(&self) -> Duration {
        self.busy_grow_delay
    }

    pub const fn get_idle_or_busy_decrease(&self) -> Option<Duration> {
        self.idle_or_busy_decrease
    }

    pub const fn get_busy_extra_penalty(&self) -> usize {
        self.busy_extra_penalty
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        ensure!(
            self.min_parallel >= 1,
            MinParallelTooSmallSnafu {
                min_parallel: self.min_parallel
            }
        );
        if let Some(max_parallel) = self.max_parallel {
            ensure!(
                max_parallel >= self.min_parallel,
                MaxParallelBelowMinSnafu {
                    min_parallel: self.min_parallel,
                    max_parallel,
                }
            );
        }
        ensure!(!self.grow_delay.is_zero(), ZeroGrowDelaySnafu);
        Ok(())
    }
}

/// Invalid [`AutoscalerSettings`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum BuildError {
    #[snafu(display("min_parallel must be at least 1, got {}", min_parallel))]
    MinParallelTooSmall { min_parallel: usize },
    #[snafu(display(
        "max_parallel ({}) must not be below min_parallel ({})",
        max_parallel,
        min_parallel
    ))]
    MaxParallelBelowMin {
        min_parallel: usize,
        max_parallel: usize,
    },
    #[snafu(display("grow_delay must be greater than zero"))]
    ZeroGrowDelay,
}

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::AutoscalerSettings;
use crate::internal_event::{AutoscalerLimitChanged, InternalEvent, LimitChangeReason};

/// Concurrency bookkeeping of one autoscaler.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConcurrencyMetrics {
    /// Current ceiling of in-flight backend calls.
    pub(crate) max_active: usize,
    pub(crate) active_count: usize,
    pub(crate) last_grow: Instant,
    /// Last time a pass found every slot busy.
    pub(crate) last_max: Instant,
    pub(crate) last_decay: Instant,
    pub(crate) last_too_busy: Option<Instant>,
    /// Start of the current post-"too busy" cool-down, during which growth is suspended.
    pub(crate) too_busy_window_start: Option<Instant>,
}

/// Read-only view of the concurrency bookkeeping, with timestamps expressed as time elapsed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub max_active: usize,
    pub active_count: usize,
    pub since_last_grow: Duration,
    pub since_last_max: Duration,
    pub since_last_decay: Duration,
    pub since_last_too_busy: Option<Duration>,
    pub since_too_busy_window_start: Option<Duration>,
}

/// What one iteration of the dispatch loop may do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Dispatch,
    QueueEmpty,
    AtHardCap,
    AtCeiling,
}

/// The control loop, free of queues and tasks so it can be driven with explicit instants.
#[derive(Debug)]
pub(crate) struct Controller {
    settings: AutoscalerSettings,
    metrics: ConcurrencyMetrics,
    last_pass: Instant,
}

impl Controller {
    pub(crate) fn new(settings: AutoscalerSettings, now: Instant) -> Self {
        Self {
            settings,
            metrics: ConcurrencyMetrics {
                max_active: settings.min_parallel,
                active_count: 0,
                last_grow: now,
                last_max: now,
                last_decay: now,
                last_too_busy: None,
                too_busy_window_start: None,
            },
            last_pass: now,
        }
    }

    pub(crate) const fn max_active(&self) -> usize {
        self.metrics.max_active
    }

    pub(crate) const fn active_count(&self) -> usize {
        self.metrics.active_count
    }

    const fn at_ceiling(&self) -> bool {
        self.metrics.active_count >= self.metrics.max_active
    }

    /// Housekeeping for one iteration of a dispatch pass, followed by the admission decision.
    pub(crate) fn admit(&mut self, now: Instant, pending: usize) -> Admission {
        if pending == 0 {
            return Admission::QueueEmpty;
        }
        if self.at_ceiling() {
            self.metrics.last_max = now;
        }
        if let Some(max_parallel) = self.settings.max_parallel {
            if self.metrics.active_count >= max_parallel {
                return Admission::AtHardCap;
            }
        }

        if self.at_ceiling()
            && elapsed(now, self.metrics.last_grow) >= self.settings.grow_delay
            && !self.in_busy_window(now)
        {
            self.set_max_active(self.metrics.max_active + 1, LimitChangeReason::Grow);
            self.metrics.last_grow = now;
        }

        self.maybe_decay(now);

        if self.at_ceiling() {
            Admission::AtCeiling
        } else {
            Admission::Dispatch
        }
    }

    fn maybe_decay(&mut self, now: Instant) {
        let Some(decrease) = self.settings.idle_or_busy_decrease else {
            return;
        };
        // Stretched by the gap since the previous pass.
        let horizon = decrease + elapsed(now, self.last_pass);
        if elapsed(now, self.metrics.last_decay) < horizon {
            return;
        }

        let idle = elapsed(now, self.metrics.last_max) >= horizon;
        let busy = self
            .metrics
            .last_too_busy
            .is_some_and(|at| elapsed(now, at) < decrease);
        if !(idle || busy) {
            return;
        }

        let idle_intervals =
            (elapsed(now, self.metrics.last_max).as_secs_f64() / decrease.as_secs_f64()).round();
        let reduce_by = 1 + idle_intervals as usize;
        let reduced = self
            .metrics
            .max_active
            .saturating_sub(reduce_by)
            .max(self.settings.min_parallel);
        self.set_max_active(reduced, LimitChangeReason::Decay);

        // Growth waits a full interval again.
        self.metrics.last_max = now;
        self.metrics.last_decay = now;
    }

    fn in_busy_window(&self, now: Instant) -> bool {
        self.metrics
            .too_busy_window_start
            .is_some_and(|start| elapsed(now, start) < self.settings.busy_grow_delay)
    }

    pub(crate) fn on_dispatch(&mut self) {
        self.metrics.active_count += 1;
    }

    pub(crate) fn on_complete(&mut self) {
        self.metrics.active_count = self.metrics.active_count.saturating_sub(1);
    }

    /// Records a "too busy" verdict. The first one of a cool-down window lowers the ceiling by
    /// `busy_extra_penalty` and opens a new window; returns whether that happened.
    pub(crate) fn on_too_busy(&mut self, now: Instant) -> bool {
        self.metrics.last_too_busy = Some(now);
        if self.in_busy_window(now) {
            return false;
        }

        let penalized = self
            .metrics
            .max_active
            .saturating_sub(self.settings.busy_extra_penalty)
            .max(self.settings.min_parallel);
        self.set_max_active(penalized, LimitChangeReason::TooBusyPenalty);
        self.metrics.too_busy_window_start = Some(now);
        true
    }

    pub(crate) fn finish_pass(&mut self, now: Instant) {
        self.last_pass = now;
    }

    /// Work is waiting and only a freed slot or a later growth step can release it.
    pub(crate) const fn needs_heartbeat(&self, pending: usize) -> bool {
        pending > 0 && self.at_ceiling()
    }

    fn set_max_active(&mut self, max_active: usize, reason: LimitChangeReason) {
        let previous = self.metrics.max_active;
        if previous == max_active {
            return;
        }
        self.metrics.max_active = max_active;
        AutoscalerLimitChanged {
            previous,
            max_active,
            reason,
        }
        .emit();
    }

    pub(crate) fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            max_active: m.max_active,
            active_count: m.active_count,
            since_last_grow: elapsed(now, m.last_grow),
            since_last_max: elapsed(now, m.last_max),
            since_last_decay: elapsed(now, m.last_decay),
            since_last_too_busy: m.last_too_busy.map(|at| elapsed(now, at)),
            since_too_busy_window_start: m.too_busy_window_start.map(|at| elapsed(now, at)),
        }
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}

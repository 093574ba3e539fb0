//! Metrics and log events emitted by the autoscaler and the retry engine.

use std::{fmt, time::Duration};

use metrics::{counter, gauge, histogram};

pub trait InternalEvent: Sized {
    fn emit(self);
}

/// Why the concurrency ceiling moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitChangeReason {
    Grow,
    TooBusyPenalty,
    Decay,
}

impl LimitChangeReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            LimitChangeReason::Grow => "grow",
            LimitChangeReason::TooBusyPenalty => "too_busy_penalty",
            LimitChangeReason::Decay => "decay",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AutoscalerLimitChanged {
    pub previous: usize,
    pub max_active: usize,
    pub reason: LimitChangeReason,
}

impl InternalEvent for AutoscalerLimitChanged {
    fn emit(self) {
        gauge!("autoscaler_max_active").set(self.max_active as f64);
        counter!("autoscaler_limit_changes_total", "reason" => self.reason.as_str()).increment(1);
        debug!(
            target: "autoscale_retry::stats",
            previous = self.previous,
            max_active = self.max_active,
            reason = self.reason.as_str(),
            "Concurrency limit adjusted"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AutoscalerInFlight {
    pub active: usize,
    pub pending: usize,
}

impl InternalEvent for AutoscalerInFlight {
    fn emit(self) {
        gauge!("autoscaler_active").set(self.active as f64);
        gauge!("autoscaler_pending").set(self.pending as f64);
        trace!(
            target: "autoscale_retry::stats",
            active = self.active,
            pending = self.pending,
            "In-flight updated"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AutoscalerTooBusy {
    pub request_id: u64,
    pub penalized: bool,
}

impl InternalEvent for AutoscalerTooBusy {
    fn emit(self) {
        counter!("autoscaler_too_busy_total").increment(1);
        debug!(
            message = "Backend too busy; request requeued at the front.",
            request_id = self.request_id,
            penalized = self.penalized,
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AutoscalerCallPanicked {
    pub request_id: u64,
}

impl InternalEvent for AutoscalerCallPanicked {
    fn emit(self) {
        counter!("autoscaler_call_panics_total").increment(1);
        error!(
            message = "Backend call panicked; request abandoned.",
            request_id = self.request_id,
        );
    }
}

pub struct RetryAttemptFailed<'a> {
    pub try_number: u32,
    pub timed_out: bool,
    pub error: &'a dyn fmt::Display,
}

impl InternalEvent for RetryAttemptFailed<'_> {
    fn emit(self) {
        counter!("retry_attempt_failures_total").increment(1);
        warn!(
            message = "Attempt failed.",
            try_number = self.try_number,
            timed_out = self.timed_out,
            error = %self.error,
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryScheduled {
    pub try_number: u32,
    pub delay: Duration,
}

impl InternalEvent for RetryScheduled {
    fn emit(self) {
        histogram!("retry_delay_seconds").record(self.delay.as_secs_f64());
        debug!(
            message = "Retrying request.",
            next_try = self.try_number + 1,
            delay_ms = %self.delay.as_millis(),
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryExhausted {
    pub try_number: u32,
    pub timeout: bool,
}

impl InternalEvent for RetryExhausted {
    fn emit(self) {
        counter!("retry_exhausted_total", "kind" => if self.timeout { "timeout" } else { "max_retries" })
            .increment(1);
        error!(
            message = "Retries exhausted; giving up.",
            try_number = self.try_number,
            timeout = self.timeout,
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryRejected {
    pub try_number: u32,
}

impl InternalEvent for RetryRejected {
    fn emit(self) {
        counter!("retry_rejected_total").increment(1);
        debug!(
            message = "Response error handler rejected the attempt; not retrying.",
            try_number = self.try_number,
        );
    }
}

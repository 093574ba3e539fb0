//! Concurrency control for calling a rate-limited backend.
//!
//! This crate provides two independent primitives that are usually combined in front of an
//! API client:
//!
//! - [`autoscaler::Autoscaler`]: an admission-control queue that discovers a safe level of
//!   parallelism at runtime. It grows its concurrency ceiling by one while it stays saturated
//!   without distress, penalises it when the backend answers "too busy", and lets it decay
//!   when the backend sits idle.
//! - [`retry::RetryEngine`]: invokes a fallible async worker until it succeeds, bounded by a
//!   per-attempt timeout, a total time budget and an attempt cap, sleeping a randomized
//!   exponential backoff between attempts.
//!
//! Both hand results back through [`completion::CompletionHandle`] or plain futures, and both
//! implement [`tower::Service`] so they compose with `ServiceBuilder`.
//!
//! # Algorithm Overview
//!
//! The autoscaler is AIMD-flavoured:
//! 1. **Additive Increase**: while every slot is busy and no "too busy" signal arrived during
//!    the last `busy_grow_delay`, the ceiling grows by 1 every `grow_delay`.
//! 2. **Penalty Decrease**: the first "too busy" signal of a window lowers the ceiling by
//!    `busy_extra_penalty`; the rejected request goes back to the front of the queue.
//! 3. **Decay**: when idle (or still being told "too busy"), the ceiling shrinks every
//!    `idle_or_busy_decrease`, never below `min_parallel`.
//!
//! # Basic Usage
//! ```no_run
//! use autoscale_retry::autoscaler::{Autoscaler, AutoscalerSettings, FailureVerdict, classify_fn};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let settings = AutoscalerSettings::builder()
//!     .min_parallel(2)
//!     .max_parallel(16)
//!     .grow_delay(Duration::from_secs(1))
//!     .busy_grow_delay(Duration::from_secs(5))
//!     .idle_or_busy_decrease(Duration::from_secs(10))
//!     .build();
//!
//! let autoscaler = Autoscaler::new(
//!     settings,
//!     |page: u32| async move { Ok::<_, std::io::Error>(page * 2) },
//!     classify_fn(|err: &std::io::Error| match err.kind() {
//!         std::io::ErrorKind::WouldBlock => FailureVerdict::TooBusy,
//!         _ => FailureVerdict::Fail,
//!     }),
//! )?;
//!
//! let doubled = autoscaler.submit_request(21).await?;
//! assert_eq!(doubled, 42);
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics and debug logs via the [`internal_event::InternalEvent`] trait.
pub mod autoscaler;
pub mod completion;
pub mod http;
pub mod internal_event;
pub mod retry;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

//! Bounded retries of a fallible async operation.
//!
//! [`RetryEngine`] wraps a worker `Fn(Args) -> Future<Output = Result<T, E>>` and keeps
//! invoking it until it succeeds, an interceptor settles the outcome, or a budget runs out:
//!
//! - `max_retries`: retries allowed after the first attempt.
//! - `try_timeout`: budget of one attempt. A timed-out attempt is abandoned (after the optional
//!   abort handler has finished) and counts as a failure.
//! - `total_timeout`: wall-clock budget of the whole invocation. An attempt never starts without
//!   budget left, and a backoff that would overflow the budget fails immediately instead of
//!   sleeping first.
//!
//! Callers only ever observe the final success or a [`RetryError`].

use std::{
    fmt,
    future::Future,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bon::Builder;
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::time::{Instant, sleep, timeout};
use tower::Service;

use crate::{
    Error as CrateError, instant_now,
    internal_event::{
        InternalEvent, RetryAttemptFailed, RetryExhausted, RetryRejected, RetryScheduled,
    },
};

pub mod backoff;

/// Budgets and backoff shape of a [`RetryEngine`].
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_retries` | unlimited | Retries allowed after the first attempt |
/// | `total_timeout` | 60s | Budget for all attempts and sleeps combined |
/// | `try_timeout` | 60s | Budget for a single attempt |
/// | `base_wait` | 0 | Minimum sleep between attempts |
/// | `max_wait` | 5s | Maximum sleep between attempts, before jitter |
/// | `max_jitter` | 100ms | Upper bound of the random extra sleep added to every delay |
/// | `exp_factor` | 1.0 | Biases later retries towards longer waits |
///
/// ```rust
/// use std::time::Duration;
/// use autoscale_retry::retry::RetryOptions;
///
/// let options = RetryOptions::builder()
///     .max_retries(5)
///     .total_timeout(Duration::from_secs(30))
///     .try_timeout(Duration::from_secs(10))
///     .build();
/// assert_eq!(options.max_wait, Duration::from_secs(5));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOptions {
    /// Retries allowed after the first attempt; `None` leaves only the time budgets.
    #[serde(default)]
    pub max_retries: Option<u32>,

    #[builder(default = default_total_timeout())]
    #[serde(default = "default_total_timeout")]
    pub total_timeout: Duration,

    /// If an attempt takes longer it is abandoned. Set an abort handler on the engine if the
    /// worker can be told to stop.
    #[builder(default = default_try_timeout())]
    #[serde(default = "default_try_timeout")]
    pub try_timeout: Duration,

    #[builder(default = Duration::ZERO)]
    #[serde(default)]
    pub base_wait: Duration,

    #[builder(default = default_max_wait())]
    #[serde(default = "default_max_wait")]
    pub max_wait: Duration,

    /// Random extra delay added to every sleep, spreading out clients that failed together.
    #[builder(default = default_max_jitter())]
    #[serde(default = "default_max_jitter")]
    pub max_jitter: Duration,

    #[builder(default = default_exp_factor())]
    #[serde(default = "default_exp_factor")]
    pub exp_factor: f64,
}

const fn default_total_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_try_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_wait() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_jitter() -> Duration {
    Duration::from_millis(100)
}

const fn default_exp_factor() -> f64 {
    1.0
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Per-invocation bookkeeping, handed to the delay handler and interceptors and carried by
/// every [`RetryError`].
#[derive(Clone, Debug)]
pub struct RetryState {
    /// When `invoke` was called.
    pub invoke_time: Instant,
    /// The current try, starting at `1`. Once the invocation has failed it is the last try
    /// that actually ran.
    pub try_number: u32,
    /// When the latest try started.
    pub try_start: Option<Instant>,
    /// How long we slept before the current try; zero on the first.
    pub last_sleep: Duration,
    pub options: RetryOptions,
}

impl RetryState {
    pub(crate) fn new(options: RetryOptions) -> Self {
        Self {
            invoke_time: instant_now(),
            try_number: 1,
            try_start: None,
            last_sleep: Duration::ZERO,
            options,
        }
    }

    pub fn elapsed(&self) -> Duration {
        instant_now().saturating_duration_since(self.invoke_time)
    }

    fn retries_made(&self) -> u32 {
        self.try_number - 1
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RetryError {
    /// All allowed attempts failed.
    #[snafu(display("max tries exceeded after {} attempts", state.try_number))]
    MaxRetries {
        state: RetryState,
        last_error: Option<CrateError>,
    },

    /// A single attempt ran past `try_timeout`. Only ever handed to the abort handler.
    #[snafu(display(
        "try timeout exceeded on try {} after {}ms",
        state.try_number,
        timeout.as_millis()
    ))]
    AttemptTimeout { state: RetryState, timeout: Duration },

    /// No budget was left to start the next attempt.
    #[snafu(display(
        "timeout exceeded on try {}: total timeout of {}ms is spent",
        state.try_number,
        state.options.total_timeout.as_millis()
    ))]
    TotalTimeout {
        state: RetryState,
        last_error: Option<CrateError>,
    },

    /// Sleeping before the next attempt would overflow `total_timeout`.
    #[snafu(display(
        "total timeout of {}ms would be exceeded by the next {}ms delay (try {})",
        state.options.total_timeout.as_millis(),
        delay.as_millis(),
        state.try_number
    ))]
    DelayExceedsBudget {
        state: RetryState,
        delay: Duration,
        last_error: Option<CrateError>,
    },

    /// The response error handler turned a failed attempt into this error.
    #[snafu(display(
        "rejected by the response error handler on try {}: {}",
        state.try_number,
        source
    ))]
    Rejected { state: RetryState, source: CrateError },
}

impl RetryError {
    /// Whether a time budget, rather than the attempt cap or the response error handler, ended
    /// the invocation.
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            RetryError::AttemptTimeout { .. }
                | RetryError::TotalTimeout { .. }
                | RetryError::DelayExceedsBudget { .. }
        )
    }

    pub const fn state(&self) -> &RetryState {
        match self {
            RetryError::MaxRetries { state, .. }
            | RetryError::AttemptTimeout { state, .. }
            | RetryError::TotalTimeout { state, .. }
            | RetryError::DelayExceedsBudget { state, .. }
            | RetryError::Rejected { state, .. } => state,
        }
    }

    /// The failure of the final attempt, if any attempt ran.
    pub fn last_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            RetryError::MaxRetries { last_error, .. }
            | RetryError::TotalTimeout { last_error, .. }
            | RetryError::DelayExceedsBudget { last_error, .. } => last_error.as_deref(),
            RetryError::Rejected { source, .. } => Some(source.as_ref()),
            RetryError::AttemptTimeout { .. } => None,
        }
    }
}

/// The outcome of one failed attempt, as seen by the response error handler.
#[derive(Debug, Snafu)]
pub enum AttemptError<E>
where
    E: fmt::Display,
{
    /// The worker (or the response handler) returned an error.
    #[snafu(display("{error}"))]
    Worker { error: E },

    /// The attempt was abandoned after `timeout`.
    #[snafu(display("attempt timed out after {}ms", timeout.as_millis()))]
    TimedOut { timeout: Duration },
}

impl<E: fmt::Display> AttemptError<E> {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut { .. })
    }

    fn into_boxed(self) -> CrateError
    where
        E: Into<CrateError>,
    {
        match self {
            AttemptError::Worker { error } => error.into(),
            timed_out @ AttemptError::TimedOut { .. } => CrateError::from(timed_out.to_string()),
        }
    }
}

type WorkerFn<Args, T, E> = Arc<dyn Fn(Args) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type DelayHandler = Arc<dyn Fn(&RetryState) -> Duration + Send + Sync>;
type AbortHandler = Arc<dyn Fn(&RetryError) -> BoxFuture<'static, ()> + Send + Sync>;
type ResponseHandler<T, E> =
    Arc<dyn Fn(T, &RetryState) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type ResponseErrorHandler<T, E> = Arc<
    dyn Fn(AttemptError<E>, &RetryState) -> BoxFuture<'static, Result<T, AttemptError<E>>>
        + Send
        + Sync,
>;

/// Invokes a worker until it succeeds or a budget in [`RetryOptions`] is exhausted.
///
/// ```rust
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use autoscale_retry::retry::{RetryEngine, RetryOptions};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let calls = Arc::new(AtomicU32::new(0));
/// let counter = Arc::clone(&calls);
/// let engine = RetryEngine::new(
///     RetryOptions::builder().max_retries(5).build(),
///     move |name: &'static str| {
///         let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
///         async move {
///             if attempt < 3 {
///                 Err(std::io::Error::other("flaky"))
///             } else {
///                 Ok(format!("hello {}", name))
///             }
///         }
///     },
/// );
///
/// assert_eq!(engine.invoke("world").await.unwrap(), "hello world");
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # }
/// ```
pub struct RetryEngine<Args, T, E>
where
    E: fmt::Display,
{
    options: RetryOptions,
    worker: WorkerFn<Args, T, E>,
    delay_handler: DelayHandler,
    abort_handler: Option<AbortHandler>,
    response_handler: Option<ResponseHandler<T, E>>,
    response_error_handler: Option<ResponseErrorHandler<T, E>>,
}

impl<Args, T, E: fmt::Display> Clone for RetryEngine<Args, T, E> {
    fn clone(&self) -> Self {
        Self {
            options: self.options,
            worker: Arc::clone(&self.worker),
            delay_handler: Arc::clone(&self.delay_handler),
            abort_handler: self.abort_handler.clone(),
            response_handler: self.response_handler.clone(),
            response_error_handler: self.response_error_handler.clone(),
        }
    }
}

impl<Args, T, E: fmt::Display> fmt::Debug for RetryEngine<Args, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("options", &self.options)
            .field("abort_handler", &self.abort_handler.is_some())
            .field("response_handler", &self.response_handler.is_some())
            .field("response_error_handler", &self.response_error_handler.is_some())
            .finish()
    }
}

impl<Args, T, E> RetryEngine<Args, T, E>
where
    Args: Clone + Send + 'static,
    T: Send + 'static,
    E: Into<CrateError> + fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(options: RetryOptions, worker: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            options,
            worker: Arc::new(move |args| worker(args).boxed()),
            delay_handler: Arc::new(backoff::randomized_backoff),
            abort_handler: None,
            response_handler: None,
            response_error_handler: None,
        }
    }

    pub const fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Replaces [`backoff::randomized_backoff`] as the source of sleeps between attempts.
    pub fn with_delay_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RetryState) -> Duration + Send + Sync + 'static,
    {
        self.delay_handler = Arc::new(handler);
        self
    }

    /// Called when an attempt is abandoned for running past `try_timeout`. The next attempt is
    /// not scheduled until the returned future completes.
    pub fn with_abort_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(&RetryError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.abort_handler = Some(Arc::new(move |error| handler(error).boxed()));
        self
    }

    /// Intercepts every successful attempt. `Ok` completes the invocation (possibly with a
    /// transformed value); `Err` is handled like a worker failure.
    pub fn with_response_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T, &RetryState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.response_handler = Some(Arc::new(move |value, state| handler(value, state).boxed()));
        self
    }

    /// Intercepts every failed attempt, replacing the retry decision: `Ok` completes the
    /// invocation with that value and `Err` ends it with [`RetryError::Rejected`]. Without a
    /// handler failed attempts are retried with backoff.
    pub fn with_response_error_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AttemptError<E>, &RetryState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AttemptError<E>>> + Send + 'static,
    {
        self.response_error_handler =
            Some(Arc::new(move |error, state| handler(error, state).boxed()));
        self
    }

    /// Invokes the worker with `args`, retrying as needed.
    pub async fn invoke(&self, args: Args) -> Result<T, RetryError> {
        let options = self.options;
        let mut state = RetryState::new(options);
        let mut last_error: Option<CrateError> = None;

        loop {
            let budget_left = options.total_timeout.saturating_sub(state.elapsed());
            if budget_left.is_zero() {
                RetryExhausted {
                    try_number: state.try_number,
                    timeout: true,
                }
                .emit();
                return TotalTimeoutSnafu { state, last_error }.fail();
            }
            let attempt_budget = budget_left.min(options.try_timeout);

            state.try_start = Some(instant_now());
            let call = (self.worker)(args.clone());
            let outcome: Result<T, AttemptError<E>> = match timeout(attempt_budget, call).await {
                Ok(Ok(value)) => match &self.response_handler {
                    Some(handler) => handler(value, &state)
                        .await
                        .map_err(|error| AttemptError::Worker { error }),
                    None => Ok(value),
                },
                Ok(Err(error)) => Err(AttemptError::Worker { error }),
                Err(_) => TimedOutSnafu {
                    timeout: attempt_budget,
                }
                .fail(),
            };

            let failure = match outcome {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            RetryAttemptFailed {
                try_number: state.try_number,
                timed_out: failure.is_timeout(),
                error: &failure,
            }
            .emit();

            let timed_out_after = match &failure {
                AttemptError::TimedOut { timeout } => Some(*timeout),
                AttemptError::Worker { .. } => None,
            };
            if let (Some(timeout), Some(abort)) = (timed_out_after, &self.abort_handler) {
                let timed_out = AttemptTimeoutSnafu {
                    state: state.clone(),
                    timeout,
                }
                .build();
                abort(&timed_out).await;
            }

            if let Some(handler) = &self.response_error_handler {
                let rejected = match handler(failure, &state).await {
                    Ok(value) => return Ok(value),
                    Err(rejected) => rejected,
                };
                RetryRejected {
                    try_number: state.try_number,
                }
                .emit();
                return Err(rejected.into_boxed()).context(RejectedSnafu { state });
            }
            last_error = Some(failure.into_boxed());

            if options.max_retries.is_some_and(|max| state.retries_made() >= max) {
                RetryExhausted {
                    try_number: state.try_number,
                    timeout: false,
                }
                .emit();
                return MaxRetriesSnafu { state, last_error }.fail();
            }

            let delay = (self.delay_handler)(&state);
            if state.elapsed().saturating_add(delay) > options.total_timeout {
                RetryExhausted {
                    try_number: state.try_number,
                    timeout: true,
                }
                .emit();
                return DelayExceedsBudgetSnafu {
                    state,
                    delay,
                    last_error,
                }
                .fail();
            }

            RetryScheduled {
                try_number: state.try_number,
                delay,
            }
            .emit();
            sleep(delay).await;

            state.try_number += 1;
            state.last_sleep = delay;
        }
    }
}

impl<Args, T, E> Service<Args> for RetryEngine<Args, T, E>
where
    Args: Clone + Send + 'static,
    T: Send + 'static,
    E: Into<CrateError> + fmt::Display + Send + 'static,
{
    type Response = T;
    type Error = RetryError;
    type Future = BoxFuture<'static, Result<T, RetryError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, args: Args) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move { engine.invoke(args).await })
    }
}

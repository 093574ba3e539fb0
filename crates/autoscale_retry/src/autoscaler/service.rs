use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll},
};

use futures::{FutureExt, future::BoxFuture};
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tower::Service;

use super::{
    AutoscalerSettings, BuildError,
    controller::{Admission, Controller, MetricsSnapshot},
    failure::{FailureLogic, FailureVerdict},
};
use crate::{
    completion::{Completer, CompletionError, CompletionHandle, exposed},
    instant_now,
    internal_event::{AutoscalerCallPanicked, AutoscalerInFlight, AutoscalerTooBusy, InternalEvent},
};

/// Identifies one submitted request for the lifetime of its autoscaler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of an [`Autoscaler`].
#[derive(Clone, Debug, Serialize)]
pub struct AutoscalerDiagnostics {
    pub pending_count: usize,
    pub active_count: usize,
    pub metrics: MetricsSnapshot,
    pub settings: AutoscalerSettings,
}

type Worker<Args, T, E> = Arc<dyn Fn(Args) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

struct WorkItem<Args, T, E> {
    id: RequestId,
    args: Args,
    completer: Completer<T, E>,
}

struct State<Args, T, E> {
    controller: Controller,
    pending: VecDeque<WorkItem<Args, T, E>>,
    /// Dispatch time of every in-flight request.
    active: HashMap<RequestId, Instant>,
    next_id: u64,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_generation: u64,
}

struct Inner<Args, T, E> {
    settings: AutoscalerSettings,
    worker: Worker<Args, T, E>,
    failure_logic: Arc<dyn FailureLogic<E>>,
    state: Mutex<State<Args, T, E>>,
}

/// Queues requests for an async backend and runs them with adaptive parallelism.
///
/// Each [`submit_request`](Autoscaler::submit_request) returns a [`CompletionHandle`] that
/// resolves with the backend's value, or rejects with the backend's error when the
/// [`FailureLogic`] says [`FailureVerdict::Fail`]. Requests judged
/// [`FailureVerdict::TooBusy`] are retried transparently, ahead of everything else in the
/// queue.
///
/// Backend calls and heartbeats run as Tokio tasks, so the autoscaler must be used from
/// within a runtime. Dropping every clone of the autoscaler abandons whatever is still
/// queued once in-flight calls finish.
pub struct Autoscaler<Args, T, E> {
    inner: Arc<Inner<Args, T, E>>,
}

impl<Args, T, E> Clone for Autoscaler<Args, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Args, T, E> fmt::Debug for Autoscaler<Args, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autoscaler")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl<Args, T, E> Autoscaler<Args, T, E>
where
    Args: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut, L>(
        settings: AutoscalerSettings,
        worker: F,
        failure_logic: L,
    ) -> Result<Self, BuildError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        L: FailureLogic<E>,
    {
        settings.validate()?;
        let worker: Worker<Args, T, E> = Arc::new(move |args| worker(args).boxed());

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                worker,
                failure_logic: Arc::new(failure_logic),
                state: Mutex::new(State {
                    controller: Controller::new(settings, instant_now()),
                    pending: VecDeque::new(),
                    active: HashMap::new(),
                    next_id: 0,
                    heartbeat: None,
                    heartbeat_generation: 0,
                }),
            }),
        })
    }

    pub fn settings(&self) -> &AutoscalerSettings {
        &self.inner.settings
    }

    /// Queues `args` for the backend and immediately runs a dispatch pass.
    pub fn submit_request(&self, args: Args) -> CompletionHandle<T, E, RequestId> {
        let handle = {
            let mut state = self.inner.lock_state();
            let id = RequestId(state.next_id);
            state.next_id += 1;

            let (completer, handle) = exposed(id);
            state.pending.push_back(WorkItem {
                id,
                args,
                completer,
            });
            trace!(message = "Request queued.", request_id = id.as_u64());
            handle
        };
        self.inner.dispatch(None);
        handle
    }

    pub fn to_diagnostics(&self) -> AutoscalerDiagnostics {
        let state = self.inner.lock_state();
        AutoscalerDiagnostics {
            pending_count: state.pending.len(),
            active_count: state.active.len(),
            metrics: state.controller.snapshot(instant_now()),
            settings: self.inner.settings,
        }
    }

    /// [`to_diagnostics`](Autoscaler::to_diagnostics) as a JSON value.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.to_diagnostics())
    }
}

impl<Args, T, E> Inner<Args, T, E>
where
    Args: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State<Args, T, E>> {
        self.state.lock().expect("autoscaler state mutex poisoned")
    }

    /// One dispatch pass. `heartbeat` carries the generation of the heartbeat that triggered
    /// it; a stale generation makes the pass a no-op.
    fn dispatch(self: &Arc<Self>, heartbeat: Option<u64>) {
        let now = instant_now();
        let mut ready = Vec::new();
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if let Some(generation) = heartbeat {
                if generation != state.heartbeat_generation {
                    return;
                }
                // This task is the one running; let it finish on its own.
                state.heartbeat = None;
            }

            while state.controller.admit(now, state.pending.len()) == Admission::Dispatch {
                let Some(item) = state.pending.pop_front() else {
                    break;
                };
                state.controller.on_dispatch();
                state.active.insert(item.id, now);
                ready.push(item);
            }
            state.controller.finish_pass(now);

            if state.controller.needs_heartbeat(state.pending.len()) {
                self.schedule_heartbeat(state);
            }

            AutoscalerInFlight {
                active: state.controller.active_count(),
                pending: state.pending.len(),
            }
            .emit();
        }

        for item in ready {
            self.start(item);
        }
    }

    fn schedule_heartbeat(self: &Arc<Self>, state: &mut State<Args, T, E>) {
        if let Some(previous) = state.heartbeat.take() {
            previous.abort();
        }
        state.heartbeat_generation += 1;

        let generation = state.heartbeat_generation;
        let delay = self.settings.grow_delay;
        let inner = Arc::downgrade(self);
        state.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.dispatch(Some(generation));
            }
        }));
    }

    fn start(self: &Arc<Self>, item: WorkItem<Args, T, E>) {
        debug!(message = "Dispatching request.", request_id = item.id.as_u64());
        let args = item.args.clone();
        let call = match panic::catch_unwind(AssertUnwindSafe(|| (self.worker)(args))) {
            Ok(call) => call,
            Err(_) => return self.abandon(item),
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => inner.finish(item, result),
                Err(_) => inner.abandon(item),
            }
        });
    }

    /// Frees the slot of a call that panicked. Dropping the completer resolves the handle to
    /// [`CompletionError::Abandoned`].
    fn abandon(self: &Arc<Self>, item: WorkItem<Args, T, E>) {
        self.release(item.id);
        AutoscalerCallPanicked {
            request_id: item.id.as_u64(),
        }
        .emit();
        drop(item);
        self.dispatch(None);
    }

    fn finish(self: &Arc<Self>, item: WorkItem<Args, T, E>, result: Result<T, E>) {
        let now = instant_now();
        let error = match result {
            Ok(value) => {
                self.release(item.id);
                item.completer.fulfill(value);
                self.dispatch(None);
                return;
            }
            Err(error) => error,
        };

        match self.failure_logic.classify(&error) {
            FailureVerdict::Fail => {
                self.release(item.id);
                debug!(message = "Request failed.", request_id = item.id.as_u64());
                item.completer.reject(error);
            }
            FailureVerdict::TooBusy => {
                let mut state = self.lock_state();
                state.controller.on_complete();
                state.active.remove(&item.id);
                let penalized = state.controller.on_too_busy(now);
                AutoscalerTooBusy {
                    request_id: item.id.as_u64(),
                    penalized,
                }
                .emit();
                state.pending.push_front(item);
            }
        }
        self.dispatch(None);
    }

    fn release(&self, id: RequestId) {
        let mut state = self.lock_state();
        state.controller.on_complete();
        state.active.remove(&id);
    }
}

impl<Args, T, E> Drop for Inner<Args, T, E> {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.abort();
            }
        }
    }
}

impl<Args, T, E> Service<Args> for Autoscaler<Args, T, E>
where
    Args: Clone + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Response = T;
    type Error = CompletionError<E>;
    type Future = CompletionHandle<T, E, RequestId>;

    /// Always ready: back-pressure is the queue itself.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, args: Args) -> Self::Future {
        self.submit_request(args)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::future::{self, join_all};
    use tokio::time;
    use tower::ServiceExt;
    use tower_test::mock;

    use super::*;
    use crate::autoscaler::classify_fn;

    type BoxError = crate::Error;

    fn busy_on_message(error: &BoxError) -> FailureVerdict {
        if error.to_string() == "busy" {
            FailureVerdict::TooBusy
        } else {
            FailureVerdict::Fail
        }
    }

    fn settings(min_parallel: usize) -> AutoscalerSettings {
        AutoscalerSettings::builder()
            .min_parallel(min_parallel)
            .grow_delay(Duration::from_millis(1000))
            .busy_grow_delay(Duration::from_millis(2000))
            .build()
    }

    fn mocked(
        settings: AutoscalerSettings,
    ) -> (
        Autoscaler<u32, u32, BoxError>,
        mock::Handle<u32, u32>,
    ) {
        let (svc, handle) = mock::pair::<u32, u32>();
        let autoscaler = Autoscaler::new(
            settings,
            move |n: u32| svc.clone().oneshot(n),
            classify_fn(busy_on_message),
        )
        .unwrap();
        (autoscaler, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn grows_one_step_per_grow_delay_while_saturated() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);
        let autoscaler = Autoscaler::new(
            settings(2),
            move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                future::pending::<Result<u32, BoxError>>()
            },
            classify_fn(busy_on_message),
        )
        .unwrap();

        let _handles: Vec<_> = (0..10).map(|n| autoscaler.submit_request(n)).collect();
        assert_eq!(dispatched.load(Ordering::SeqCst), 2);

        let diagnostics = autoscaler.to_diagnostics();
        assert_eq!(diagnostics.pending_count, 8);
        assert_eq!(diagnostics.active_count, 2);
        assert_eq!(diagnostics.metrics.max_active, 2);

        time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 3);
        assert_eq!(autoscaler.to_diagnostics().metrics.max_active, 3);

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(dispatched.load(Ordering::SeqCst), 4);
        assert_eq!(autoscaler.to_diagnostics().metrics.max_active, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn too_busy_request_goes_back_to_the_front() {
        let (autoscaler, mut handle) = mocked(settings(1));

        let a = autoscaler.submit_request(1);
        let b = autoscaler.submit_request(2);
        assert_eq!(*a.tags(), RequestId(0));
        assert_eq!(*b.tags(), RequestId(1));

        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request, 1);
        send.send_error("busy");

        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request, 1, "requeued request must run before the next in line");
        send.send_response(10);

        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request, 2);
        send.send_response(20);

        assert_eq!(a.await.unwrap(), 10);
        assert_eq!(b.await.unwrap(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_verdict_rejects_with_the_backend_error() {
        let (autoscaler, mut handle) = mocked(settings(1));

        let response = autoscaler.submit_request(7);
        let (_, send) = handle.next_request().await.unwrap();
        send.send_error("boom");

        let error = response.await.unwrap_err().into_rejected().unwrap();
        assert_eq!(error.to_string(), "boom");
        assert_eq!(autoscaler.to_diagnostics().active_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_too_busy_penalizes_once() {
        let (autoscaler, mut handle) = mocked(
            AutoscalerSettings::builder()
                .min_parallel(1)
                .grow_delay(Duration::from_millis(100))
                .busy_grow_delay(Duration::from_millis(1000))
                .build(),
        );

        let _handles: Vec<_> = (0..5).map(|n| autoscaler.submit_request(n)).collect();
        time::sleep(Duration::from_millis(350)).await;
        assert_eq!(autoscaler.to_diagnostics().metrics.max_active, 4);

        let mut in_flight = Vec::new();
        for _ in 0..4 {
            in_flight.push(handle.next_request().await.unwrap());
        }
        for (_, send) in in_flight.drain(..3) {
            send.send_error("busy");
        }
        time::sleep(Duration::from_millis(1)).await;

        let diagnostics = autoscaler.to_diagnostics();
        assert_eq!(diagnostics.metrics.max_active, 3);
        assert!(diagnostics.active_count <= diagnostics.metrics.max_active);
        assert!(diagnostics.metrics.since_too_busy_window_start.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_parallel() {
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let (peak_w, running_w) = (Arc::clone(&peak), Arc::clone(&running));

        let autoscaler = Autoscaler::new(
            AutoscalerSettings::builder()
                .min_parallel(1)
                .max_parallel(3)
                .grow_delay(Duration::from_millis(10))
                .busy_grow_delay(Duration::from_millis(10))
                .build(),
            move |n: u32| {
                let (peak, running) = (Arc::clone(&peak_w), Arc::clone(&running_w));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(n)
                }
            },
            classify_fn(busy_on_message),
        )
        .unwrap();

        let handles: Vec<_> = (0..30).map(|n| autoscaler.submit_request(n)).collect();
        let results = join_all(handles).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(autoscaler.to_diagnostics().metrics.max_active, 3);
    }

    fn panics_on_first_request(
        settings: AutoscalerSettings,
        panic_inside_future: bool,
    ) -> Autoscaler<u32, u32, BoxError> {
        Autoscaler::new(
            settings,
            move |n: u32| {
                if n == 0 && !panic_inside_future {
                    panic!("backend exploded before returning a future");
                }
                async move {
                    time::sleep(Duration::from_millis(10)).await;
                    if n == 0 {
                        panic!("backend exploded mid-call");
                    }
                    Ok::<_, BoxError>(n)
                }
                .boxed()
            },
            classify_fn(busy_on_message),
        )
        .unwrap()
    }

    fn single_slot() -> AutoscalerSettings {
        AutoscalerSettings::builder()
            .min_parallel(1)
            .max_parallel(1)
            .grow_delay(Duration::from_millis(100))
            .busy_grow_delay(Duration::from_millis(100))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_call_releases_its_slot() {
        let autoscaler = panics_on_first_request(single_slot(), true);

        let first = autoscaler.submit_request(0);
        let second = autoscaler.submit_request(1);

        assert!(first.await.unwrap_err().is_abandoned());
        assert_eq!(
            time::timeout(Duration::from_secs(1), second).await.unwrap().unwrap(),
            1
        );
        let diagnostics = autoscaler.to_diagnostics();
        assert_eq!(diagnostics.active_count, 0);
        assert_eq!(diagnostics.pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_worker_call_releases_its_slot() {
        let autoscaler = panics_on_first_request(single_slot(), false);

        let first = autoscaler.submit_request(0);
        let second = autoscaler.submit_request(1);

        assert!(first.await.unwrap_err().is_abandoned());
        assert_eq!(
            time::timeout(Duration::from_secs(1), second).await.unwrap().unwrap(),
            1
        );
        assert_eq!(autoscaler.to_diagnostics().active_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_handle_settles_exactly_once() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (seen_w, calls_w) = (Arc::clone(&seen), Arc::clone(&calls));

        let autoscaler = Autoscaler::new(
            AutoscalerSettings::builder()
                .min_parallel(2)
                .grow_delay(Duration::from_millis(50))
                .busy_grow_delay(Duration::from_millis(200))
                .idle_or_busy_decrease(Duration::from_millis(500))
                .build(),
            move |n: u32| {
                calls_w.fetch_add(1, Ordering::SeqCst);
                let first_try = seen_w.lock().unwrap().insert(n);
                async move {
                    time::sleep(Duration::from_millis(20)).await;
                    if n % 2 == 0 && first_try {
                        Err::<u32, BoxError>("busy".into())
                    } else if n % 5 == 0 {
                        Err("boom".into())
                    } else {
                        Ok(n)
                    }
                }
            },
            classify_fn(busy_on_message),
        )
        .unwrap();

        let handles: Vec<_> = (0..20).map(|n| autoscaler.submit_request(n)).collect();
        let outcomes = join_all(handles.into_iter().map(|h| h.inspect())).await;

        for (id, outcome) in &outcomes {
            let n = id.as_u64() as u32;
            match outcome {
                Ok(value) => assert_eq!(*value, n),
                Err(error) => {
                    assert_eq!(n % 5, 0, "request {} failed unexpectedly", n);
                    assert_eq!(error.to_string(), "boom");
                }
            }
        }
        assert_eq!(outcomes.iter().filter(|(_, o)| o.is_err()).count(), 4);
        // 20 first tries plus one repeat per even request.
        assert_eq!(calls.load(Ordering::SeqCst), 30);

        let diagnostics = autoscaler.to_diagnostics();
        assert_eq!(diagnostics.pending_count, 0);
        assert_eq!(diagnostics.active_count, 0);
        assert!(diagnostics.metrics.max_active >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_autoscaler_schedules_no_heartbeat() {
        let (autoscaler, mut handle) = mocked(settings(2));
        let response = autoscaler.submit_request(1);
        let (_, send) = handle.next_request().await.unwrap();
        send.send_response(1);
        assert_eq!(response.await.unwrap(), 1);

        let state = autoscaler.inner.lock_state();
        assert!(state.heartbeat.is_none());
        assert_eq!(state.heartbeat_generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_passes_keep_a_single_heartbeat() {
        let (autoscaler, _handle) = mocked(settings(1));
        for n in 0..5 {
            let _ = autoscaler.submit_request(n);
        }

        let state = autoscaler.inner.lock_state();
        // Four blocked passes, each replacing the previous heartbeat.
        assert_eq!(state.heartbeat_generation, 4);
        assert!(state.heartbeat.is_some());
    }

    #[test]
    fn runtime_shutdown_abandons_outstanding_requests() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let autoscaler = Autoscaler::new(
            settings(1),
            |_: u32| future::pending::<Result<u32, BoxError>>(),
            classify_fn(busy_on_message),
        )
        .unwrap();

        let (running, queued) = runtime.block_on(async {
            (autoscaler.submit_request(1), autoscaler.submit_request(2))
        });
        drop(autoscaler);
        drop(runtime);

        for handle in [running, queued] {
            let mut handle = tokio_test::task::spawn(handle);
            let outcome = tokio_test::assert_ready!(handle.poll());
            assert!(outcome.unwrap_err().is_abandoned());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_serialize_to_json() {
        let (autoscaler, _handle) = mocked(settings(2));
        let _pending: Vec<_> = (0..3).map(|n| autoscaler.submit_request(n)).collect();

        let json = autoscaler.to_json().unwrap();
        assert_eq!(json["pending_count"], 1);
        assert_eq!(json["active_count"], 2);
        assert_eq!(json["metrics"]["max_active"], 2);
        assert_eq!(json["settings"]["min_parallel"], 2);
        assert_eq!(json["metrics"]["since_last_too_busy"], serde_json::Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn composes_as_a_tower_service() {
        let (autoscaler, mut handle) = mocked(settings(1));

        let call = tokio::spawn(autoscaler.clone().oneshot(5));
        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request, 5);
        send.send_response(50);

        assert_eq!(call.await.unwrap().unwrap(), 50);
    }

    #[test]
    fn rejects_invalid_settings() {
        let result = Autoscaler::new(
            AutoscalerSettings::builder()
                .min_parallel(0)
                .grow_delay(Duration::from_secs(1))
                .busy_grow_delay(Duration::from_secs(1))
                .build(),
            |n: u32| async move { Ok::<_, BoxError>(n) },
            classify_fn(busy_on_message),
        );
        assert_eq!(
            result.unwrap_err(),
            BuildError::MinParallelTooSmall { min_parallel: 0 }
        );
    }
}

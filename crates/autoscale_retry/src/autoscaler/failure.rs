use serde::Serialize;

/// How the autoscaler treats a failed backend call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureVerdict {
    /// Reject the caller's handle with the error, unchanged.
    Fail,
    /// The backend is saturated: requeue the request at the front and back off.
    TooBusy,
}

/// Classifies backend errors for the autoscaler.
pub trait FailureLogic<E>: Send + Sync + 'static {
    fn classify(&self, error: &E) -> FailureVerdict;
}

/// A [`FailureLogic`] backed by a closure. Built with [`classify_fn`].
#[derive(Clone, Copy, Debug)]
pub struct ClassifyFn<F> {
    f: F,
}

pub const fn classify_fn<F>(f: F) -> ClassifyFn<F> {
    ClassifyFn { f }
}

impl<E, F> FailureLogic<E> for ClassifyFn<F>
where
    F: Fn(&E) -> FailureVerdict + Send + Sync + 'static,
{
    fn classify(&self, error: &E) -> FailureVerdict {
        (self.f)(error)
    }
}

/// Treats every error as fatal; the autoscaler then never backs off on its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverBusy;

impl<E> FailureLogic<E> for NeverBusy {
    fn classify(&self, _: &E) -> FailureVerdict {
        FailureVerdict::Fail
    }
}

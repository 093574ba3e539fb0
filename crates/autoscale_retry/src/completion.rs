//! A one-shot result slot whose producer side is handed to whoever finishes the work.
//!
//! [`exposed`] returns a [`Completer`] and a [`CompletionHandle`]. The handle is a future for
//! the caller; the completer is moved into the queue or task that eventually produces the
//! value. `fulfill` and `reject` consume the completer, so a handle settles at most once.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use snafu::Snafu;
use tokio::sync::oneshot;

/// Why a [`CompletionHandle`] resolved without a value.
#[derive(Debug, Snafu)]
pub enum CompletionError<E>
where
    E: fmt::Display,
{
    /// The producer rejected the handle with this error.
    #[snafu(display("{error}"))]
    Rejected { error: E },

    /// The producer was dropped without settling, e.g. its queue was torn down.
    #[snafu(display("completion handle was dropped before it settled"))]
    Abandoned,
}

impl<E: fmt::Display> CompletionError<E> {
    pub fn into_rejected(self) -> Option<E> {
        match self {
            CompletionError::Rejected { error } => Some(error),
            CompletionError::Abandoned => None,
        }
    }

    pub const fn is_abandoned(&self) -> bool {
        matches!(self, CompletionError::Abandoned)
    }
}

fn settled<T, E: fmt::Display>(
    received: Result<Result<T, E>, oneshot::error::RecvError>,
) -> Result<T, CompletionError<E>> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => RejectedSnafu { error }.fail(),
        Err(_) => AbandonedSnafu.fail(),
    }
}

/// Producer half. Settles the paired [`CompletionHandle`] exactly once.
#[derive(Debug)]
pub struct Completer<T, E> {
    tx: oneshot::Sender<Result<T, E>>,
}

impl<T, E> Completer<T, E> {
    /// Resolves the handle with `value`. Returns `false` if nobody is listening anymore.
    pub fn fulfill(self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Rejects the handle with `error`. Returns `false` if nobody is listening anymore.
    pub fn reject(self, error: E) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Whether the consumer half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half: a future resolving to the settled value.
///
/// Callers must await (or otherwise inspect) every handle they receive; a rejection that is
/// never observed is silently lost.
#[pin_project]
#[derive(Debug)]
#[must_use = "a rejected handle that is never awaited loses its error"]
pub struct CompletionHandle<T, E, Tag = ()> {
    #[pin]
    rx: oneshot::Receiver<Result<T, E>>,
    tags: Tag,
}

impl<T, E, Tag> CompletionHandle<T, E, Tag> {
    /// Opaque data attached when the handle was created.
    pub fn tags(&self) -> &Tag {
        &self.tags
    }

}

impl<T, E: fmt::Display, Tag> CompletionHandle<T, E, Tag> {
    /// Awaits the outcome and hands it back together with the tags, without the caller having
    /// to match on a `?`-propagated error.
    pub async fn inspect(self) -> (Tag, Result<T, CompletionError<E>>) {
        let outcome = settled(self.rx.await);
        (self.tags, outcome)
    }
}

impl<T, E: fmt::Display, Tag> Future for CompletionHandle<T, E, Tag> {
    type Output = Result<T, CompletionError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        Poll::Ready(settled(std::task::ready!(this.rx.poll(cx))))
    }
}

/// Creates a linked completer/handle pair carrying `tags`.
pub fn exposed<T, E, Tag>(tags: Tag) -> (Completer<T, E>, CompletionHandle<T, E, Tag>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, CompletionHandle { rx, tags })
}

pub fn exposed_untagged<T, E>() -> (Completer<T, E>, CompletionHandle<T, E>) {
    exposed(())
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Nope;

    impl fmt::Display for Nope {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "nope")
        }
    }

    #[test]
    fn pending_until_fulfilled() {
        let (completer, handle) = exposed::<u32, Nope, &str>("page-1");
        assert_eq!(*handle.tags(), "page-1");

        let mut fut = task::spawn(handle);
        assert_pending!(fut.poll());

        assert!(completer.fulfill(7));
        assert!(fut.is_woken());
        let value = assert_ready!(fut.poll());
        assert_eq!(value.unwrap(), 7);
    }

    #[test]
    fn rejection_carries_error_unchanged() {
        let (completer, handle) = exposed_untagged::<u32, Nope>();
        assert!(completer.reject(Nope));

        let mut fut = task::spawn(handle);
        let err = assert_ready!(fut.poll()).unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(err.into_rejected(), Some(Nope));
    }

    #[test]
    fn dropped_completer_abandons_handle() {
        let (completer, handle) = exposed_untagged::<u32, Nope>();
        drop(completer);

        let mut fut = task::spawn(handle);
        let err = assert_ready!(fut.poll()).unwrap_err();
        assert!(err.is_abandoned());
    }

    #[test]
    fn settling_a_dropped_handle_reports_no_listener() {
        let (completer, handle) = exposed_untagged::<u32, Nope>();
        drop(handle);
        assert!(completer.is_abandoned());
        assert!(!completer.fulfill(1));
    }

    #[tokio::test]
    async fn inspect_returns_tags_with_outcome() {
        let (completer, handle) = exposed::<u32, Nope, u8>(9);
        completer.reject(Nope);

        let (tags, outcome) = handle.inspect().await;
        assert_eq!(tags, 9);
        assert!(matches!(outcome, Err(CompletionError::Rejected { error: Nope })));
    }
}

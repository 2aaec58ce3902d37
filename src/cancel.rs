//! Cancellable deferred results
//!
//! [`CancellableCall`] is the one deferred-result type every decorated call
//! returns: a future that also hands out [`Canceller`]s. The callback-style
//! surface is an adapter over it ([`CancellableCall::spawn_with_callback`]).
//!
//! Cancellation settles the call with [`GaxError::Cancelled`] exactly once.
//! Dropping an in-flight transport future is the transport's cancel hook.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{AbortHandle, Aborted, BoxFuture};
use futures::FutureExt;

use crate::error::{GaxError, Result};

/// Handle that aborts a logical call
#[derive(Clone)]
pub struct Canceller {
    cancel_fn: Arc<dyn Fn() + Send + Sync>,
}

impl Canceller {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            cancel_fn: Arc::new(f),
        }
    }

    /// A handle for calls that already settled.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn from_abort(handle: AbortHandle) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn cancel(&self) {
        (self.cancel_fn)()
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").finish_non_exhaustive()
    }
}

/// A future for one logical call that can be cancelled from elsewhere
#[must_use = "futures do nothing unless polled"]
pub struct CancellableCall<T> {
    future: BoxFuture<'static, Result<T>>,
    canceller: Canceller,
}

impl<T: Send + 'static> CancellableCall<T> {
    pub fn new(future: BoxFuture<'static, Result<T>>, canceller: Canceller) -> Self {
        Self { future, canceller }
    }

    /// Make `future` abortable: cancelling drops it and yields `Cancelled`.
    pub fn abortable<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (future, handle) = futures::future::abortable(future);
        let future = async move {
            match future.await {
                Ok(result) => result,
                Err(Aborted) => Err(GaxError::Cancelled),
            }
        }
        .boxed();
        Self {
            future,
            canceller: Canceller::from_abort(handle),
        }
    }

    /// An already-settled call.
    pub fn ready(result: Result<T>) -> Self {
        Self {
            future: futures::future::ready(result).boxed(),
            canceller: Canceller::noop(),
        }
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel()
    }

    /// Transform the successful output, keeping the same canceller.
    pub fn map<U, F>(self, f: F) -> CancellableCall<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        CancellableCall {
            future: self.future.map(|result| result.map(f)).boxed(),
            canceller: self.canceller,
        }
    }

    /// Callback adapter: drive the call on the runtime and hand the outcome to
    /// `callback`. Returns the raw cancel handle.
    pub fn spawn_with_callback<F>(self, callback: F) -> Canceller
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let canceller = self.canceller.clone();
        let future = self.future;
        tokio::spawn(async move {
            callback(future.await);
        });
        canceller
    }
}

impl<T> Future for CancellableCall<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for CancellableCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableCall").finish_non_exhaustive()
    }
}

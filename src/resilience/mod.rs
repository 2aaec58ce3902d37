//! Resilience layers around the raw unary call: retry and timeout
//!
//! What this module provides
//! - Tower middleware applied per invocation before any bundling, paging or
//!   polling logic sees the call
//!
//! Exports
//! - `RetryLayer` / `Retry`: re-issue attempts that fail with a retryable code,
//!   backing off per `BackoffSettings`, bounded by the total timeout
//! - `TimeoutLayer` / `Timeout`: a single attempt bounded by a fixed timeout
//! - `apply_call_settings`: pick the layer a `CallSettings` asks for
//!
//! Implementation strategy
//! - Retry: clone the inner service per logical call and drive a
//!   `BackoffPolicy`; each attempt gets a deadline from the growing RPC
//!   timeout, clipped to what is left of the total budget
//! - Timeout: `tokio::time::timeout` around the inner future, stamping the
//!   request deadline so the transport can see it too
//!
//! Testing strategy
//! - Fake services that fail in a scripted pattern (E E S) and paused tokio
//!   time to check counts and deadlines

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout, Instant};
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::{CallSettings, RetryOptions};
use crate::error::GaxError;
use crate::retry::{BackoffPolicy, TOTAL_TIMEOUT_MESSAGE};
use crate::unary::{BoxUnaryCall, UnaryRequest};

type CallFuture = Pin<Box<dyn Future<Output = Result<Value, GaxError>> + Send>>;

// ===== Retry =====

#[derive(Debug, Clone)]
pub struct RetryLayer {
    options: RetryOptions,
}

impl RetryLayer {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    options: RetryOptions,
}

impl<S> Service<UnaryRequest> for Retry<S>
where
    S: Service<UnaryRequest, Response = Value, Error = GaxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = GaxError;
    type Future = CallFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: UnaryRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let options = self.options.clone();
        Box::pin(async move {
            let mut policy =
                BackoffPolicy::new(options.backoff.clone()).with_jitter(options.jitter);
            let mut retries: usize = 0;
            loop {
                let now = Instant::now();
                if policy.is_expired(now) {
                    return Err(GaxError::deadline_exceeded(TOTAL_TIMEOUT_MESSAGE));
                }
                let attempt_timeout = policy.next_rpc_timeout(now);
                let mut attempt = req.clone();
                attempt.deadline = attempt_timeout.map(|t| now + t);

                let fut = ServiceExt::ready(&mut inner).await?.call(attempt);
                let result = match attempt_timeout {
                    Some(dur) => match timeout(dur, fut).await {
                        Ok(r) => r,
                        Err(_) => Err(GaxError::deadline_exceeded(format!(
                            "attempt timed out after {:?}",
                            dur
                        ))),
                    },
                    None => fut.await,
                };

                match result {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if !options.is_retryable(&e) {
                            return Err(e);
                        }
                        if options.max_retries.is_some_and(|max| retries >= max) {
                            debug!(retries, error = %e, "retry budget exhausted");
                            return Err(e);
                        }
                        let delay = policy.next_delay();
                        if policy
                            .remaining(Instant::now())
                            .is_some_and(|remaining| delay >= remaining)
                        {
                            return Err(GaxError::deadline_exceeded(TOTAL_TIMEOUT_MESSAGE));
                        }
                        retries += 1;
                        warn!(attempt = retries, code = %e.code(), ?delay, "retrying call");
                        sleep(delay).await;
                    }
                }
            }
        })
    }
}

// ===== Timeout =====

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    dur: Duration,
}

impl TimeoutLayer {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            dur: self.dur,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timeout<S> {
    inner: S,
    dur: Duration,
}

impl<S> Service<UnaryRequest> for Timeout<S>
where
    S: Service<UnaryRequest, Response = Value, Error = GaxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = GaxError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: UnaryRequest) -> Self::Future {
        let dur = self.dur;
        req.deadline = Some(Instant::now() + dur);
        let fut = self.inner.call(req);
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(r) => r,
                Err(_) => Err(GaxError::deadline_exceeded(format!(
                    "call timed out after {:?}",
                    dur
                ))),
            }
        })
    }
}

/// Decorate `inner` the way `settings` ask: retry when retry options are set,
/// otherwise a single attempt bounded by `timeout` if one is set.
pub fn apply_call_settings(inner: BoxUnaryCall, settings: &CallSettings) -> BoxUnaryCall {
    match (&settings.retry, settings.timeout) {
        (Some(retry), _) => BoxUnaryCall::new(RetryLayer::new(retry.clone()).layer(inner)),
        (None, Some(dur)) => BoxUnaryCall::new(TimeoutLayer::new(dur).layer(inner)),
        (None, None) => inner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{create_backoff_settings, BackoffSettings};
    use crate::error::Code;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tower::service_fn;

    fn quick_backoff(total: Option<Duration>) -> BackoffSettings {
        create_backoff_settings(
            Duration::from_millis(10),
            1.0,
            Duration::from_millis(10),
            None,
            1.0,
            None,
            total,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retry_eventually_succeeds() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let svc = service_fn(move |_req: UnaryRequest| {
            let n = count_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GaxError::remote(Code::Unavailable, "try again"))
                } else {
                    Ok::<_, GaxError>(json!({"ok": true}))
                }
            }
        });
        let layer = RetryLayer::new(RetryOptions::new(
            vec![Code::Unavailable],
            quick_backoff(None),
        ));
        let mut svc = layer.layer(svc);
        let resp = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap();
        assert_eq!(resp, json!({"ok": true}));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_non_retryable_code() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let svc = service_fn(move |_req: UnaryRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(GaxError::remote(Code::NotFound, "gone")) }
        });
        let mut svc = RetryLayer::new(RetryOptions::new(
            vec![Code::Unavailable],
            quick_backoff(None),
        ))
        .layer(svc);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_at_total_timeout() {
        let svc = service_fn(|_req: UnaryRequest| async {
            Err::<Value, _>(GaxError::remote(Code::Unavailable, "down"))
        });
        let mut svc = RetryLayer::new(RetryOptions::new(
            vec![Code::Unavailable],
            quick_backoff(Some(Duration::from_millis(55))),
        ))
        .layer(svc);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, GaxError::deadline_exceeded(TOTAL_TIMEOUT_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_respects_max_retries() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let svc = service_fn(move |_req: UnaryRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async { Err::<Value, _>(GaxError::remote(Code::Unavailable, "down")) }
        });
        let options =
            RetryOptions::new(vec![Code::Unavailable], quick_backoff(None)).with_max_retries(2);
        let mut svc = RetryLayer::new(options).layer(svc);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_jitter_stretches_delays_within_bounds() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let svc = service_fn(move |_req: UnaryRequest| {
            let n = count_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GaxError::remote(Code::Unavailable, "try again"))
                } else {
                    Ok::<_, GaxError>(json!({"ok": true}))
                }
            }
        });
        let options =
            RetryOptions::new(vec![Code::Unavailable], quick_backoff(None)).with_jitter(true);
        let mut svc = RetryLayer::new(options).layer(svc);
        let start = Instant::now();
        svc.ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // two 10ms delays, each stretched by at most 3ms
        assert!(elapsed >= Duration::from_millis(20), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(26), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_triggers_error_and_stamps_deadline() {
        let saw_deadline = Arc::new(AtomicUsize::new(0));
        let saw_cl = saw_deadline.clone();
        let svc = service_fn(move |req: UnaryRequest| {
            if req.deadline.is_some() {
                saw_cl.fetch_add(1, Ordering::SeqCst);
            }
            async {
                sleep(Duration::from_millis(20)).await;
                Ok::<_, GaxError>(json!({}))
            }
        });
        let mut svc = TimeoutLayer::new(Duration::from_millis(5)).layer(svc);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(saw_deadline.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn apply_call_settings_without_retry_or_timeout_is_passthrough() {
        let raw = crate::unary::boxed(service_fn(|req: UnaryRequest| async move {
            Ok::<_, GaxError>(req.message)
        }));
        let mut svc = apply_call_settings(raw, &CallSettings::default());
        let resp = svc
            .ready()
            .await
            .unwrap()
            .call(UnaryRequest::new(json!({"echo": 1})))
            .await
            .unwrap();
        assert_eq!(resp, json!({"echo": 1}));
    }
}

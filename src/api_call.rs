//! Composition: raw call + settings + descriptor -> decorated call
//!
//! A descriptor picks at most one behavior (bundling, paging or long-running)
//! and turns the method's [`CallSettings`] into an [`ApiCaller`]. The
//! resulting [`ApiCall`] merges per-call [`CallOptions`], wraps the raw call
//! in the retry/timeout layer those settings ask for, and hands it to the
//! caller. Retry therefore governs each physical attempt while the caller
//! decides how many attempts happen and when.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tower::ServiceExt;
use tracing::debug;

use crate::cancel::{CancellableCall, Canceller};
use crate::config::{CallOptions, CallSettings};
use crate::error::Result;
use crate::resilience::apply_call_settings;
use crate::unary::{BoxUnaryCall, UnaryRequest};

/// Schedules one logical call over an already-decorated unary call
pub trait ApiCaller: Send + Sync + 'static {
    type Output: Send + 'static;

    fn call(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> CancellableCall<Self::Output>;
}

/// Selects the calling behavior of a method
pub trait Descriptor {
    type Caller: ApiCaller;

    fn api_caller(&self, settings: &CallSettings) -> Result<Self::Caller>;
}

/// Plain request/response behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct UnaryDescriptor;

impl Descriptor for UnaryDescriptor {
    type Caller = NormalApiCaller;

    fn api_caller(&self, _settings: &CallSettings) -> Result<NormalApiCaller> {
        Ok(NormalApiCaller)
    }
}

/// Issues exactly one (retried) physical call
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalApiCaller;

impl ApiCaller for NormalApiCaller {
    type Output = Value;

    fn call(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> CancellableCall<Value> {
        CancellableCall::abortable(async move { send_unary(inner, request, &settings).await })
    }
}

/// One physical call carrying the settings' metadata.
pub(crate) async fn send_unary(
    inner: BoxUnaryCall,
    request: Value,
    settings: &CallSettings,
) -> Result<Value> {
    let req = UnaryRequest::new(request).with_metadata(settings.metadata.clone());
    inner.oneshot(req).await
}

/// A decorated call, cheap to clone
pub struct ApiCall<C> {
    raw: BoxUnaryCall,
    settings: CallSettings,
    caller: Arc<C>,
}

impl<C> Clone for ApiCall<C> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            settings: self.settings.clone(),
            caller: self.caller.clone(),
        }
    }
}

impl<C> fmt::Debug for ApiCall<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCall")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<C: ApiCaller> ApiCall<C> {
    /// Invoke the call. The returned future can be cancelled through
    /// [`CancellableCall::cancel`].
    pub fn call(&self, request: Value, options: CallOptions) -> CancellableCall<C::Output> {
        let (inner, settings) = self.prepare(&options);
        self.caller.call(inner, request, settings)
    }

    /// Callback form: the outcome goes to `callback`, the cancel handle is
    /// returned. Must be called within a Tokio runtime.
    pub fn call_with_callback<F>(&self, request: Value, options: CallOptions, callback: F) -> Canceller
    where
        F: FnOnce(Result<C::Output>) + Send + 'static,
    {
        self.call(request, options).spawn_with_callback(callback)
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    pub fn caller(&self) -> &C {
        &self.caller
    }

    /// Effective settings and the decorated unary call for one invocation.
    pub(crate) fn prepare(&self, options: &CallOptions) -> (BoxUnaryCall, CallSettings) {
        let settings = self.settings.merge(options);
        let inner = apply_call_settings(self.raw.clone(), &settings);
        (inner, settings)
    }
}

/// Build a decorated call from a raw unary call, method settings and a
/// descriptor.
pub fn create_api_call<D: Descriptor>(
    raw: BoxUnaryCall,
    settings: CallSettings,
    descriptor: &D,
) -> Result<ApiCall<D::Caller>> {
    let caller = descriptor.api_caller(&settings)?;
    debug!(
        caller = std::any::type_name::<D::Caller>(),
        retry = settings.retry.is_some(),
        "created api call"
    );
    Ok(ApiCall {
        raw,
        settings,
        caller: Arc::new(caller),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryOptions;
    use crate::error::{Code, GaxError};
    use crate::unary::boxed;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::service_fn;

    fn echo() -> BoxUnaryCall {
        boxed(service_fn(|req: UnaryRequest| async move {
            Ok::<_, GaxError>(json!({
                "echo": req.message,
                "metadata": req.metadata,
            }))
        }))
    }

    #[tokio::test]
    async fn unary_call_forwards_request_and_metadata() {
        let settings = CallSettings {
            metadata: [("x-goog-api-client".to_string(), "gax".to_string())].into(),
            ..Default::default()
        };
        let call = create_api_call(echo(), settings, &UnaryDescriptor).unwrap();
        let resp = call
            .call(json!({"a": 1}), CallOptions::new().metadata("extra", "1"))
            .await
            .unwrap();
        assert_eq!(resp["echo"], json!({"a": 1}));
        assert_eq!(resp["metadata"]["x-goog-api-client"], json!("gax"));
        assert_eq!(resp["metadata"]["extra"], json!("1"));
    }

    #[tokio::test]
    async fn unary_caller_future_is_spawnable() {
        let pending = {
            let settings = CallSettings {
                metadata: [("k".to_string(), "v".to_string())].into(),
                ..Default::default()
            };
            NormalApiCaller.call(echo(), json!({"c": 3}), settings)
        };
        let resp = tokio::spawn(pending).await.unwrap().unwrap();
        assert_eq!(resp["echo"], json!({"c": 3}));
        assert_eq!(resp["metadata"]["k"], json!("v"));
    }

    #[tokio::test]
    async fn callback_form_delivers_result() {
        let call = create_api_call(echo(), CallSettings::default(), &UnaryDescriptor).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _canceller = call.call_with_callback(json!({"b": 2}), CallOptions::new(), move |r| {
            let _ = tx.send(r);
        });
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp["echo"], json!({"b": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_retry_override_applies() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let raw = boxed(service_fn(move |_req: UnaryRequest| {
            let n = count_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(GaxError::remote(Code::Unavailable, "flaky"))
                } else {
                    Ok::<_, GaxError>(json!({"n": n}))
                }
            }
        }));
        let call = create_api_call(raw, CallSettings::default(), &UnaryDescriptor).unwrap();
        let retry = RetryOptions::new(
            vec![Code::Unavailable],
            crate::config::create_backoff_settings(
                Duration::from_millis(1),
                1.0,
                Duration::from_millis(1),
                None,
                1.0,
                None,
                None,
            ),
        );
        let resp = call
            .call(json!({}), CallOptions::new().retry(retry))
            .await
            .unwrap();
        assert_eq!(resp, json!({"n": 1}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_flight_unary_call() {
        let raw = boxed(service_fn(|_req: UnaryRequest| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, GaxError>(json!({}))
        }));
        let call = create_api_call(raw, CallSettings::default(), &UnaryDescriptor).unwrap();
        let pending = call.call(json!({}), CallOptions::new());
        let canceller = pending.canceller();
        let handle = tokio::spawn(pending);
        tokio::task::yield_now().await;
        canceller.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }
}

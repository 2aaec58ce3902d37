//! Long-running operations: poll an accepted operation to completion
//!
//! What this module provides
//! - Operation wire types (`OperationProto`, `AnyPayload`, `RpcStatus`)
//! - `OperationsClient`: the `get_operation` / `cancel_operation` pair the
//!   controller polls and cancels through
//! - `LongRunningDescriptor` + `LongRunningApiCaller`: turn the initial
//!   response of a call into an [`Operation`]
//! - [`Operation`]: pollable, cancellable handle publishing lifecycle events
//!
//! Implementation strategy
//! - The operation is an explicit state machine (`Pending` then one of
//!   `Succeeded`, `Failed`, `Cancelled`) behind a mutex, with a separate async
//!   gate so only one poll is ever in flight
//! - A single polling task starts on first subscription and publishes
//!   `OperationEvent`s to every subscriber channel
//! - Dropping the in-flight `get_operation` future is the cancel hook for the
//!   poll RPC
//!
//! Testing strategy
//! - A scripted in-memory operations client counts polls, cancel calls and
//!   dropped polls; paused Tokio time drives backoff and total timeouts

mod operation;

pub use operation::{Operation, OperationEvent, OperationSnapshot, OperationStatus};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api_call::{send_unary, ApiCaller, Descriptor};
use crate::cancel::CancellableCall;
use crate::config::CallSettings;
use crate::error::{Code, GaxError, Result};
use crate::unary::BoxUnaryCall;

/// A packed message: type URL plus encoded bytes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnyPayload {
    pub type_url: String,
    #[serde(default)]
    pub value: Vec<u8>,
}

impl AnyPayload {
    pub fn new(type_url: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// Remote status carried by a failed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: Code,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Vec<AnyPayload>,
}

impl From<&RpcStatus> for GaxError {
    fn from(status: &RpcStatus) -> Self {
        GaxError::remote(status.code, status.message.clone())
    }
}

/// Snapshot of a remote operation as returned by the server
///
/// At most one of `error` and `response` is meaningful; `error` wins when both
/// are set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationProto {
    pub name: String,
    #[serde(default)]
    pub metadata: Option<AnyPayload>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<RpcStatus>,
    #[serde(default)]
    pub response: Option<AnyPayload>,
}

impl OperationProto {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, metadata: AnyPayload) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn succeeded(mut self, response: AnyPayload) -> Self {
        self.done = true;
        self.error = None;
        self.response = Some(response);
        self
    }

    pub fn failed(mut self, code: Code, message: impl Into<String>) -> Self {
        self.done = true;
        self.response = None;
        self.error = Some(RpcStatus {
            code,
            message: message.into(),
            details: Vec::new(),
        });
        self
    }
}

/// Decodes an [`AnyPayload`] into a JSON value
pub type AnyDecoder = Arc<dyn Fn(&AnyPayload) -> Result<Value> + Send + Sync>;

/// Decoder for payloads whose bytes are JSON.
pub fn json_any_decoder() -> AnyDecoder {
    Arc::new(|payload: &AnyPayload| {
        serde_json::from_slice(&payload.value).map_err(|e| GaxError::Decode {
            message: format!("{}: {}", payload.type_url, e),
        })
    })
}

/// Operations service used to poll and cancel
#[async_trait]
pub trait OperationsClient: Send + Sync + 'static {
    async fn get_operation(&self, name: &str) -> Result<OperationProto>;

    async fn cancel_operation(&self, name: &str) -> Result<()>;
}

/// Long-running behavior of a method
#[derive(Clone)]
pub struct LongRunningDescriptor {
    pub operations_client: Arc<dyn OperationsClient>,
    pub response_decoder: AnyDecoder,
    pub metadata_decoder: AnyDecoder,
}

impl fmt::Debug for LongRunningDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongRunningDescriptor").finish_non_exhaustive()
    }
}

impl LongRunningDescriptor {
    pub fn new(
        operations_client: Arc<dyn OperationsClient>,
        response_decoder: AnyDecoder,
        metadata_decoder: AnyDecoder,
    ) -> Self {
        Self {
            operations_client,
            response_decoder,
            metadata_decoder,
        }
    }
}

impl Descriptor for LongRunningDescriptor {
    type Caller = LongRunningApiCaller;

    fn api_caller(&self, _settings: &CallSettings) -> Result<LongRunningApiCaller> {
        Ok(LongRunningApiCaller {
            descriptor: self.clone(),
        })
    }
}

/// Sends the initial call and wraps its response in an [`Operation`]
///
/// Resolves to the operation and the raw initial response.
#[derive(Debug, Clone)]
pub struct LongRunningApiCaller {
    descriptor: LongRunningDescriptor,
}

impl ApiCaller for LongRunningApiCaller {
    type Output = (Operation, Value);

    fn call(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> CancellableCall<(Operation, Value)> {
        let descriptor = self.descriptor.clone();
        CancellableCall::abortable(async move {
            let raw = send_unary(inner, request, &settings).await?;
            let proto: OperationProto = serde_json::from_value(raw.clone())?;
            let backoff = settings.longrunning.clone().unwrap_or_default();
            let operation = Operation::new(proto, descriptor, backoff)?;
            Ok((operation, raw))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_proto_from_json() {
        let raw = json!({
            "name": "operations/1",
            "done": true,
            "error": {"code": 5, "message": "missing"},
        });
        let proto: OperationProto = serde_json::from_value(raw).unwrap();
        assert!(proto.done);
        assert_eq!(proto.error.as_ref().unwrap().code, Code::NotFound);
        assert_eq!(proto.metadata, None);
        let err: GaxError = proto.error.as_ref().unwrap().into();
        assert_eq!(err, GaxError::remote(Code::NotFound, "missing"));
    }

    #[test]
    fn builders_keep_result_exclusive() {
        let op = OperationProto::pending("op")
            .failed(Code::Internal, "boom")
            .succeeded(AnyPayload::new("t", b"ok".to_vec()));
        assert!(op.error.is_none());
        assert!(op.response.is_some());
    }

    #[test]
    fn json_decoder_reports_type_url() {
        let decoder = json_any_decoder();
        assert_eq!(
            decoder(&AnyPayload::new("t", br#"{"a":1}"#.to_vec())).unwrap(),
            json!({"a": 1})
        );
        let err = decoder(&AnyPayload::new("type.googleapis.com/x", b"{".to_vec())).unwrap_err();
        assert!(err.to_string().contains("type.googleapis.com/x"));
    }
}

//! The unary transport boundary
//!
//! Every decorated call bottoms out in a [`tower::Service`] that takes one
//! [`UnaryRequest`] and resolves to one JSON response. Dropping the returned
//! future is how an in-flight physical call gets cancelled.

use serde_json::Value;
use tokio::time::Instant;
use tower::util::BoxCloneService;
use tower::Service;

use crate::config::Metadata;
use crate::error::GaxError;

/// One physical request handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryRequest {
    pub message: Value,
    pub metadata: Metadata,

    /// Absolute deadline of this attempt, if any
    pub deadline: Option<Instant>,
}

impl UnaryRequest {
    pub fn new(message: Value) -> Self {
        Self {
            message,
            metadata: Metadata::new(),
            deadline: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Type-erased raw unary call
pub type BoxUnaryCall = BoxCloneService<UnaryRequest, Value, GaxError>;

/// Erase a concrete transport service.
pub fn boxed<S>(service: S) -> BoxUnaryCall
where
    S: Service<UnaryRequest, Response = Value, Error = GaxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    BoxCloneService::new(service)
}

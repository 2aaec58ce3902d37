//! # Tower GAX
//!
//! Call shaping for generated RPC clients, built on Tower services.
//! A raw unary call (one request in, one response out) is decorated into one
//! of three higher-level behaviors, each keeping the same invocation contract:
//! a cancellable future, or a callback plus a cancel handle.
//!
//! ## Core Concepts
//!
//! - **Bundling**: coalesce many small calls that share a bundle id into fewer
//!   physical calls, flushed on count, byte or delay thresholds
//! - **Long-running operations**: poll an accepted operation with backoff until
//!   it finishes, publishing progress along the way
//! - **Paged iteration**: accumulate every page, step page by page, or stream
//!   resources lazily
//! - **Layers**: retry and timeout govern each physical attempt underneath
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower::service_fn;
//! use tower_gax::{
//!     create_api_call, unary, CallOptions, CallSettings, GaxError, PageDescriptor,
//!     UnaryRequest,
//! };
//!
//! # async fn example() -> Result<(), GaxError> {
//! // Any Tower service from UnaryRequest to JSON works as a transport
//! let transport = unary::boxed(service_fn(|req: UnaryRequest| async move {
//!     let token = req.message["pageToken"].as_u64().unwrap_or(0);
//!     let next = if token < 6 { token + 3 } else { 0 };
//!     Ok::<_, GaxError>(serde_json::json!({
//!         "items": [token, token + 1, token + 2],
//!         "nextPageToken": next,
//!     }))
//! }));
//!
//! let descriptor = PageDescriptor::new("pageToken", "nextPageToken", "items");
//! let list = create_api_call(transport, CallSettings::default(), &descriptor)?;
//!
//! let everything = list
//!     .call(serde_json::json!({}), CallOptions::new())
//!     .await?
//!     .into_resources();
//! println!("{} items", everything.len());
//! # Ok(())
//! # }
//! ```

pub mod api_call;
pub mod bundling;
pub mod cancel;
pub mod config;
pub mod error;
pub mod field_path;
pub mod longrunning;
pub mod paging;
pub mod resilience;
pub mod retry;
pub mod unary;
pub mod warnings;

// Public re-exports for convenience
pub use api_call::{
    create_api_call, ApiCall, ApiCaller, Descriptor, NormalApiCaller, UnaryDescriptor,
};
pub use bundling::{
    compute_bundle_id, BundleApiCaller, BundleDescriptor, BundleExecutor,
};
pub use cancel::{CancellableCall, Canceller};
pub use config::{
    create_backoff_settings, create_default_backoff_settings, BackoffSettings, BundleOptions,
    CallOptions, CallSettings, Metadata, RetryOptions,
};
pub use error::{Code, GaxError, Result};
pub use field_path::FieldPath;
pub use longrunning::{
    AnyDecoder, AnyPayload, LongRunningApiCaller, LongRunningDescriptor, Operation,
    OperationEvent, OperationProto, OperationSnapshot, OperationStatus, OperationsClient,
    RpcStatus,
};
pub use paging::{Page, PageDescriptor, PagedApiCaller, PagedResponse, ResourceStream};
pub use resilience::{RetryLayer, TimeoutLayer};
pub use retry::BackoffPolicy;
pub use unary::{BoxUnaryCall, UnaryRequest};
pub use warnings::{AdvisorySink, Warnings};

// Re-export Tower traits that users need
pub use tower::{Layer, Service, ServiceExt};

//! Request bundling: coalesce small calls that share a bundle id
//!
//! What this module provides
//! - `BundleDescriptor`: which request fields discriminate bundles, which
//!   repeated field is merged, which response field is split back, and how
//!   element sizes are estimated
//! - `BundleExecutor`: per-key tasks flushed on count, byte or delay
//!   thresholds, bounded by hard limits, with per-entry cancellation
//! - `BundleApiCaller`: the `ApiCaller` that routes calls through an executor
//!
//! Implementation strategy
//! - Bundle id: the JSON array of resolved discriminator values. A missing top
//!   level field means the call cannot be bundled and goes out on its own; a
//!   path failing further down contributes `null`, and an id made only of
//!   such failures is no id at all
//! - Demultiplexing: with a subresponse field, each entry receives its slice
//!   of that array in insertion order; otherwise every entry receives the
//!   whole response
//!
//! Testing strategy
//! - Fake transports built with `tower::service_fn` record physical requests;
//!   paused Tokio time drives the delay threshold

mod executor;
mod task;

pub use executor::BundleExecutor;
pub use task::EntryId;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::api_call::{send_unary, ApiCaller, Descriptor};
use crate::cancel::CancellableCall;
use crate::config::CallSettings;
use crate::error::Result;
use crate::field_path::{FieldPath, Resolution};
use crate::unary::BoxUnaryCall;

/// Estimates the encoded size of one element
pub type ByteLengthFn = Arc<dyn Fn(&Value) -> usize + Send + Sync>;

/// Byte size of an element's compact JSON encoding.
pub fn json_byte_length(value: &Value) -> usize {
    serde_json::to_string(value).map_or(0, |s| s.len())
}

/// How a bundled method merges and splits its calls
#[derive(Clone)]
pub struct BundleDescriptor {
    /// Repeated request field whose elements are concatenated
    pub bundled_field: String,
    pub request_discriminator_fields: Vec<FieldPath>,
    /// Repeated response field split back per entry
    pub subresponse_field: Option<String>,
    byte_length_fn: ByteLengthFn,
}

impl fmt::Debug for BundleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleDescriptor")
            .field("bundled_field", &self.bundled_field)
            .field(
                "request_discriminator_fields",
                &self
                    .request_discriminator_fields
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            )
            .field("subresponse_field", &self.subresponse_field)
            .finish_non_exhaustive()
    }
}

impl BundleDescriptor {
    /// Parse the discriminator paths up front; an invalid path is rejected
    /// here rather than at call time.
    pub fn new(
        bundled_field: impl Into<String>,
        request_discriminator_fields: &[&str],
        subresponse_field: Option<&str>,
    ) -> Result<Self> {
        let fields = request_discriminator_fields
            .iter()
            .map(|path| FieldPath::parse(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bundled_field: bundled_field.into(),
            request_discriminator_fields: fields,
            subresponse_field: subresponse_field.map(str::to_string),
            byte_length_fn: Arc::new(json_byte_length),
        })
    }

    pub fn with_byte_length_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> usize + Send + Sync + 'static,
    {
        self.byte_length_fn = Arc::new(f);
        self
    }

    pub fn byte_length(&self, element: &Value) -> usize {
        (self.byte_length_fn)(element)
    }
}

/// Bundle id of `request`, or `None` when it cannot be bundled.
pub fn compute_bundle_id(request: &Value, discriminator_fields: &[FieldPath]) -> Option<String> {
    if discriminator_fields.is_empty() {
        return None;
    }
    let mut ids = Vec::with_capacity(discriminator_fields.len());
    let mut resolved = false;
    for path in discriminator_fields {
        match path.resolve(request) {
            Resolution::MissingRoot => return None,
            Resolution::Missing => ids.push(Value::Null),
            Resolution::Found(value) => {
                resolved = true;
                ids.push(value.clone());
            }
        }
    }
    // at least one discriminator must resolve to a value
    if !resolved {
        return None;
    }
    serde_json::to_string(&ids).ok()
}

/// Split a bundled response back per entry. `counts` holds each entry's
/// element count in insertion order.
pub fn slice_for_response(
    response: &Value,
    counts: &[usize],
    subresponse_field: Option<&str>,
) -> Vec<Value> {
    let items = subresponse_field.and_then(|field| {
        response
            .get(field)
            .and_then(Value::as_array)
            .map(|items| (field, items))
    });
    let Some((field, items)) = items else {
        return counts.iter().map(|_| response.clone()).collect();
    };

    let mut offset = 0;
    counts
        .iter()
        .map(|count| {
            let end = (offset + count).min(items.len());
            let start = offset.min(end);
            offset += count;
            let mut slice = response.clone();
            if let Value::Object(map) = &mut slice {
                map.insert(field.to_string(), Value::Array(items[start..end].to_vec()));
            }
            slice
        })
        .collect()
}

impl Descriptor for BundleDescriptor {
    type Caller = BundleApiCaller;

    fn api_caller(&self, settings: &CallSettings) -> Result<BundleApiCaller> {
        let executor = match &settings.bundle_options {
            Some(options) => {
                options.validate()?;
                Some(BundleExecutor::new(options.clone(), self.clone()))
            }
            None => None,
        };
        Ok(BundleApiCaller { executor })
    }
}

/// Routes calls through a shared [`BundleExecutor`]
///
/// Without bundle options, or when a call sets `is_bundling = false`, the call
/// is sent on its own.
#[derive(Debug, Clone)]
pub struct BundleApiCaller {
    executor: Option<BundleExecutor>,
}

impl BundleApiCaller {
    pub fn new(executor: BundleExecutor) -> Self {
        Self {
            executor: Some(executor),
        }
    }

    pub fn executor(&self) -> Option<&BundleExecutor> {
        self.executor.as_ref()
    }
}

impl ApiCaller for BundleApiCaller {
    type Output = Value;

    fn call(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> CancellableCall<Value> {
        match &self.executor {
            Some(executor) if settings.is_bundling => {
                executor.schedule(inner, request, settings.metadata)
            }
            _ => CancellableCall::abortable(async move {
                send_unary(inner, request, &settings).await
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paths(fields: &[&str]) -> Vec<FieldPath> {
        fields.iter().map(|f| FieldPath::parse(f).unwrap()).collect()
    }

    #[test]
    fn bundle_id_from_discriminators() {
        let request = json!({"field1": "dummy_value", "field2": 42, "inner": {"field1": "dotty"}});
        assert_eq!(
            compute_bundle_id(&request, &paths(&["field1"])).as_deref(),
            Some(r#"["dummy_value"]"#)
        );
        assert_eq!(
            compute_bundle_id(&request, &paths(&["field1", "field2"])).as_deref(),
            Some(r#"["dummy_value",42]"#)
        );
        assert_eq!(
            compute_bundle_id(&request, &paths(&["inner.field1"])).as_deref(),
            Some(r#"["dotty"]"#)
        );
    }

    #[test]
    fn bundle_id_null_for_nested_miss_none_for_missing_root() {
        let request = json!({"field1": "v", "inner": {}});
        assert_eq!(
            compute_bundle_id(&request, &paths(&["field1", "inner.field3"])).as_deref(),
            Some(r#"["v",null]"#)
        );
        assert_eq!(compute_bundle_id(&request, &paths(&["field1", "field3"])), None);
        assert_eq!(compute_bundle_id(&request, &[]), None);
    }

    #[test]
    fn nested_miss_alone_is_unbundled() {
        let outer = json!({"inner": {"field1": "dotty", "field2": "dotty"}, "field1": "dotty"});
        assert_eq!(compute_bundle_id(&outer, &paths(&["inner.field3"])), None);
        assert_eq!(
            compute_bundle_id(&outer, &paths(&["inner.field3", "inner.field1"])).as_deref(),
            Some(r#"[null,"dotty"]"#)
        );
    }

    #[test]
    fn composite_with_absent_second_field_is_unbundled() {
        let request = json!({"field1": "dummy_value"});
        assert_eq!(compute_bundle_id(&request, &paths(&["field1", "field2"])), None);
    }

    #[test]
    fn present_null_differs_from_value() {
        let with_null = json!({"field1": null});
        let with_value = json!({"field1": "x"});
        let fields = paths(&["field1"]);
        assert_eq!(
            compute_bundle_id(&with_null, &fields).as_deref(),
            Some("[null]")
        );
        assert_ne!(
            compute_bundle_id(&with_null, &fields),
            compute_bundle_id(&with_value, &fields)
        );
    }

    #[test]
    fn slices_subresponse_in_order() {
        let response = json!({"field1": [1, 2, 3, 4, 5, 6], "other": "x"});
        let slices = slice_for_response(&response, &[2, 1, 3], Some("field1"));
        assert_eq!(slices[0], json!({"field1": [1, 2], "other": "x"}));
        assert_eq!(slices[1], json!({"field1": [3], "other": "x"}));
        assert_eq!(slices[2], json!({"field1": [4, 5, 6], "other": "x"}));
    }

    #[test]
    fn whole_response_without_subresponse_field() {
        let response = json!({"ok": true});
        let slices = slice_for_response(&response, &[1, 2], None);
        assert_eq!(slices, vec![response.clone(), response.clone()]);

        // a subresponse field that is not an array is shared as well
        let odd = json!({"field1": "scalar"});
        assert_eq!(
            slice_for_response(&odd, &[1, 1], Some("field1")),
            vec![odd.clone(), odd.clone()]
        );
    }

    #[test]
    fn short_subresponse_truncates_slices() {
        let response = json!({"field1": [1]});
        let slices = slice_for_response(&response, &[1, 2], Some("field1"));
        assert_eq!(slices[0], json!({"field1": [1]}));
        assert_eq!(slices[1], json!({"field1": []}));
    }

    #[test]
    fn descriptor_rejects_bad_paths() {
        assert!(BundleDescriptor::new("field1", &["a..b"], None).is_err());
        let descriptor = BundleDescriptor::new("field1", &["field2"], Some("field1"))
            .unwrap()
            .with_byte_length_fn(|_| 4);
        assert_eq!(descriptor.byte_length(&json!("anything")), 4);
        assert_eq!(json_byte_length(&json!(1)), 1);
    }

    #[test]
    fn api_caller_validates_bundle_options() {
        let descriptor = BundleDescriptor::new("field1", &["field2"], None).unwrap();
        let settings = CallSettings {
            bundle_options: Some(Default::default()),
            ..Default::default()
        };
        assert!(descriptor.api_caller(&settings).is_err());
        let caller = descriptor.api_caller(&CallSettings::default()).unwrap();
        assert!(caller.executor().is_none());
    }
}

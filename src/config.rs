//! Configuration for decorated calls
//!
//! Provides the per-method defaults ([`CallSettings`]), the per-call overrides
//! ([`CallOptions`]) and the backoff/bundling knobs both of them carry.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Code, GaxError, Result};

/// Request metadata (headers) forwarded to the transport untouched.
pub type Metadata = BTreeMap<String, String>;

/// Backoff configuration shared by retries and long-running polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// Delay before the first retry or poll round
    pub initial_retry_delay: Duration,

    /// Factor applied to the delay after every round
    pub retry_delay_multiplier: f64,

    /// Upper bound for the delay
    pub max_retry_delay: Duration,

    /// Timeout of the first attempt; `None` leaves attempts unbounded
    pub initial_rpc_timeout: Option<Duration>,

    /// Factor applied to the attempt timeout after every attempt
    pub rpc_timeout_multiplier: f64,

    /// Upper bound for the attempt timeout
    pub max_rpc_timeout: Option<Duration>,

    /// Wall-clock budget for the whole logical call; `None` means no limit
    pub total_timeout: Option<Duration>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        create_default_backoff_settings()
    }
}

/// Build backoff settings from explicit values.
pub fn create_backoff_settings(
    initial_retry_delay: Duration,
    retry_delay_multiplier: f64,
    max_retry_delay: Duration,
    initial_rpc_timeout: Option<Duration>,
    rpc_timeout_multiplier: f64,
    max_rpc_timeout: Option<Duration>,
    total_timeout: Option<Duration>,
) -> BackoffSettings {
    BackoffSettings {
        initial_retry_delay,
        retry_delay_multiplier,
        max_retry_delay,
        initial_rpc_timeout,
        rpc_timeout_multiplier,
        max_rpc_timeout,
        total_timeout,
    }
}

/// Polling defaults for long-running operations: 100ms, x1.3, capped at 60s,
/// no total timeout.
pub fn create_default_backoff_settings() -> BackoffSettings {
    create_backoff_settings(
        Duration::from_millis(100),
        1.3,
        Duration::from_millis(60_000),
        None,
        1.0,
        None,
        None,
    )
}

/// Retry configuration: which codes are transient, and how to back off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub retry_codes: Vec<Code>,
    pub backoff: BackoffSettings,

    /// Optional cap on retries on top of the total timeout
    #[serde(default)]
    pub max_retries: Option<usize>,

    /// Stretch each retry delay by a random 0-30%
    #[serde(default)]
    pub jitter: bool,
}

impl RetryOptions {
    pub fn new(retry_codes: Vec<Code>, backoff: BackoffSettings) -> Self {
        Self {
            retry_codes,
            backoff,
            max_retries: None,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Whether an error should be retried under these options. Only remote
    /// statuses and attempt timeouts qualify; local rejections and
    /// cancellations never do.
    pub fn is_retryable(&self, error: &GaxError) -> bool {
        match error {
            GaxError::Remote { .. } | GaxError::DeadlineExceeded { .. } => {
                self.retry_codes.contains(&error.code())
            }
            _ => false,
        }
    }
}

/// Bundling thresholds and limits
///
/// Thresholds trigger a flush once reached. Limits are hard caps: a single
/// request over a limit is rejected, and a running total that would reach a
/// limit flushes the pending bundle first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleOptions {
    pub delay_threshold: Option<Duration>,
    pub element_count_threshold: Option<usize>,
    pub element_count_limit: Option<usize>,
    pub request_byte_threshold: Option<usize>,
    pub request_byte_limit: Option<usize>,
}

impl BundleOptions {
    /// Reject configurations that could never flush on their own.
    pub fn validate(&self) -> Result<()> {
        let has_delay = self.delay_threshold.is_some_and(|d| !d.is_zero());
        let has_count = self.element_count_threshold.is_some_and(|n| n > 0);
        let has_bytes = self.request_byte_threshold.is_some_and(|n| n > 0);
        if !(has_delay || has_count || has_bytes) {
            return Err(GaxError::invalid_argument(
                "one of delay_threshold, element_count_threshold or request_byte_threshold must be set",
            ));
        }
        if let (Some(threshold), Some(limit)) =
            (self.element_count_threshold, self.element_count_limit)
        {
            if limit > 0 && threshold > limit {
                return Err(GaxError::invalid_argument(format!(
                    "element_count_threshold {} exceeds element_count_limit {}",
                    threshold, limit
                )));
            }
        }
        if let (Some(threshold), Some(limit)) =
            (self.request_byte_threshold, self.request_byte_limit)
        {
            if limit > 0 && threshold > limit {
                return Err(GaxError::invalid_argument(format!(
                    "request_byte_threshold {} exceeds request_byte_limit {}",
                    threshold, limit
                )));
            }
        }
        Ok(())
    }
}

/// Per-method call defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Single-attempt timeout used when no retry options are configured
    pub timeout: Option<Duration>,

    /// Retry configuration for every physical attempt
    pub retry: Option<RetryOptions>,

    /// Accumulate every page (paged calls only)
    pub auto_paginate: bool,

    /// Token to seed the first page request with
    pub page_token: Option<Value>,

    /// Cap on the number of resources returned (paged calls only)
    pub max_results: Option<usize>,

    /// Bundling thresholds (bundled calls only)
    pub bundle_options: Option<BundleOptions>,

    /// Set to false to send a bundleable call on its own
    pub is_bundling: bool,

    /// Polling backoff for long-running operations
    pub longrunning: Option<BackoffSettings>,

    /// Metadata attached to every physical call
    pub metadata: Metadata,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: None,
            auto_paginate: true,
            page_token: None,
            max_results: None,
            bundle_options: None,
            is_bundling: true,
            longrunning: None,
            metadata: Metadata::new(),
        }
    }
}

impl CallSettings {
    /// Effective settings of one invocation: `options` override `self` field by
    /// field, metadata entries are merged.
    pub fn merge(&self, options: &CallOptions) -> CallSettings {
        let mut merged = self.clone();
        if let Some(timeout) = options.timeout {
            merged.timeout = Some(timeout);
        }
        if let Some(retry) = &options.retry {
            merged.retry = Some(retry.clone());
        }
        if let Some(auto_paginate) = options.auto_paginate {
            merged.auto_paginate = auto_paginate;
        }
        if let Some(token) = &options.page_token {
            merged.page_token = Some(token.clone());
        }
        if let Some(max_results) = options.max_results {
            merged.max_results = Some(max_results);
        }
        if let Some(is_bundling) = options.is_bundling {
            merged.is_bundling = is_bundling;
        }
        if let Some(backoff) = &options.longrunning {
            merged.longrunning = Some(backoff.clone());
        }
        for (key, value) in &options.metadata {
            merged.metadata.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// Per-call overrides; unset fields inherit the method's [`CallSettings`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryOptions>,
    pub auto_paginate: Option<bool>,
    pub page_token: Option<Value>,
    pub max_results: Option<usize>,
    pub is_bundling: Option<bool>,
    pub longrunning: Option<BackoffSettings>,
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn auto_paginate(mut self, enabled: bool) -> Self {
        self.auto_paginate = Some(enabled);
        self
    }

    pub fn page_token(mut self, token: impl Into<Value>) -> Self {
        self.page_token = Some(token.into());
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn bundling(mut self, enabled: bool) -> Self {
        self.is_bundling = Some(enabled);
        self
    }

    pub fn longrunning(mut self, backoff: BackoffSettings) -> Self {
        self.longrunning = Some(backoff);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_settings() {
        let backoff = create_default_backoff_settings();
        assert_eq!(backoff.initial_retry_delay, Duration::from_millis(100));
        assert_eq!(backoff.retry_delay_multiplier, 1.3);
        assert_eq!(backoff.max_retry_delay, Duration::from_secs(60));
        assert_eq!(backoff.total_timeout, None);
    }

    #[test]
    fn test_merge_overrides_only_set_fields() {
        let settings = CallSettings {
            max_results: Some(10),
            ..Default::default()
        };
        let merged = settings.merge(
            &CallOptions::new()
                .auto_paginate(false)
                .metadata("x-goog-request-params", "name=a"),
        );
        assert!(!merged.auto_paginate);
        assert_eq!(merged.max_results, Some(10));
        assert!(merged.is_bundling);
        assert_eq!(
            merged.metadata.get("x-goog-request-params").map(String::as_str),
            Some("name=a")
        );
    }

    #[test]
    fn test_bundle_options_require_a_threshold() {
        assert!(BundleOptions::default().validate().is_err());
        let opts = BundleOptions {
            element_count_threshold: Some(5),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_bundle_options_threshold_above_limit_rejected() {
        let opts = BundleOptions {
            element_count_threshold: Some(8),
            element_count_limit: Some(7),
            ..Default::default()
        };
        let err = opts.validate().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_call_options_deserialize_with_defaults() {
        let opts: CallOptions =
            serde_json::from_value(serde_json::json!({"max_results": 8})).unwrap();
        assert_eq!(opts.max_results, Some(8));
        assert_eq!(opts.auto_paginate, None);
    }

    #[test]
    fn test_retry_options_classify() {
        let retry = RetryOptions::new(vec![Code::Unavailable], BackoffSettings::default());
        assert!(retry.is_retryable(&GaxError::remote(Code::Unavailable, "x")));
        assert!(!retry.is_retryable(&GaxError::remote(Code::NotFound, "x")));
        assert!(!retry.is_retryable(&GaxError::Cancelled));

        let with_deadline = RetryOptions::new(
            vec![Code::DeadlineExceeded],
            BackoffSettings::default(),
        );
        assert!(with_deadline.is_retryable(&GaxError::deadline_exceeded("attempt")));
    }
}

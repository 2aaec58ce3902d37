//! Token-paginated calls
//!
//! What this module provides
//! - `PageDescriptor`: the request token field, the response token field and
//!   the repeated resource field of a paginated method
//! - `PagedApiCaller`: auto-pagination (every page accumulated, optionally
//!   capped by `max_results`) or a single page plus the request for the next
//! - `ResourceStream`: a lazy, pull-driven stream of individual resources
//!
//! Implementation strategy
//! - Each page fetch goes through the decorated unary call, so retry applies
//!   to every physical page request independently
//! - `max_results` never shortens a page request: full pages are fetched and
//!   the overflow is dropped client-side, and no page is fetched once the cap
//!   is reached

mod stream;

pub use stream::ResourceStream;

use serde_json::Value;
use tracing::trace;

use crate::api_call::{send_unary, ApiCall, ApiCaller, Descriptor};
use crate::cancel::CancellableCall;
use crate::config::{CallOptions, CallSettings};
use crate::error::Result;
use crate::unary::BoxUnaryCall;

/// Field names of a paginated method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub request_page_token_field: String,
    pub response_page_token_field: String,
    pub resource_field: String,
}

/// One fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub resources: Vec<Value>,
    /// Request for the following page, `None` on the last page
    pub next_request: Option<Value>,
    pub raw: Value,
}

/// Outcome of a paged call
#[derive(Debug, Clone, PartialEq)]
pub enum PagedResponse {
    /// Every resource across all pages (auto-pagination)
    All(Vec<Value>),
    /// A single page (`auto_paginate = false`)
    Page(Page),
}

impl PagedResponse {
    /// The resources carried, whichever mode produced them.
    pub fn into_resources(self) -> Vec<Value> {
        match self {
            PagedResponse::All(resources) => resources,
            PagedResponse::Page(page) => page.resources,
        }
    }

    pub fn into_page(self) -> Option<Page> {
        match self {
            PagedResponse::Page(page) => Some(page),
            PagedResponse::All(_) => None,
        }
    }
}

impl PageDescriptor {
    pub fn new(
        request_page_token_field: impl Into<String>,
        response_page_token_field: impl Into<String>,
        resource_field: impl Into<String>,
    ) -> Self {
        Self {
            request_page_token_field: request_page_token_field.into(),
            response_page_token_field: response_page_token_field.into(),
            resource_field: resource_field.into(),
        }
    }

    /// Lazy stream of resources. `auto_paginate` is ignored; `page_token`
    /// and `max_results` are honored. Nothing is fetched until polled.
    pub fn create_stream(
        &self,
        api_call: &ApiCall<PagedApiCaller>,
        request: Value,
        options: CallOptions,
    ) -> ResourceStream {
        let (inner, settings) = api_call.prepare(&options);
        let request = self.seed_request(request, &settings);
        ResourceStream::new(self.clone(), inner, request, settings)
    }

    /// Next-page token of `response`; absent, null, empty and zero tokens
    /// all mean there is no next page.
    pub fn next_page_token(&self, response: &Value) -> Option<Value> {
        let token = response.get(&self.response_page_token_field)?;
        let present = match token {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => n.as_f64() != Some(0.0),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        };
        present.then(|| token.clone())
    }

    pub fn resources(&self, response: &Value) -> Vec<Value> {
        response
            .get(&self.resource_field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn with_page_token(&self, request: &Value, token: Value) -> Value {
        let mut next = request.clone();
        if let Value::Object(map) = &mut next {
            map.insert(self.request_page_token_field.clone(), token);
        }
        next
    }

    fn seed_request(&self, request: Value, settings: &CallSettings) -> Value {
        match &settings.page_token {
            Some(token) => self.with_page_token(&request, token.clone()),
            None => request,
        }
    }

    /// Fetch the page `request` names.
    pub(crate) async fn fetch_page(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: &CallSettings,
    ) -> Result<Page> {
        let raw = send_unary(inner, request.clone(), settings).await?;
        let resources = self.resources(&raw);
        let next_request = self
            .next_page_token(&raw)
            .map(|token| self.with_page_token(&request, token));
        trace!(
            resources = resources.len(),
            has_next = next_request.is_some(),
            "fetched page"
        );
        Ok(Page {
            resources,
            next_request,
            raw,
        })
    }
}

impl Descriptor for PageDescriptor {
    type Caller = PagedApiCaller;

    fn api_caller(&self, _settings: &CallSettings) -> Result<PagedApiCaller> {
        Ok(PagedApiCaller {
            descriptor: self.clone(),
        })
    }
}

/// Pagination-aware caller
#[derive(Debug, Clone)]
pub struct PagedApiCaller {
    descriptor: PageDescriptor,
}

impl PagedApiCaller {
    pub fn descriptor(&self) -> &PageDescriptor {
        &self.descriptor
    }
}

impl ApiCaller for PagedApiCaller {
    type Output = PagedResponse;

    fn call(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> CancellableCall<PagedResponse> {
        let descriptor = self.descriptor.clone();
        CancellableCall::abortable(async move {
            let request = descriptor.seed_request(request, &settings);
            if !settings.auto_paginate {
                let page = descriptor.fetch_page(inner, request, &settings).await?;
                return Ok(PagedResponse::Page(page));
            }

            let mut all = Vec::new();
            let mut next = Some(request);
            while let Some(request) = next.take() {
                let page = descriptor
                    .fetch_page(inner.clone(), request, &settings)
                    .await?;
                all.extend(page.resources);
                if let Some(max) = settings.max_results {
                    if all.len() >= max {
                        all.truncate(max);
                        break;
                    }
                }
                next = page.next_request;
            }
            Ok(PagedResponse::All(all))
        })
    }
}

impl ApiCall<PagedApiCaller> {
    /// Stream the resources of this call; see [`PageDescriptor::create_stream`].
    pub fn stream(&self, request: Value, options: CallOptions) -> ResourceStream {
        self.caller().descriptor().create_stream(self, request, options)
    }
}

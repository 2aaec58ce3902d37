//! Pull-driven resource stream over a paginated call

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, Stream};
use serde_json::Value;
use tracing::debug;

use super::{Page, PageDescriptor};
use crate::config::CallSettings;
use crate::error::Result;
use crate::unary::BoxUnaryCall;

/// Stream of individual resources across pages
///
/// A page is requested only when the consumer polls with nothing buffered,
/// so an unread stream issues no calls. The stream ends after the last page,
/// once `max_results` resources were yielded, after [`ResourceStream::end`],
/// or after the first error.
pub struct ResourceStream {
    descriptor: PageDescriptor,
    inner: BoxUnaryCall,
    settings: CallSettings,
    next_request: Option<Value>,
    buffer: VecDeque<Value>,
    in_flight: Option<BoxFuture<'static, Result<Page>>>,
    remaining: Option<usize>,
    pages_fetched: usize,
    finished: bool,
}

impl fmt::Debug for ResourceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStream")
            .field("buffered", &self.buffer.len())
            .field("remaining", &self.remaining)
            .field("pages_fetched", &self.pages_fetched)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ResourceStream {
    pub(crate) fn new(
        descriptor: PageDescriptor,
        inner: BoxUnaryCall,
        request: Value,
        settings: CallSettings,
    ) -> Self {
        Self {
            descriptor,
            inner,
            remaining: settings.max_results,
            settings,
            next_request: Some(request),
            buffer: VecDeque::new(),
            in_flight: None,
            pages_fetched: 0,
            finished: false,
        }
    }

    /// Stop the stream: drop buffered resources and cancel any page request
    /// in flight. No further calls are issued.
    pub fn end(&mut self) {
        if !self.finished {
            debug!(pages = self.pages_fetched, "resource stream ended early");
        }
        self.finished = true;
        self.in_flight = None;
        self.next_request = None;
        self.buffer.clear();
    }

    /// Pages requested so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn start_fetch(&mut self, request: Value) {
        let descriptor = self.descriptor.clone();
        let inner = self.inner.clone();
        let settings = self.settings.clone();
        self.pages_fetched += 1;
        self.in_flight = Some(
            async move { descriptor.fetch_page(inner, request, &settings).await }.boxed(),
        );
    }
}

impl Stream for ResourceStream {
    type Item = Result<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if this.remaining == Some(0) {
                this.finished = true;
                this.next_request = None;
                return Poll::Ready(None);
            }
            if let Some(resource) = this.buffer.pop_front() {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Poll::Ready(Some(Ok(resource)));
            }

            if this.in_flight.is_none() {
                match this.next_request.take() {
                    Some(request) => this.start_fetch(request),
                    None => {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                }
            }
            let Some(fetch) = this.in_flight.as_mut() else {
                continue;
            };

            match fetch.poll_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(page)) => {
                    this.in_flight = None;
                    this.buffer.extend(page.resources);
                    this.next_request = page.next_request;
                }
                Poll::Ready(Err(err)) => {
                    this.end();
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let buffered = self.buffer.len();
        match self.remaining {
            Some(remaining) => (buffered.min(remaining), Some(remaining)),
            None => (buffered, None),
        }
    }
}

impl FusedStream for ResourceStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

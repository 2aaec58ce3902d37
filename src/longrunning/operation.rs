//! The operation state machine and its polling loop

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{AbortHandle, Aborted};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{LongRunningDescriptor, OperationProto};
use crate::cancel::CancellableCall;
use crate::config::BackoffSettings;
use crate::error::{GaxError, Result};
use crate::retry::{BackoffPolicy, TOTAL_TIMEOUT_MESSAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Lifecycle notification published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// A poll returned changed metadata while still pending
    Progress {
        metadata: Option<Value>,
        raw: OperationProto,
    },
    Complete {
        result: Value,
        metadata: Option<Value>,
        raw: OperationProto,
    },
    Error(GaxError),
}

impl OperationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationEvent::Progress { .. })
    }
}

/// Decoded view of the latest response
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot {
    /// Decoded result, present once the operation succeeded
    pub result: Option<Value>,
    pub metadata: Option<Value>,
    pub raw: OperationProto,
}

struct OperationState {
    latest: OperationProto,
    metadata: Option<Value>,
    result: Option<Value>,
    error: Option<GaxError>,
    status: OperationStatus,
    in_flight: Option<AbortHandle>,
    /// Set while a cancel request is outstanding; no poll may start
    cancelling: bool,
    subscribers: Vec<mpsc::UnboundedSender<OperationEvent>>,
    terminal: Option<OperationEvent>,
    polling: bool,
}

impl OperationState {
    /// Record the terminal outcome and tell everyone. Senders are dropped so
    /// subscriber streams end after the terminal event.
    fn settle(&mut self, status: OperationStatus, event: OperationEvent) {
        if self.status != OperationStatus::Pending {
            return;
        }
        self.status = status;
        if let OperationEvent::Error(err) = &event {
            self.error = Some(err.clone());
        }
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
        self.terminal = Some(event);
    }

    fn publish(&mut self, event: OperationEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn snapshot(&self) -> Result<OperationSnapshot> {
        match self.status {
            OperationStatus::Failed => Err(self
                .error
                .clone()
                .unwrap_or_else(|| GaxError::remote(crate::error::Code::Unknown, "operation failed"))),
            OperationStatus::Cancelled => Err(GaxError::Cancelled),
            OperationStatus::Pending | OperationStatus::Succeeded => Ok(OperationSnapshot {
                result: self.result.clone(),
                metadata: self.metadata.clone(),
                raw: self.latest.clone(),
            }),
        }
    }
}

struct OperationInner {
    name: String,
    descriptor: LongRunningDescriptor,
    backoff: BackoffSettings,
    state: Mutex<OperationState>,
    poll_gate: tokio::sync::Mutex<()>,
}

/// Handle on one remote long-running operation
///
/// Cloning shares the same state; only one poll is in flight at a time
/// across all clones.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Operation {
    /// Wrap the initial response of a long-running call.
    pub fn new(
        initial: OperationProto,
        descriptor: LongRunningDescriptor,
        backoff: BackoffSettings,
    ) -> Result<Self> {
        let operation = Self {
            inner: Arc::new(OperationInner {
                name: initial.name.clone(),
                descriptor,
                backoff,
                state: Mutex::new(OperationState {
                    latest: OperationProto::default(),
                    metadata: None,
                    result: None,
                    error: None,
                    status: OperationStatus::Pending,
                    in_flight: None,
                    cancelling: false,
                    subscribers: Vec::new(),
                    terminal: None,
                    polling: false,
                }),
                poll_gate: tokio::sync::Mutex::new(()),
            }),
        };
        operation.absorb(initial)?;
        Ok(operation)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn backoff_settings(&self) -> &BackoffSettings {
        &self.inner.backoff
    }

    pub fn status(&self) -> OperationStatus {
        self.lock().status
    }

    /// Whether the operation reached a terminal state
    pub fn done(&self) -> bool {
        self.status() != OperationStatus::Pending
    }

    pub fn latest_response(&self) -> OperationProto {
        self.lock().latest.clone()
    }

    pub fn metadata(&self) -> Option<Value> {
        self.lock().metadata.clone()
    }

    pub fn result(&self) -> Option<Value> {
        self.lock().result.clone()
    }

    pub fn error(&self) -> Option<GaxError> {
        self.lock().error.clone()
    }

    /// Current view of the operation, polling once unless it already settled.
    pub fn get_operation(&self) -> CancellableCall<OperationSnapshot> {
        if self.done() {
            return CancellableCall::ready(self.lock().snapshot());
        }
        let operation = self.clone();
        CancellableCall::abortable(async move {
            if !operation.done() {
                operation.poll_once().await?;
            }
            let snapshot = operation.lock().snapshot();
            snapshot
        })
    }

    /// Resolve once the operation finishes, polling with backoff.
    pub fn promise(&self) -> CancellableCall<OperationSnapshot> {
        let mut events = self.subscribe();
        CancellableCall::abortable(async move {
            while let Some(event) = events.next().await {
                match event {
                    OperationEvent::Complete {
                        result,
                        metadata,
                        raw,
                    } => {
                        return Ok(OperationSnapshot {
                            result: Some(result),
                            metadata,
                            raw,
                        })
                    }
                    OperationEvent::Error(err) => return Err(err),
                    OperationEvent::Progress { .. } => {}
                }
            }
            Err(GaxError::Cancelled)
        })
    }

    /// Lifecycle events. The first live subscription starts the polling loop;
    /// a subscriber arriving after the operation settled receives the
    /// terminal event straight away.
    pub fn subscribe(&self) -> UnboundedReceiverStream<OperationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            match &state.terminal {
                Some(event) => {
                    let _ = tx.send(event.clone());
                }
                None => state.subscribers.push(tx),
            }
        }
        self.ensure_polling();
        UnboundedReceiverStream::new(rx)
    }

    /// Cancel the in-flight poll, then ask the server to cancel the
    /// operation. Waiters settle with `Cancelled`.
    ///
    /// No poll starts once cancellation begins. If the server rejects the
    /// cancel request, polling resumes and the error is returned.
    pub async fn cancel(&self) -> Result<()> {
        let in_flight = {
            let mut state = self.lock();
            state.cancelling = true;
            state.in_flight.take()
        };
        if let Some(handle) = in_flight {
            debug!(operation = %self.inner.name, "cancelling in-flight poll");
            handle.abort();
        }
        let acked = self
            .inner
            .descriptor
            .operations_client
            .cancel_operation(&self.inner.name)
            .await;
        if let Err(err) = acked {
            debug!(operation = %self.inner.name, error = %err, "cancel rejected, resuming polls");
            self.lock().cancelling = false;
            self.ensure_polling();
            return Err(err);
        }
        self.lock().settle(
            OperationStatus::Cancelled,
            OperationEvent::Error(GaxError::Cancelled),
        );
        Ok(())
    }

    /// Start the polling loop unless it already runs, nobody listens, or the
    /// operation cannot be polled.
    fn ensure_polling(&self) {
        let start = {
            let mut state = self.lock();
            state.subscribers.retain(|tx| !tx.is_closed());
            let idle = state.status == OperationStatus::Pending
                && !state.cancelling
                && !state.subscribers.is_empty();
            idle && !std::mem::replace(&mut state.polling, true)
        };
        if start {
            let operation = self.clone();
            tokio::spawn(async move { operation.poll_loop().await });
        }
    }

    fn lock(&self) -> MutexGuard<'_, OperationState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue one `get_operation` and fold the response into the state.
    /// Returns whether the metadata changed.
    async fn poll_once(&self) -> Result<bool> {
        let _gate = self.inner.poll_gate.lock().await;
        if self.done() {
            return Ok(false);
        }
        let client = self.inner.descriptor.operations_client.clone();
        let name = self.inner.name.clone();
        let (poll, handle) =
            futures::future::abortable(async move { client.get_operation(&name).await });
        {
            let mut state = self.lock();
            if state.cancelling {
                return Err(GaxError::Cancelled);
            }
            state.in_flight = Some(handle);
        }
        let outcome = poll.await;
        self.lock().in_flight = None;
        trace!(operation = %self.inner.name, "polled operation");
        match outcome {
            Ok(response) => self.absorb(response?),
            Err(Aborted) => Err(GaxError::Cancelled),
        }
    }

    /// Decode `response`, store it, and settle if it is terminal. Returns
    /// whether the metadata changed.
    fn absorb(&self, response: OperationProto) -> Result<bool> {
        let descriptor = &self.inner.descriptor;
        let metadata = response
            .metadata
            .as_ref()
            .map(|payload| (descriptor.metadata_decoder)(payload))
            .transpose()?;
        let outcome = if !response.done {
            None
        } else if let Some(status) = &response.error {
            Some(Err(GaxError::from(status)))
        } else if let Some(payload) = &response.response {
            Some(Ok((descriptor.response_decoder)(payload)?))
        } else {
            Some(Err(GaxError::MalformedResponse {
                message: format!(
                    "operation {} is done but carries neither a response nor an error",
                    response.name
                ),
            }))
        };

        let mut state = self.lock();
        if state.status != OperationStatus::Pending {
            return Ok(false);
        }
        let changed = state.latest.metadata != response.metadata;
        state.latest = response;
        state.metadata = metadata;
        match outcome {
            None => {}
            Some(Ok(result)) => {
                state.result = Some(result.clone());
                let event = OperationEvent::Complete {
                    result,
                    metadata: state.metadata.clone(),
                    raw: state.latest.clone(),
                };
                state.settle(OperationStatus::Succeeded, event);
            }
            Some(Err(err)) => {
                debug!(operation = %self.inner.name, error = %err, "operation failed");
                state.settle(OperationStatus::Failed, OperationEvent::Error(err));
            }
        }
        Ok(changed)
    }

    fn fail(&self, err: GaxError) {
        let status = if err.is_cancelled() {
            OperationStatus::Cancelled
        } else {
            OperationStatus::Failed
        };
        self.lock().settle(status, OperationEvent::Error(err));
    }

    /// Keep polling while somebody listens and the operation is pending.
    async fn poll_loop(self) {
        let mut policy = BackoffPolicy::new(self.inner.backoff.clone());
        loop {
            {
                let mut state = self.lock();
                state.subscribers.retain(|tx| !tx.is_closed());
                if state.status != OperationStatus::Pending
                    || state.cancelling
                    || state.subscribers.is_empty()
                {
                    state.polling = false;
                    return;
                }
            }

            let now = Instant::now();
            if policy.is_expired(now) {
                self.fail(GaxError::deadline_exceeded(TOTAL_TIMEOUT_MESSAGE));
                continue;
            }
            let polled = match policy.remaining(now) {
                Some(remaining) => match timeout(remaining, self.poll_once()).await {
                    Ok(polled) => polled,
                    Err(_) => Err(GaxError::deadline_exceeded(TOTAL_TIMEOUT_MESSAGE)),
                },
                None => self.poll_once().await,
            };
            // cancel() settles the operation once the server acknowledges
            let cancelling = polled.is_err() && self.lock().cancelling;
            match polled {
                Err(_) if cancelling => continue,
                Ok(true) => {
                    let mut state = self.lock();
                    if state.status == OperationStatus::Pending {
                        let event = OperationEvent::Progress {
                            metadata: state.metadata.clone(),
                            raw: state.latest.clone(),
                        };
                        state.publish(event);
                    }
                }
                Ok(false) => {}
                Err(err) => self.fail(err),
            }
            if self.done() {
                continue;
            }
            sleep(policy.next_delay()).await;
        }
    }
}

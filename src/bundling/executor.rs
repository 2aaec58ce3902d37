//! Per-key bundling executor
//!
//! Live bundles are owned by the executor instance: a map from bundle id to
//! its pending [`Task`], a per-key flush-scheduled marker (a generation number
//! checked when the delay timer fires), and bookkeeping that lets every
//! [`Canceller`] find its entry whether it is still queued or already on the
//! wire.
//!
//! Dispatches for one key are chained: a flushed task waits for the previous
//! physical call of the same key to settle before sending its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tower::ServiceExt;
use tracing::{debug, trace};

use super::task::{Dispatch, Entry, EntryId, Task};
use super::{compute_bundle_id, slice_for_response, BundleDescriptor};
use crate::cancel::{CancellableCall, Canceller};
use crate::config::{BundleOptions, Metadata};
use crate::error::{GaxError, Result};
use crate::unary::{BoxUnaryCall, UnaryRequest};
use crate::warnings::Warnings;

type DispatchDone = Shared<BoxFuture<'static, ()>>;

/// Where a scheduled entry currently lives
#[derive(Debug, Clone)]
enum Invocation {
    Queued(String),
    Running(u64),
}

#[derive(Default)]
struct ExecutorState {
    tasks: HashMap<String, Task>,
    flush_scheduled: HashMap<String, u64>,
    running: HashMap<u64, AbortHandle>,
    invocations: HashMap<EntryId, Invocation>,
    tails: HashMap<String, (u64, DispatchDone)>,
    next_id: u64,
}

impl ExecutorState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Groups calls sharing a bundle id into single physical calls
///
/// Cloning shares the same live bundles. Scheduling spawns onto the current
/// Tokio runtime.
#[derive(Clone)]
pub struct BundleExecutor {
    options: Arc<BundleOptions>,
    descriptor: Arc<BundleDescriptor>,
    warnings: Warnings,
    state: Arc<Mutex<ExecutorState>>,
}

impl fmt::Debug for BundleExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleExecutor")
            .field("options", &self.options)
            .field("descriptor", &self.descriptor)
            .field("pending", &self.pending_keys())
            .finish()
    }
}

impl BundleExecutor {
    pub fn new(options: BundleOptions, descriptor: BundleDescriptor) -> Self {
        Self::with_warnings(options, descriptor, Warnings::global().clone())
    }

    pub fn with_warnings(
        options: BundleOptions,
        descriptor: BundleDescriptor,
        warnings: Warnings,
    ) -> Self {
        Self {
            options: Arc::new(options),
            descriptor: Arc::new(descriptor),
            warnings,
            state: Arc::new(Mutex::new(ExecutorState::default())),
        }
    }

    pub fn options(&self) -> &BundleOptions {
        &self.options
    }

    pub fn descriptor(&self) -> &BundleDescriptor {
        &self.descriptor
    }

    /// Queue `request` for bundling, or send it on its own when it cannot be
    /// bundled. Never fails synchronously; errors arrive through the returned
    /// call.
    pub fn schedule(
        &self,
        inner: BoxUnaryCall,
        request: Value,
        metadata: Metadata,
    ) -> CancellableCall<Value> {
        let descriptor = &self.descriptor;
        let elements = match request.get(&descriptor.bundled_field) {
            Some(Value::Array(items)) => items.clone(),
            _ => {
                self.warnings.warn(
                    "bundling_no_bundled_field",
                    &format!(
                        "request does not contain field `{}` required for bundling, invoking immediately",
                        descriptor.bundled_field
                    ),
                );
                return unbundled(inner, request, metadata);
            }
        };
        let Some(bundle_id) =
            compute_bundle_id(&request, &descriptor.request_discriminator_fields)
        else {
            self.warnings.warn(
                "bundling_calculate_id_failed",
                "failed to compute a bundle id from the request discriminator fields, invoking immediately",
            );
            return unbundled(inner, request, metadata);
        };

        let bytes: usize = elements.iter().map(|e| descriptor.byte_length(e)).sum();
        if let Err(err) = self.check_entry_limits(elements.len(), bytes) {
            return CancellableCall::ready(Err(err));
        }

        let (reply, rx) = oneshot::channel();
        let id = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let overflow = state
                .tasks
                .get(&bundle_id)
                .is_some_and(|task| self.would_reach_limit(task, elements.len(), bytes));
            if overflow {
                self.run_now(state, &bundle_id);
            }

            let id = state.next_id();
            let task_id = state.next_id();
            let task = state
                .tasks
                .entry(bundle_id.clone())
                .or_insert_with(|| Task::new(task_id, request, metadata, inner));
            task.extend(Entry {
                id,
                elements,
                bytes,
                reply,
            });
            state
                .invocations
                .insert(id, Invocation::Queued(bundle_id.clone()));
            trace!(bundle = %bundle_id, entry = id, "queued bundle entry");

            if self.threshold_reached(task) {
                self.run_now(state, &bundle_id);
            } else if let Some(delay) = self.options.delay_threshold {
                if !state.flush_scheduled.contains_key(&bundle_id) {
                    let generation = state.next_id();
                    state.flush_scheduled.insert(bundle_id.clone(), generation);
                    let executor = self.clone();
                    let key = bundle_id.clone();
                    tokio::spawn(async move {
                        sleep(delay).await;
                        executor.flush_if_scheduled(&key, generation);
                    });
                }
            }
            id
        };

        let future = async move { rx.await.unwrap_or_else(|_| Err(GaxError::Cancelled)) }.boxed();
        let state = Arc::downgrade(&self.state);
        CancellableCall::new(future, Canceller::new(move || cancel_entry(&state, id)))
    }

    /// Flush the pending task for `bundle_id` now, if any.
    pub fn flush(&self, bundle_id: &str) {
        let mut guard = self.lock();
        self.run_now(&mut guard, bundle_id);
    }

    /// Flush every pending task.
    pub fn flush_all(&self) {
        let mut guard = self.lock();
        let keys: Vec<String> = guard.tasks.keys().cloned().collect();
        for key in keys {
            self.run_now(&mut guard, &key);
        }
    }

    /// Bundle ids with a task waiting to be flushed
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of queued entries for `bundle_id`
    pub fn pending_len(&self, bundle_id: &str) -> usize {
        self.lock().tasks.get(bundle_id).map_or(0, Task::len)
    }

    /// Whether a delay timer is armed for `bundle_id`
    pub fn is_flush_scheduled(&self, bundle_id: &str) -> bool {
        self.lock().flush_scheduled.contains_key(bundle_id)
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_entry_limits(&self, count: usize, bytes: usize) -> Result<()> {
        if let Some(limit) = self.options.element_count_limit.filter(|l| *l > 0) {
            if count > limit {
                return Err(GaxError::invalid_argument(format!(
                    "The number of elements {} exceeds the limit {}",
                    count, limit
                )));
            }
        }
        if let Some(limit) = self.options.request_byte_limit.filter(|l| *l > 0) {
            if bytes >= limit {
                return Err(GaxError::invalid_argument(format!(
                    "The required bytes {} exceeds the limit {}",
                    bytes, limit
                )));
            }
        }
        Ok(())
    }

    fn would_reach_limit(&self, task: &Task, count: usize, bytes: usize) -> bool {
        let count_hit = self
            .options
            .element_count_limit
            .is_some_and(|l| l > 0 && task.element_count() + count >= l);
        let bytes_hit = self
            .options
            .request_byte_limit
            .is_some_and(|l| l > 0 && task.request_bytes() + bytes >= l);
        count_hit || bytes_hit
    }

    fn threshold_reached(&self, task: &Task) -> bool {
        let count_hit = self
            .options
            .element_count_threshold
            .is_some_and(|t| t > 0 && task.element_count() >= t);
        let bytes_hit = self
            .options
            .request_byte_threshold
            .is_some_and(|t| t > 0 && task.request_bytes() >= t);
        count_hit || bytes_hit
    }

    fn flush_if_scheduled(&self, bundle_id: &str, generation: u64) {
        let mut guard = self.lock();
        if guard.flush_scheduled.get(bundle_id) == Some(&generation) {
            trace!(bundle = %bundle_id, "delay threshold elapsed");
            self.run_now(&mut guard, bundle_id);
        }
    }

    /// Take the task for `bundle_id` off the map and send it.
    fn run_now(&self, state: &mut ExecutorState, bundle_id: &str) {
        state.flush_scheduled.remove(bundle_id);
        let Some(task) = state.tasks.remove(bundle_id) else {
            return;
        };
        if task.is_empty() {
            return;
        }
        let task_id = task.id;
        for id in task.entry_ids() {
            state.invocations.insert(id, Invocation::Running(task_id));
        }
        let dispatch = task.into_dispatch(&self.descriptor.bundled_field);
        let counts = dispatch.element_counts();
        let Dispatch {
            request,
            metadata,
            inner,
            entries,
        } = dispatch;

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done: DispatchDone = done_rx.map(|_| ()).boxed().shared();
        let previous = state
            .tails
            .insert(bundle_id.to_string(), (task_id, done))
            .map(|(_, prev)| prev);

        let (abort, registration) = AbortHandle::new_pair();
        state.running.insert(task_id, abort);
        let call = Abortable::new(
            async move {
                if let Some(previous) = previous {
                    previous.await;
                }
                inner
                    .oneshot(UnaryRequest::new(request).with_metadata(metadata))
                    .await
            },
            registration,
        );

        debug!(
            bundle = %bundle_id,
            entries = entries.len(),
            elements = counts.iter().sum::<usize>(),
            "dispatching bundle"
        );
        let executor = self.clone();
        let key = bundle_id.to_string();
        tokio::spawn(async move {
            let result = match call.await {
                Ok(result) => result,
                Err(Aborted) => Err(GaxError::Cancelled),
            };
            let _ = done_tx.send(());
            executor.finish(&key, task_id, entries, &counts, result);
        });
    }

    fn finish(
        &self,
        bundle_id: &str,
        task_id: u64,
        entries: Vec<Entry>,
        counts: &[usize],
        result: Result<Value>,
    ) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.running.remove(&task_id);
            for entry in &entries {
                state.invocations.remove(&entry.id);
            }
            if state
                .tails
                .get(bundle_id)
                .is_some_and(|(id, _)| *id == task_id)
            {
                state.tails.remove(bundle_id);
            }
        }

        match result {
            Ok(response) => {
                let slices = slice_for_response(
                    &response,
                    counts,
                    self.descriptor.subresponse_field.as_deref(),
                );
                for (entry, slice) in entries.into_iter().zip(slices) {
                    entry.settle(Ok(slice));
                }
            }
            Err(err) => {
                debug!(bundle = %bundle_id, code = %err.code(), "bundle failed");
                for entry in entries {
                    entry.settle(Err(err.clone()));
                }
            }
        }
    }
}

/// Cancel one scheduled entry. A queued entry is removed and settled on its
/// own; an entry already on the wire aborts its whole physical call.
fn cancel_entry(state: &Weak<Mutex<ExecutorState>>, id: EntryId) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let removed = {
        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        match state.invocations.get(&id).cloned() {
            Some(Invocation::Queued(key)) => {
                state.invocations.remove(&id);
                let entry = state.tasks.get_mut(&key).and_then(|task| task.remove(id));
                if state.tasks.get(&key).is_some_and(Task::is_empty) {
                    state.tasks.remove(&key);
                    state.flush_scheduled.remove(&key);
                }
                entry
            }
            Some(Invocation::Running(task_id)) => {
                if let Some(abort) = state.running.get(&task_id) {
                    debug!(task = task_id, "cancelling in-flight bundle");
                    abort.abort();
                }
                None
            }
            None => None,
        }
    };
    if let Some(entry) = removed {
        entry.settle(Err(GaxError::Cancelled));
    }
}

fn unbundled(inner: BoxUnaryCall, request: Value, metadata: Metadata) -> CancellableCall<Value> {
    CancellableCall::abortable(async move {
        inner
            .oneshot(UnaryRequest::new(request).with_metadata(metadata))
            .await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unary::boxed;
    use serde_json::json;
    use std::time::Duration;
    use tower::service_fn;

    fn executor(options: BundleOptions) -> BundleExecutor {
        let descriptor = BundleDescriptor::new("field1", &["field2"], None).unwrap();
        BundleExecutor::with_warnings(options, descriptor, Warnings::new(|_: &str, _: &str| {}))
    }

    fn echo() -> BoxUnaryCall {
        boxed(service_fn(|req: UnaryRequest| async move {
            Ok::<_, GaxError>(req.message)
        }))
    }

    #[tokio::test]
    async fn flush_timer_generation_ignored_after_manual_flush() {
        let exec = executor(BundleOptions {
            delay_threshold: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let call = exec.schedule(echo(), json!({"field1": [1], "field2": "id"}), Metadata::new());
        let key = exec.pending_keys().remove(0);
        assert!(exec.is_flush_scheduled(&key));
        exec.flush(&key);
        assert!(!exec.is_flush_scheduled(&key));
        assert!(exec.pending_keys().is_empty());
        assert_eq!(call.await.unwrap(), json!({"field1": [1], "field2": "id"}));
    }

    #[tokio::test]
    async fn cancelling_last_queued_entry_drops_task() {
        let exec = executor(BundleOptions {
            delay_threshold: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let call = exec.schedule(echo(), json!({"field1": [1], "field2": "id"}), Metadata::new());
        call.cancel();
        assert!(exec.pending_keys().is_empty());
        assert!(call.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_settle_is_noop() {
        let exec = executor(BundleOptions {
            element_count_threshold: Some(1),
            ..Default::default()
        });
        let call = exec.schedule(echo(), json!({"field1": [1], "field2": "id"}), Metadata::new());
        let canceller = call.canceller();
        assert!(call.await.is_ok());
        canceller.cancel();
    }
}

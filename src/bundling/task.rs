//! Aggregation unit for one bundle key

use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::Metadata;
use crate::error::Result;
use crate::unary::BoxUnaryCall;

/// Identity tag of one scheduled call
pub type EntryId = u64;

/// One caller's contribution to a bundle
#[derive(Debug)]
pub(crate) struct Entry {
    pub id: EntryId,
    pub elements: Vec<Value>,
    pub bytes: usize,
    pub reply: oneshot::Sender<Result<Value>>,
}

impl Entry {
    pub fn settle(self, result: Result<Value>) {
        // the receiver is gone once the caller dropped its future
        let _ = self.reply.send(result);
    }
}

/// Pending calls for one bundle key, in insertion order
///
/// The first scheduled call supplies the request template, metadata and the
/// decorated unary call used for the physical dispatch.
pub(crate) struct Task {
    pub id: u64,
    template: Value,
    metadata: Metadata,
    inner: BoxUnaryCall,
    entries: Vec<Entry>,
    element_count: usize,
    byte_count: usize,
}

impl Task {
    pub fn new(id: u64, template: Value, metadata: Metadata, inner: BoxUnaryCall) -> Self {
        Self {
            id,
            template,
            metadata,
            inner,
            entries: Vec::new(),
            element_count: 0,
            byte_count: 0,
        }
    }

    pub fn extend(&mut self, entry: Entry) {
        self.element_count += entry.elements.len();
        self.byte_count += entry.bytes;
        self.entries.push(entry);
    }

    /// Take a queued entry out, leaving its siblings untouched.
    pub fn remove(&mut self, id: EntryId) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(pos);
        self.element_count -= entry.elements.len();
        self.byte_count -= entry.bytes;
        Some(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn request_bytes(&self) -> usize {
        self.byte_count
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    /// Consume the task into the physical call and its waiting entries. The
    /// physical request is the template with `bundled_field` replaced by every
    /// entry's elements, concatenated in order.
    pub fn into_dispatch(self, bundled_field: &str) -> Dispatch {
        let mut request = self.template;
        let elements: Vec<Value> = self
            .entries
            .iter()
            .flat_map(|e| e.elements.iter().cloned())
            .collect();
        if let Value::Object(map) = &mut request {
            map.insert(bundled_field.to_string(), Value::Array(elements));
        }
        Dispatch {
            request,
            metadata: self.metadata,
            inner: self.inner,
            entries: self.entries,
        }
    }
}

/// A flushed task, ready to be sent
pub(crate) struct Dispatch {
    pub request: Value,
    pub metadata: Metadata,
    pub inner: BoxUnaryCall,
    pub entries: Vec<Entry>,
}

impl Dispatch {
    pub fn element_counts(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.elements.len()).collect()
    }
}

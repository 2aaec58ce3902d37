//! One-time advisories
//!
//! Advisories are deduplicated by code: the first `(code, message)` pair for a
//! code is forwarded to the sink, later ones with the same code are dropped.
//! The dedupe set lives in a [`Warnings`] value so tests can create their own;
//! [`Warnings::global`] is the process-wide instance decorated calls use by
//! default.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::warn;

/// Destination for advisories that passed deduplication
pub trait AdvisorySink: Send + Sync + 'static {
    fn emit(&self, code: &str, message: &str);
}

/// Default sink: structured `tracing` warning
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AdvisorySink for TracingSink {
    fn emit(&self, code: &str, message: &str) {
        warn!(code = %code, "{}", message);
    }
}

impl<F> AdvisorySink for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn emit(&self, code: &str, message: &str) {
        self(code, message)
    }
}

/// Deduplicating advisory channel
#[derive(Clone)]
pub struct Warnings {
    sink: Arc<dyn AdvisorySink>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl Default for Warnings {
    fn default() -> Self {
        Self::new(TracingSink)
    }
}

impl Warnings {
    pub fn new<S: AdvisorySink>(sink: S) -> Self {
        Self {
            sink: Arc::new(sink),
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The process-wide channel.
    pub fn global() -> &'static Warnings {
        static GLOBAL: OnceLock<Warnings> = OnceLock::new();
        GLOBAL.get_or_init(Warnings::default)
    }

    /// Forward `message` unless `code` was already surfaced. Returns whether it
    /// was forwarded.
    pub fn warn(&self, code: &str, message: &str) -> bool {
        let first = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.to_string());
        if first {
            self.sink.emit(code, message);
        }
        first
    }

    /// Forget every code seen so far.
    pub fn reset(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl fmt::Debug for Warnings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Warnings").field("seen", &*seen).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warns_each_code_once() {
        let log = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let log_cl = log.clone();
        let warnings = Warnings::new(move |code: &str, message: &str| {
            log_cl
                .lock()
                .unwrap()
                .push((code.to_string(), message.to_string()));
        });
        warnings.warn("codeA", "messageA-1");
        warnings.warn("codeB", "messageB-1");
        warnings.warn("codeA", "messageA-2");
        warnings.warn("codeB", "messageB-2");
        warnings.warn("codeC", "messageC-1");
        warnings.warn("codeA", "messageA-3");

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], ("codeA".to_string(), "messageA-1".to_string()));
        assert_eq!(log[2].0, "codeC");
    }

    #[test]
    fn reset_allows_repeat() {
        let warnings = Warnings::new(|_: &str, _: &str| {});
        assert!(warnings.warn("code", "first"));
        assert!(!warnings.warn("code", "second"));
        warnings.reset();
        assert!(warnings.warn("code", "third"));
    }

    #[test]
    fn clones_share_dedupe_set() {
        let warnings = Warnings::new(|_: &str, _: &str| {});
        let other = warnings.clone();
        assert!(warnings.warn("shared", "m"));
        assert!(!other.warn("shared", "m"));
    }
}

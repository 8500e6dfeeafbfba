//! Outstanding requests awaiting a correlated reply.
//!
//! Each entry is removed before its callback runs, so a reply that
//! arrives twice can never fire the same callback twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::envelope::Envelope;

/// One-shot completion invoked with the reply envelope.
pub type ReplyCallback = Box<dyn FnOnce(Envelope) + Send + 'static>;

// ── PendingCall ──────────────────────────────────────────────────

/// A request that expects a reply.
pub struct PendingCall {
    callback: ReplyCallback,
    sent_at: Instant,
}

impl PendingCall {
    /// How long this request has been in flight.
    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    /// Consume the entry and hand out its callback.
    pub fn into_callback(self) -> ReplyCallback {
        self.callback
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("sent_at", &self.sent_at)
            .finish_non_exhaustive()
    }
}

// ── PendingCalls ─────────────────────────────────────────────────

/// Callbacks keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `correlation_id`, replacing any stale
    /// entry under the same id.
    pub fn track(&mut self, correlation_id: impl Into<String>, callback: ReplyCallback) {
        self.calls.insert(
            correlation_id.into(),
            PendingCall {
                callback,
                sent_at: Instant::now(),
            },
        );
    }

    /// Remove and return the entry for `correlation_id`, if any.
    pub fn resolve(&mut self, correlation_id: &str) -> Option<PendingCall> {
        self.calls.remove(correlation_id)
    }

    /// Drop the entry without firing it.
    pub fn forget(&mut self, correlation_id: &str) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    /// Drop every entry. Returns how many were outstanding.
    pub fn clear(&mut self) -> usize {
        let n = self.calls.len();
        self.calls.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

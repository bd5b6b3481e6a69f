//! Execution contexts.
//!
//! An [`ExecutionContext`] identifies one logical unit of work, typically a
//! single in-flight request. Transactions are bound to a context rather than
//! to a thread, so the binding survives task migration between worker threads
//! and is visible at every call site that passes the context along.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// A caller-side unit of work that owns at most one transaction binding.
///
/// Contexts are neither `Clone` nor `Copy`: two concurrent
/// callers can never share one, so a context's binding is only ever touched
/// by its owner.
#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
}

impl ExecutionContext {
    /// Create a context with a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// This context's identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_are_unique() {
        let a = ExecutionContext::new();
        let b = ExecutionContext::new();
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_context_id_display() {
        let ctx = ExecutionContext::new();
        assert_eq!(ctx.id().to_string(), format!("ctx-{}", ctx.id().as_u64()));
    }
}

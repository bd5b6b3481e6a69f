//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by a [`ConnectionManager`](crate::ConnectionManager).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during pool and transaction operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool could not create its initial connections.
    ///
    /// Fatal: the application cannot start without its baseline capacity.
    #[error("pool initialization failed: {0}")]
    Initialization(String),

    /// Failed to acquire a connection within the borrow timeout.
    #[error("timed out after {0:?} waiting for a free connection")]
    Timeout(Duration),

    /// The connection manager failed to create a connection.
    #[error("failed to create connection: {0}")]
    Creation(#[source] BoxError),

    /// The caller's wait was cancelled before a connection became available.
    #[error("cancelled while waiting for a connection")]
    Cancelled,

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// A transaction is already bound to this execution context.
    #[error("a transaction is already active for this context")]
    TransactionActive,

    /// The context's bound connection is currently lent to another handle.
    #[error("the bound connection is already checked out by this context")]
    BindingInUse,

    /// Commit, rollback, or auto-commit toggling failed.
    #[error("{operation} failed: {source}")]
    Transaction {
        /// The operation that failed.
        operation: &'static str,
        /// The underlying error.
        #[source]
        source: BoxError,
    },
}

impl PoolError {
    /// Returns true if this error is a borrow timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if the caller may reasonably retry the operation.
    ///
    /// Timeouts, creation failures, and cancelled waits leave the pool in a
    /// consistent state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Creation(_) | Self::Cancelled)
    }

    pub(crate) fn transaction(operation: &'static str, source: BoxError) -> Self {
        Self::Transaction { operation, source }
    }
}

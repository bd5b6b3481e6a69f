//! Connection lifecycle management.
//!
//! This module defines the capabilities the pool consumes from the data
//! layer, and the metadata the pool tracks for every physical connection.

use std::time::Instant;

use crate::error::BoxError;

/// Capabilities the pool needs from the surrounding data layer.
///
/// The pool itself only ever calls [`connect`](Self::connect),
/// [`is_valid`](Self::is_valid) and [`close`](Self::close). The transaction
/// methods are used by [`TransactionManager`](crate::TransactionManager).
///
/// `is_valid` and `close` are synchronous because they run when a
/// [`PooledConnection`](crate::PooledConnection) is dropped. They should be
/// cheap local checks (is the socket still open, has the driver flagged the
/// session as broken), not round trips.
#[async_trait::async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The physical connection type.
    type Connection: Send + 'static;

    /// Open a new physical connection.
    async fn connect(&self) -> Result<Self::Connection, BoxError>;

    /// Check if the connection is still usable.
    fn is_valid(&self, conn: &Self::Connection) -> bool;

    /// Physically close the connection.
    fn close(&self, conn: Self::Connection);

    /// Enable or disable auto-commit mode.
    async fn set_auto_commit(
        &self,
        conn: &mut Self::Connection,
        enabled: bool,
    ) -> Result<(), BoxError>;

    /// Commit the current transaction.
    async fn commit(&self, conn: &mut Self::Connection) -> Result<(), BoxError>;

    /// Roll back the current transaction.
    async fn rollback(&self, conn: &mut Self::Connection) -> Result<(), BoxError>;
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this physical connection within its pool.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            checkout_count: 0,
        }
    }

    /// Time since the connection was last used.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
    }
}

/// A physical connection together with its metadata.
pub(crate) struct Entry<C> {
    pub(crate) conn: C,
    pub(crate) meta: ConnectionMetadata,
}

impl<C> Entry<C> {
    pub(crate) fn new(id: u64, conn: C) -> Self {
        Self {
            conn,
            meta: ConnectionMetadata::new(id),
        }
    }
}

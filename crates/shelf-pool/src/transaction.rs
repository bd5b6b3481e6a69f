//! Transaction-scoped connection binding.
//!
//! [`TransactionManager`] lets a sequence of data-access calls made under one
//! [`ExecutionContext`] share a single physical connection. Between
//! [`begin`](TransactionManager::begin) and
//! [`commit`](TransactionManager::commit) /
//! [`rollback`](TransactionManager::rollback), every
//! [`Pool::acquire`] with that context lends the same connection, and
//! releasing those handles leaves it with the transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! let tx = TransactionManager::new(pool.clone());
//! let ctx = ExecutionContext::new();
//!
//! tx.begin(&ctx).await?;
//! copies.mark_issued(&pool, &ctx, copy_id).await?;   // acquires, releases
//! orders.insert(&pool, &ctx, &order).await?;         // same connection
//! tx.commit(&ctx).await?;
//! ```

use std::future::Future;

use crate::context::{ContextId, ExecutionContext};
use crate::error::PoolError;
use crate::lifecycle::ConnectionManager;
use crate::pool::Pool;

/// How a transaction is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Rollback,
}

impl Outcome {
    fn name(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

/// Binds pool connections to execution contexts for the span of a transaction.
///
/// Nested transactions are not supported: calling [`begin`](Self::begin) for
/// a context that already has one fails with
/// [`PoolError::TransactionActive`] and leaves the running transaction alone.
pub struct TransactionManager<M: ConnectionManager> {
    pool: Pool<M>,
}

impl<M: ConnectionManager> TransactionManager<M> {
    /// Create a transaction manager over `pool`.
    #[must_use]
    pub fn new(pool: Pool<M>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    /// Whether `ctx` currently has a transaction.
    #[must_use]
    pub fn is_active(&self, ctx: &ExecutionContext) -> bool {
        self.pool.is_bound(ctx.id())
    }

    /// Start a transaction for `ctx`.
    ///
    /// Borrows a connection, disables auto-commit on it, and binds it to
    /// `ctx`. If any step fails the connection is returned and no binding is
    /// left behind. If the future is dropped while auto-commit is being
    /// changed, the connection is closed.
    pub async fn begin(&self, ctx: &ExecutionContext) -> Result<(), PoolError> {
        if self.is_active(ctx) {
            return Err(PoolError::TransactionActive);
        }

        let mut conn = self.pool.acquire(ctx).await?;
        conn.mark_dirty();
        if let Err(e) = self.pool.manager().set_auto_commit(&mut *conn, false).await {
            conn.mark_clean();
            return Err(PoolError::transaction("disable auto-commit", e));
        }

        let connection_id = conn.metadata().id;
        self.pool.bind(ctx.id(), conn)?;

        tracing::debug!(context_id = %ctx.id(), connection_id, "transaction started");
        Ok(())
    }

    /// Commit `ctx`'s transaction and return its connection to the pool.
    ///
    /// A no-op if `ctx` has no transaction. The connection is released even
    /// when the commit fails; the failure is still reported. If the future is
    /// dropped before auto-commit is restored, the binding is gone and the
    /// connection is closed.
    pub async fn commit(&self, ctx: &ExecutionContext) -> Result<(), PoolError> {
        self.finish(ctx.id(), Outcome::Commit).await
    }

    /// Roll back `ctx`'s transaction and return its connection to the pool.
    ///
    /// A no-op if `ctx` has no transaction.
    pub async fn rollback(&self, ctx: &ExecutionContext) -> Result<(), PoolError> {
        self.finish(ctx.id(), Outcome::Rollback).await
    }

    /// Run `work` inside a transaction for `ctx`.
    ///
    /// Commits if `work` resolves to `Ok`, rolls back if it resolves to
    /// `Err`. A rollback failure is logged and the original error returned.
    /// If the returned future is dropped before `work` completes, the
    /// transaction's connection is closed and its capacity reclaimed.
    pub async fn in_transaction<T, E, F>(&self, ctx: &ExecutionContext, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        self.begin(ctx).await?;

        // Held until finalization completes. A binding still present on
        // drop (cancelled body, or a bound handle outliving the body) is
        // abandoned.
        let _guard = AbandonOnDrop {
            pool: &self.pool,
            ctx: ctx.id(),
        };

        match work.await {
            Ok(value) => {
                self.commit(ctx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.rollback(ctx).await {
                    tracing::warn!(
                        context_id = %ctx.id(),
                        error = %e,
                        "rollback after failed transaction body failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn finish(&self, ctx: ContextId, outcome: Outcome) -> Result<(), PoolError> {
        let Some(mut conn) = self.pool.unbind(ctx)? else {
            tracing::trace!(context_id = %ctx, "no active transaction to {}", outcome.name());
            return Ok(());
        };
        let connection_id = conn.metadata().id;
        let manager = self.pool.manager();

        let result = match outcome {
            Outcome::Commit => manager.commit(&mut *conn).await,
            Outcome::Rollback => manager.rollback(&mut *conn).await,
        };
        match &result {
            Ok(()) => tracing::debug!(
                context_id = %ctx,
                connection_id,
                "transaction {}",
                if outcome == Outcome::Commit { "committed" } else { "rolled back" }
            ),
            Err(e) => tracing::error!(
                context_id = %ctx,
                connection_id,
                error = %e,
                "{} failed",
                outcome.name()
            ),
        }

        match manager.set_auto_commit(&mut *conn, true).await {
            Ok(()) => {
                conn.mark_clean();
                conn.release();
            }
            Err(e) => {
                tracing::warn!(
                    connection_id,
                    error = %e,
                    "failed to restore auto-commit, closing connection"
                );
                conn.discard();
            }
        }

        result.map_err(|e| PoolError::transaction(outcome.name(), e))
    }
}

impl<M: ConnectionManager> Clone for TransactionManager<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for TransactionManager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("pool", &self.pool)
            .finish()
    }
}

/// Abandons whatever binding `ctx` still has when dropped.
struct AbandonOnDrop<'a, M: ConnectionManager> {
    pool: &'a Pool<M>,
    ctx: ContextId,
}

impl<M: ConnectionManager> Drop for AbandonOnDrop<'_, M> {
    fn drop(&mut self) {
        self.pool.abandon(self.ctx);
    }
}

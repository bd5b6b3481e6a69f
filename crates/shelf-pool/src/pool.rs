//! Connection pool implementation.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::context::{ContextId, ExecutionContext};
use crate::error::PoolError;
use crate::lifecycle::{ConnectionManager, ConnectionMetadata, Entry};

/// A bounded pool of connections with per-context transaction binding.
///
/// The pool lends at most [`PoolConfig::max_size`] connections at a time.
/// Idle connections are validated before reuse; dead ones are closed and
/// replaced transparently. When every connection is lent out, callers wait
/// up to [`PoolConfig::borrow_timeout`] for one to come back.
///
/// `Pool` is a cheap handle: clones share the same underlying state.
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

struct PoolInner<M: ConnectionManager> {
    config: PoolConfig,
    manager: M,
    state: Mutex<PoolState<M::Connection>>,
    bindings: Mutex<HashMap<ContextId, Binding<M::Connection>>>,
    available: Notify,
    next_id: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
}

struct PoolState<C> {
    idle: VecDeque<Entry<C>>,
    /// Live connections: idle plus lent out (including bound ones).
    outstanding: u32,
    closed: bool,
}

impl<C> PoolState<C> {
    fn release_slot(&mut self) {
        debug_assert!(self.outstanding > 0, "released more slots than reserved");
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

/// A connection reserved for one execution context's transaction.
///
/// `slot` is `None` while a bound handle has the connection checked out.
struct Binding<C> {
    slot: Option<Entry<C>>,
    connection_id: u64,
}

enum Checkout<C> {
    Idle(Entry<C>),
    Reserved,
    Exhausted,
}

/// Releases a reserved slot unless a connection was successfully placed in it.
struct Reservation<'a, M: ConnectionManager> {
    inner: &'a PoolInner<M>,
    armed: bool,
}

impl<'a, M: ConnectionManager> Reservation<'a, M> {
    fn new(inner: &'a PoolInner<M>) -> Self {
        Self { inner, armed: true }
    }

    fn fulfil(mut self) {
        self.armed = false;
    }
}

impl<M: ConnectionManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().release_slot();
            self.inner.available.notify_one();
        }
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a pool and eagerly open [`PoolConfig::initial_size`] connections.
    ///
    /// Fails with [`PoolError::Configuration`] if the configuration is
    /// invalid, or [`PoolError::Initialization`] if any initial connection
    /// cannot be created. Connections opened before the failure are closed.
    pub async fn new(config: PoolConfig, manager: M) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_size as usize),
                outstanding: 0,
                closed: false,
            }),
            bindings: Mutex::new(HashMap::new()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            config,
            manager,
        });

        let initial = inner.config.initial_size;
        let mut opened = Vec::with_capacity(initial as usize);
        for n in 0..initial {
            match inner.manager.connect().await {
                Ok(conn) => opened.push(inner.new_entry(conn)),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        created = n,
                        initial,
                        "failed to create initial connection"
                    );
                    for entry in opened {
                        inner.close_physical(entry);
                    }
                    return Err(PoolError::Initialization(format!(
                        "created {n} of {initial} initial connections: {e}"
                    )));
                }
            }
        }

        {
            let mut state = inner.state.lock();
            state.outstanding = initial;
            state.idle.extend(opened);
        }

        tracing::info!(
            initial_size = initial,
            max_size = inner.config.max_size,
            borrow_timeout = ?inner.config.borrow_timeout,
            "connection pool initialized"
        );

        Ok(Self { inner })
    }

    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder<M> {
        PoolBuilder::new()
    }

    /// Get a connection for `ctx`.
    ///
    /// If `ctx` has an active transaction, its bound connection is returned
    /// immediately. Otherwise an idle connection is reused, or a new one is
    /// created if the pool is below capacity. If the pool is exhausted, this
    /// waits until a connection is returned or the borrow timeout elapses.
    ///
    /// Dropping the returned future while it waits is safe: no connection is
    /// handed out and no capacity is leaked.
    pub async fn acquire(&self, ctx: &ExecutionContext) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_inner(ctx, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`PoolError::Cancelled`] once `cancel` fires.
    pub async fn acquire_with_cancel(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_inner(ctx, Some(cancel)).await
    }

    /// Get a connection without waiting and without creating one.
    ///
    /// Returns the bound connection if `ctx` has a transaction, a valid idle
    /// connection if one is available, or `None` otherwise.
    pub fn try_acquire(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Option<PooledConnection<M>>, PoolError> {
        if let Some(conn) = self.lend_bound(ctx.id())? {
            return Ok(Some(conn));
        }

        // The idle queue never holds more than max_size entries.
        for _ in 0..self.inner.config.max_size {
            let entry = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                state.idle.pop_front()
            };

            let Some(entry) = entry else {
                return Ok(None);
            };
            if self.inner.manager.is_valid(&entry.conn) {
                return Ok(Some(self.lend(entry)));
            }
            tracing::debug!(connection_id = entry.meta.id, "discarding invalid idle connection");
            self.inner.discard(entry);
        }
        Ok(None)
    }

    async fn acquire_inner(
        &self,
        ctx: &ExecutionContext,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledConnection<M>, PoolError> {
        if let Some(conn) = self.lend_bound(ctx.id())? {
            return Ok(conn);
        }

        tracing::trace!(context_id = %ctx.id(), "acquiring connection from pool");

        let timeout = self.inner.config.borrow_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before inspecting the state so a release
            // between the check and the wait is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.checkout()? {
                Checkout::Idle(entry) => return self.validate_or_replace(entry).await,
                Checkout::Reserved => {
                    let reservation = Reservation::new(&self.inner);
                    return self.create(reservation).await;
                }
                Checkout::Exhausted => {}
            }

            let wait = async {
                match cancel {
                    Some(token) => tokio::select! {
                        () = notified => Ok(()),
                        () = token.cancelled() => Err(PoolError::Cancelled),
                    },
                    None => {
                        notified.await;
                        Ok(())
                    }
                }
            };

            match tokio::time::timeout_at(deadline, wait).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    tracing::debug!(context_id = %ctx.id(), "connection wait cancelled");
                    return Err(e);
                }
                Err(_) => {
                    tracing::warn!(
                        context_id = %ctx.id(),
                        timeout = ?timeout,
                        "timed out waiting for a free connection"
                    );
                    return Err(PoolError::Timeout(timeout));
                }
            }
        }
    }

    /// Hand out an idle entry if it is still usable, otherwise close it and
    /// open a replacement in the same slot.
    async fn validate_or_replace(
        &self,
        entry: Entry<M::Connection>,
    ) -> Result<PooledConnection<M>, PoolError> {
        if self.inner.manager.is_valid(&entry.conn) {
            return Ok(self.lend(entry));
        }

        tracing::debug!(connection_id = entry.meta.id, "replacing invalid idle connection");
        let reservation = Reservation::new(&self.inner);
        self.inner.close_physical(entry);
        self.create(reservation).await
    }

    async fn create(
        &self,
        reservation: Reservation<'_, M>,
    ) -> Result<PooledConnection<M>, PoolError> {
        let conn = match self.inner.manager.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create connection");
                return Err(PoolError::Creation(e));
            }
        };
        reservation.fulfil();

        let entry = self.inner.new_entry(conn);
        Ok(self.lend(entry))
    }

    fn lend(&self, mut entry: Entry<M::Connection>) -> PooledConnection<M> {
        entry.meta.mark_checkout();
        tracing::trace!(connection_id = entry.meta.id, "connection checked out");
        PooledConnection {
            pool: Arc::clone(&self.inner),
            entry: Some(entry),
            kind: HandleKind::Owned,
        }
    }

    fn lend_bound(&self, ctx: ContextId) -> Result<Option<PooledConnection<M>>, PoolError> {
        let mut bindings = self.inner.bindings.lock();
        let Some(binding) = bindings.get_mut(&ctx) else {
            return Ok(None);
        };
        let mut entry = binding.slot.take().ok_or(PoolError::BindingInUse)?;
        drop(bindings);

        entry.meta.mark_checkout();
        tracing::trace!(
            context_id = %ctx,
            connection_id = entry.meta.id,
            "lending transaction-bound connection"
        );
        Ok(Some(PooledConnection {
            pool: Arc::clone(&self.inner),
            entry: Some(entry),
            kind: HandleKind::Bound(ctx),
        }))
    }

    /// Reserve `conn` for `ctx` until [`unbind`](Self::unbind) or
    /// [`abandon`](Self::abandon).
    pub(crate) fn bind(&self, ctx: ContextId, mut conn: PooledConnection<M>) -> Result<(), PoolError> {
        let Some(entry) = conn.entry.take() else {
            return Err(PoolError::BindingInUse);
        };
        let connection_id = entry.meta.id;

        let mut bindings = self.inner.bindings.lock();
        if bindings.contains_key(&ctx) {
            drop(bindings);
            // Auto-commit is already off on this connection.
            self.inner.discard(entry);
            return Err(PoolError::TransactionActive);
        }
        bindings.insert(
            ctx,
            Binding {
                slot: Some(entry),
                connection_id,
            },
        );
        Ok(())
    }

    /// Remove `ctx`'s binding and return its connection.
    ///
    /// The handle comes back dirty: dropping it closes the connection until
    /// [`PooledConnection::mark_clean`] is called. Returns `None` if `ctx` has
    /// no binding. Fails with
    /// [`PoolError::BindingInUse`], keeping the binding, while a bound handle
    /// still has the connection checked out.
    pub(crate) fn unbind(&self, ctx: ContextId) -> Result<Option<PooledConnection<M>>, PoolError> {
        let mut bindings = self.inner.bindings.lock();
        let MapEntry::Occupied(binding) = bindings.entry(ctx) else {
            return Ok(None);
        };
        if binding.get().slot.is_none() {
            return Err(PoolError::BindingInUse);
        }
        let entry = binding.remove().slot;
        drop(bindings);

        Ok(entry.map(|entry| PooledConnection {
            pool: Arc::clone(&self.inner),
            entry: Some(entry),
            kind: HandleKind::Dirty,
        }))
    }

    /// Drop `ctx`'s binding without finishing its transaction.
    ///
    /// The connection is closed rather than pooled, since it may still carry
    /// uncommitted work.
    pub(crate) fn abandon(&self, ctx: ContextId) {
        let removed = self.inner.bindings.lock().remove(&ctx);
        let Some(binding) = removed else {
            return;
        };

        tracing::warn!(
            context_id = %ctx,
            connection_id = binding.connection_id,
            "abandoning unfinished transaction"
        );
        if let Some(entry) = binding.slot {
            self.inner.discard(entry);
        }
    }

    pub(crate) fn is_bound(&self, ctx: ContextId) -> bool {
        self.inner.bindings.lock().contains_key(&ctx)
    }

    pub(crate) fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let (idle, outstanding, is_closed) = {
            let state = self.inner.state.lock();
            (state.idle.len() as u32, state.outstanding, state.closed)
        };
        let bound = self.inner.bindings.lock().len() as u32;

        PoolStatus {
            idle,
            in_use: outstanding.saturating_sub(idle),
            bound,
            outstanding,
            max: self.inner.config.max_size,
            created: self.inner.created.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
            is_closed,
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed immediately and waiting callers fail with
    /// [`PoolError::Closed`]. Connections that are lent out stay open until
    /// they are released, at which point they are closed instead of pooled.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.outstanding = state.outstanding.saturating_sub(drained.len() as u32);
            drained
        };

        let count = drained.len();
        for entry in drained {
            self.inner.close_physical(entry);
        }
        self.inner.available.notify_waiters();

        tracing::info!(closed_idle = count, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ConnectionManager> PoolInner<M> {
    fn checkout(&self) -> Result<Checkout<M::Connection>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(entry) = state.idle.pop_front() {
            return Ok(Checkout::Idle(entry));
        }
        if state.outstanding < self.config.max_size {
            state.outstanding += 1;
            return Ok(Checkout::Reserved);
        }
        Ok(Checkout::Exhausted)
    }

    fn new_entry(&self, conn: M::Connection) -> Entry<M::Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = id, "opened new connection");
        Entry::new(id, conn)
    }

    /// Return an ordinary connection to the idle queue, or close it.
    fn checkin(&self, mut entry: Entry<M::Connection>) {
        if !self.manager.is_valid(&entry.conn) {
            tracing::debug!(connection_id = entry.meta.id, "discarding invalid connection on release");
            self.discard(entry);
            return;
        }

        entry.meta.mark_checkin();
        let rejected = {
            let mut state = self.state.lock();
            if state.closed || state.idle.len() >= self.config.max_size as usize {
                state.release_slot();
                Some(entry)
            } else {
                state.idle.push_back(entry);
                None
            }
        };

        if let Some(entry) = rejected {
            self.close_physical(entry);
        } else {
            tracing::trace!("connection returned to pool");
        }
        self.available.notify_one();
    }

    /// Put a bound connection back into its context's binding.
    fn park(&self, ctx: ContextId, mut entry: Entry<M::Connection>) {
        let mut bindings = self.bindings.lock();
        if let Some(binding) = bindings.get_mut(&ctx) {
            if binding.slot.is_none() && binding.connection_id == entry.meta.id {
                entry.meta.mark_checkin();
                binding.slot = Some(entry);
                return;
            }
        }
        drop(bindings);

        tracing::warn!(
            context_id = %ctx,
            connection_id = entry.meta.id,
            "bound connection returned after its transaction ended, closing"
        );
        self.discard(entry);
    }

    /// Close a connection and free its slot.
    fn discard(&self, entry: Entry<M::Connection>) {
        self.state.lock().release_slot();
        self.close_physical(entry);
        self.available.notify_one();
    }

    fn close_physical(&self, entry: Entry<M::Connection>) {
        tracing::debug!(connection_id = entry.meta.id, "closing connection");
        self.manager.close(entry.conn);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub idle: u32,
    /// Number of connections currently lent out, bound ones included.
    pub in_use: u32,
    /// Number of active transaction bindings.
    pub bound: u32,
    /// Number of live connections (idle plus in use).
    pub outstanding: u32,
    /// Maximum allowed connections.
    pub max: u32,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections physically closed over the pool's lifetime.
    pub closed: u64,
    /// Whether the pool has been closed.
    pub is_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Owned,
    Bound(ContextId),
    /// Session state may differ from a fresh connection; never pooled.
    Dirty,
}

/// A connection retrieved from the pool.
///
/// Dropping the handle, or calling [`release`](Self::release), is the
/// caller's "done with this connection" signal. For an ordinary handle the
/// connection goes back to the pool. For a handle lent from a transaction
/// binding, the connection stays with the transaction until it is committed
/// or rolled back.
pub struct PooledConnection<M: ConnectionManager> {
    pool: Arc<PoolInner<M>>,
    /// Always `Some` until the handle is released.
    entry: Option<Entry<M::Connection>>,
    kind: HandleKind,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Metadata about the underlying physical connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry_ref().meta
    }

    /// Whether this handle lends a transaction-bound connection.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        matches!(self.kind, HandleKind::Bound(_))
    }

    /// Signal that the caller is done with the connection.
    ///
    /// Equivalent to dropping the handle.
    pub fn release(mut self) {
        self.return_to_pool();
    }

    /// Detach the connection from the pool.
    ///
    /// The connection no longer counts against the pool's capacity and will
    /// not be returned when dropped. Bound connections cannot be detached;
    /// the handle is given back unchanged.
    pub fn detach(mut self) -> Result<M::Connection, Self> {
        if self.kind != HandleKind::Owned {
            return Err(self);
        }
        match self.entry.take() {
            Some(entry) => {
                self.pool.state.lock().release_slot();
                self.pool.available.notify_one();
                tracing::debug!(connection_id = entry.meta.id, "connection detached from pool");
                Ok(entry.conn)
            }
            None => Err(self),
        }
    }

    /// Mark the session state as unknown until [`mark_clean`](Self::mark_clean).
    pub(crate) fn mark_dirty(&mut self) {
        if self.kind == HandleKind::Owned {
            self.kind = HandleKind::Dirty;
        }
    }

    pub(crate) fn mark_clean(&mut self) {
        if self.kind == HandleKind::Dirty {
            self.kind = HandleKind::Owned;
        }
    }

    /// Close the connection instead of returning it.
    pub(crate) fn discard(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.discard(entry);
        }
    }

    fn return_to_pool(&mut self) {
        if let Some(entry) = self.entry.take() {
            match self.kind {
                HandleKind::Owned => self.pool.checkin(entry),
                HandleKind::Bound(ctx) => self.pool.park(ctx, entry),
                HandleKind::Dirty => {
                    tracing::debug!(
                        connection_id = entry.meta.id,
                        "closing connection left in an unknown transaction state"
                    );
                    self.pool.discard(entry);
                }
            }
        }
    }

    #[allow(clippy::expect_used)]
    fn entry_ref(&self) -> &Entry<M::Connection> {
        self.entry
            .as_ref()
            .expect("pooled connection accessed after release")
    }

    #[allow(clippy::expect_used)]
    fn entry_mut(&mut self) -> &mut Entry<M::Connection> {
        self.entry
            .as_mut()
            .expect("pooled connection accessed after release")
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry_ref().conn
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry_mut().conn
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.entry.as_ref().map(|e| e.meta.id))
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builder for [`Pool`].
///
/// The manager type is inferred from the argument to [`build`](Self::build).
pub struct PoolBuilder<M: ConnectionManager> {
    config: PoolConfig,
    _manager: PhantomData<fn() -> M>,
}

impl<M: ConnectionManager> PoolBuilder<M> {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            _manager: PhantomData,
        }
    }

    /// Start from an existing configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of connections created eagerly.
    #[must_use]
    pub fn initial_size(mut self, count: u32) -> Self {
        self.config.initial_size = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, count: u32) -> Self {
        self.config.max_size = count;
        self
    }

    /// Set the borrow timeout.
    #[must_use]
    pub fn borrow_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.borrow_timeout = timeout;
        self
    }

    /// Build the pool, opening the initial connections through `manager`.
    pub async fn build(self, manager: M) -> Result<Pool<M>, PoolError> {
        Pool::new(self.config, manager).await
    }
}

impl<M: ConnectionManager> Default for PoolBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ConnectionManager> Clone for PoolBuilder<M> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            _manager: PhantomData,
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for PoolBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .finish()
    }
}

//! Scripted connection manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use shelf_pool::{BoxError, ConnectionManager};
use thiserror::Error;

/// Errors produced by the mock manager's failure injection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// Connect was scripted to fail.
    #[error("mock connect refused")]
    ConnectRefused,

    /// Commit was scripted to fail.
    #[error("mock commit failed on connection {0}")]
    CommitFailed(u64),

    /// Rollback was scripted to fail.
    #[error("mock rollback failed on connection {0}")]
    RollbackFailed(u64),

    /// Changing auto-commit was scripted to fail.
    #[error("mock auto-commit change failed on connection {0}")]
    AutoCommitFailed(u64),
}

/// A fake physical connection.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    auto_commit: bool,
}

impl MockConnection {
    /// Identifier assigned by the manager, unique per manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection is in auto-commit mode.
    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    connects: AtomicU32,
    fail_connects: AtomicU32,
    fail_all_connects: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    fail_auto_commit: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    finish_delay: Mutex<Option<Duration>>,
    auto_commit_delay: Mutex<Option<Duration>>,
    connect_limit: Mutex<Option<u32>>,
    dead: Mutex<HashSet<u64>>,
    closes: Mutex<HashMap<u64, u32>>,
    commits: Mutex<Vec<u64>>,
    rollbacks: Mutex<Vec<u64>>,
}

/// In-memory [`ConnectionManager`] with observable side effects.
///
/// Clones share state, so a test can hand one clone to the pool and keep
/// another for assertions.
#[derive(Clone, Default)]
pub struct MockManager {
    shared: Arc<Shared>,
}

impl MockManager {
    /// Create a manager whose connections are always healthy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for a scripted manager.
    #[must_use]
    pub fn builder() -> MockManagerBuilder {
        MockManagerBuilder::default()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of times connection `id` was closed.
    #[must_use]
    pub fn close_count(&self, id: u64) -> u32 {
        self.shared.closes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Total number of closes across all connections.
    #[must_use]
    pub fn total_closes(&self) -> u32 {
        self.shared.closes.lock().values().sum()
    }

    /// Connection ids that were committed, in order.
    #[must_use]
    pub fn commits(&self) -> Vec<u64> {
        self.shared.commits.lock().clone()
    }

    /// Connection ids that were rolled back, in order.
    #[must_use]
    pub fn rollbacks(&self) -> Vec<u64> {
        self.shared.rollbacks.lock().clone()
    }

    /// Mark connection `id` as broken; `is_valid` reports false from now on.
    pub fn kill(&self, id: u64) {
        self.shared.dead.lock().insert(id);
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Make every connect fail (or succeed again).
    pub fn set_fail_connects(&self, fail: bool) {
        self.shared.fail_all_connects.store(fail, Ordering::SeqCst);
    }

    /// Make commits fail (or succeed again).
    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Make rollbacks fail (or succeed again).
    pub fn set_fail_rollback(&self, fail: bool) {
        self.shared.fail_rollback.store(fail, Ordering::SeqCst);
    }

    /// Make auto-commit changes fail (or succeed again).
    pub fn set_fail_auto_commit(&self, fail: bool) {
        self.shared.fail_auto_commit.store(fail, Ordering::SeqCst);
    }

    /// Allow at most `limit` successful connects in total; later ones fail.
    pub fn set_connect_limit(&self, limit: Option<u32>) {
        *self.shared.connect_limit.lock() = limit;
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Delay every commit and rollback by `delay`.
    pub fn set_finish_delay(&self, delay: Option<Duration>) {
        *self.shared.finish_delay.lock() = delay;
    }

    /// Delay every auto-commit change by `delay`.
    pub fn set_auto_commit_delay(&self, delay: Option<Duration>) {
        *self.shared.auto_commit_delay.lock() = delay;
    }

    fn take_scripted_failure(&self) -> bool {
        if self.shared.fail_all_connects.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(limit) = *self.shared.connect_limit.lock() {
            if self.connect_count() >= limit {
                return true;
            }
        }
        self.shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn pause(delay: &Mutex<Option<Duration>>) {
    let delay = *delay.lock();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

impl std::fmt::Debug for MockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockManager")
            .field("connects", &self.connect_count())
            .field("closes", &self.total_closes())
            .finish()
    }
}

#[async_trait::async_trait]
impl ConnectionManager for MockManager {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, BoxError> {
        pause(&self.shared.connect_delay).await;

        if self.take_scripted_failure() {
            tracing::trace!("mock connect refused");
            return Err(Box::new(MockError::ConnectRefused));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id, "mock connection opened");
        Ok(MockConnection {
            id,
            auto_commit: true,
        })
    }

    fn is_valid(&self, conn: &MockConnection) -> bool {
        !self.shared.dead.lock().contains(&conn.id)
    }

    fn close(&self, conn: MockConnection) {
        *self.shared.closes.lock().entry(conn.id).or_insert(0) += 1;
        tracing::trace!(id = conn.id, "mock connection closed");
    }

    async fn set_auto_commit(
        &self,
        conn: &mut MockConnection,
        enabled: bool,
    ) -> Result<(), BoxError> {
        pause(&self.shared.auto_commit_delay).await;
        if self.shared.fail_auto_commit.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::AutoCommitFailed(conn.id)));
        }
        conn.auto_commit = enabled;
        Ok(())
    }

    async fn commit(&self, conn: &mut MockConnection) -> Result<(), BoxError> {
        pause(&self.shared.finish_delay).await;
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::CommitFailed(conn.id)));
        }
        self.shared.commits.lock().push(conn.id);
        Ok(())
    }

    async fn rollback(&self, conn: &mut MockConnection) -> Result<(), BoxError> {
        pause(&self.shared.finish_delay).await;
        if self.shared.fail_rollback.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::RollbackFailed(conn.id)));
        }
        self.shared.rollbacks.lock().push(conn.id);
        Ok(())
    }
}

/// Builder for [`MockManager`].
#[derive(Debug, Default)]
pub struct MockManagerBuilder {
    fail_connects: u32,
    connect_limit: Option<u32>,
    connect_delay: Option<Duration>,
}

impl MockManagerBuilder {
    /// Fail the first `count` connects.
    #[must_use]
    pub fn with_failed_connects(mut self, count: u32) -> Self {
        self.fail_connects = count;
        self
    }

    /// Allow only `limit` successful connects.
    #[must_use]
    pub fn with_connect_limit(mut self, limit: u32) -> Self {
        self.connect_limit = Some(limit);
        self
    }

    /// Delay every connect by `delay`.
    #[must_use]
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Build the manager.
    #[must_use]
    pub fn build(self) -> MockManager {
        let manager = MockManager::new();
        manager.fail_next_connects(self.fail_connects);
        manager.set_connect_limit(self.connect_limit);
        manager.set_connect_delay(self.connect_delay);
        manager
    }
}

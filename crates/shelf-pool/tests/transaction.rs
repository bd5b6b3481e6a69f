//! Transaction binding tests.
//!
//! ```bash
//! cargo test -p shelf-pool --test transaction
//! ```

use std::time::Duration;

use shelf_pool::{ExecutionContext, Pool, PoolError, PoolStatus, TransactionManager};
use shelf_pool_testing::MockManager;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn setup(
    initial: u32,
    max: u32,
) -> (Pool<MockManager>, TransactionManager<MockManager>, MockManager) {
    init_tracing();
    let manager = MockManager::new();
    let pool = Pool::builder()
        .initial_size(initial)
        .max_size(max)
        .borrow_timeout(Duration::from_millis(200))
        .build(manager.clone())
        .await
        .expect("Failed to create pool");
    let tx = TransactionManager::new(pool.clone());
    (pool, tx, manager)
}

/// Error type of a service built on the pool.
#[derive(Debug)]
enum LendingError {
    Pool(PoolError),
    CopyUnavailable,
}

impl From<PoolError> for LendingError {
    fn from(err: PoolError) -> Self {
        Self::Pool(err)
    }
}

// =============================================================================
// Binding
// =============================================================================

#[tokio::test]
async fn test_transaction_reuses_bound_connection() {
    let (pool, tx, manager) = setup(2, 2).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    assert!(tx.is_active(&ctx));
    assert_eq!(pool.status().bound, 1);
    assert_eq!(pool.status().idle, 1);

    let first = pool.acquire(&ctx).await.expect("acquire 1");
    assert!(first.is_bound());
    assert!(!first.auto_commit());
    let bound_id = first.id();
    drop(first);
    assert_eq!(pool.status().idle, 1, "release of a bound handle is suppressed");

    let second = pool.acquire(&ctx).await.expect("acquire 2");
    assert_eq!(second.id(), bound_id);
    second.release();
    assert_eq!(pool.status().idle, 1);

    tx.commit(&ctx).await.expect("commit");
    assert!(!tx.is_active(&ctx));
    assert_eq!(manager.commits(), vec![bound_id]);

    let status = pool.status();
    assert_eq!(status.idle, 2);
    assert_eq!(status.bound, 0);
    assert_eq!(status.outstanding, 2);
}

#[tokio::test]
async fn test_transaction_isolated_per_context() {
    let (pool, tx, _manager) = setup(2, 2).await;
    let ctx1 = ExecutionContext::new();
    let ctx2 = ExecutionContext::new();

    tx.begin(&ctx1).await.expect("begin");
    let bound = pool.acquire(&ctx1).await.expect("acquire bound");
    let other = pool.acquire(&ctx2).await.expect("acquire other");

    assert_ne!(bound.id(), other.id());
    assert!(!other.is_bound());
    assert!(!tx.is_active(&ctx2));
}

#[tokio::test]
async fn test_transaction_connection_reused_after_commit() {
    let (pool, tx, _manager) = setup(1, 1).await;
    let ctx1 = ExecutionContext::new();
    let ctx2 = ExecutionContext::new();

    tx.begin(&ctx1).await.expect("begin");
    let bound_id = pool.acquire(&ctx1).await.expect("acquire").id();

    // The only connection belongs to ctx1's transaction.
    let err = pool.acquire(&ctx2).await.expect_err("pool is exhausted");
    assert!(err.is_timeout());

    tx.commit(&ctx1).await.expect("commit");

    let conn = pool.acquire(&ctx2).await.expect("acquire after commit");
    assert_eq!(conn.id(), bound_id);
    assert!(conn.auto_commit(), "auto-commit is restored on release");
}

#[tokio::test]
async fn test_transaction_rollback() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let id = pool.acquire(&ctx).await.expect("acquire").id();
    tx.rollback(&ctx).await.expect("rollback");

    assert_eq!(manager.rollbacks(), vec![id]);
    assert!(manager.commits().is_empty());
    assert_eq!(pool.status().idle, 1);
    assert_eq!(pool.status().bound, 0);
}

#[tokio::test]
async fn test_finish_without_transaction_is_noop() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tokio_test::assert_ok!(tx.commit(&ctx).await);
    tokio_test::assert_ok!(tx.rollback(&ctx).await);

    assert!(manager.commits().is_empty());
    assert!(manager.rollbacks().is_empty());
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_nested_begin_rejected() {
    let (pool, tx, _manager) = setup(2, 2).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let bound_id = pool.acquire(&ctx).await.expect("acquire").id();

    let err = tx.begin(&ctx).await.expect_err("nested begin");
    assert!(matches!(err, PoolError::TransactionActive));

    // The running transaction and its connection are untouched.
    let status = pool.status();
    assert_eq!(status.bound, 1);
    assert_eq!(status.outstanding, 2);
    assert_eq!(status.idle, 1);
    assert_eq!(pool.acquire(&ctx).await.expect("acquire").id(), bound_id);

    tx.commit(&ctx).await.expect("commit");
    assert_eq!(pool.status().idle, 2);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_begin_timeout_leaves_no_binding() {
    let (pool, tx, _manager) = setup(1, 1).await;
    let holder = ExecutionContext::new();
    let ctx = ExecutionContext::new();

    let _held = pool.acquire(&holder).await.expect("acquire");

    let err = tx.begin(&ctx).await.expect_err("pool is exhausted");
    assert!(err.is_timeout());
    assert!(!tx.is_active(&ctx));
    assert_eq!(pool.status().bound, 0);
}

#[tokio::test]
async fn test_begin_auto_commit_failure_returns_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    manager.set_fail_auto_commit(true);
    let err = tx.begin(&ctx).await.expect_err("auto-commit change fails");

    assert!(matches!(
        err,
        PoolError::Transaction {
            operation: "disable auto-commit",
            ..
        }
    ));
    assert!(!tx.is_active(&ctx));
    let status = pool.status();
    assert_eq!(status.idle, 1);
    assert_eq!(status.outstanding, 1);
}

#[tokio::test]
async fn test_commit_failure_still_releases() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    manager.set_fail_commit(true);

    let err = tx.commit(&ctx).await.expect_err("commit fails");
    assert!(matches!(err, PoolError::Transaction { operation: "commit", .. }));

    assert!(!tx.is_active(&ctx));
    let status = pool.status();
    assert_eq!(status.bound, 0);
    assert_eq!(status.idle, 1);
}

#[tokio::test]
async fn test_restore_auto_commit_failure_discards_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let id = pool.acquire(&ctx).await.expect("acquire").id();
    manager.set_fail_auto_commit(true);

    tx.commit(&ctx).await.expect("the commit itself succeeded");

    assert_eq!(manager.commits(), vec![id]);
    assert_eq!(manager.close_count(id), 1);
    assert_eq!(pool.status().outstanding, 0);
}

#[tokio::test]
async fn test_bound_connection_lent_once_at_a_time() {
    let (pool, tx, _manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let held = pool.acquire(&ctx).await.expect("acquire");

    let err = pool.acquire(&ctx).await.expect_err("already checked out");
    assert!(matches!(err, PoolError::BindingInUse));

    let err = tx.commit(&ctx).await.expect_err("handle still alive");
    assert!(matches!(err, PoolError::BindingInUse));
    assert!(tx.is_active(&ctx));

    drop(held);
    tx.commit(&ctx).await.expect("commit");
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_bound_handle_cannot_be_detached() {
    let (pool, tx, _manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let conn = pool.acquire(&ctx).await.expect("acquire");
    let conn = conn.detach().expect_err("bound handles stay with the transaction");
    drop(conn);

    tx.rollback(&ctx).await.expect("rollback");
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_transaction_survives_pool_close() {
    let (pool, tx, manager) = setup(2, 2).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    let id = pool.acquire(&ctx).await.expect("acquire").id();

    pool.close();
    assert_eq!(pool.acquire(&ctx).await.expect("bound acquire").id(), id);

    tx.commit(&ctx).await.expect("commit");
    assert_eq!(manager.commits(), vec![id]);
    assert_eq!(manager.close_count(id), 1);
    assert_eq!(pool.status().outstanding, 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancelled_commit_closes_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();
    let other = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    manager.set_finish_delay(Some(Duration::from_millis(200)));
    let outcome = tokio::time::timeout(Duration::from_millis(20), tx.commit(&ctx)).await;
    assert!(outcome.is_err());

    assert!(!tx.is_active(&ctx));
    assert!(manager.commits().is_empty());
    assert_eq!(manager.close_count(1), 1, "open transaction must not be pooled");
    assert_eq!(pool.status().outstanding, 0);

    let conn = pool.acquire(&other).await.expect("acquire");
    assert_eq!(conn.id(), 2);
    assert!(conn.auto_commit());
}

#[tokio::test]
async fn test_cancelled_rollback_closes_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    manager.set_finish_delay(Some(Duration::from_millis(200)));
    let outcome = tokio::time::timeout(Duration::from_millis(20), tx.rollback(&ctx)).await;
    assert!(outcome.is_err());

    assert!(!tx.is_active(&ctx));
    assert!(manager.rollbacks().is_empty());
    assert_eq!(manager.close_count(1), 1);
    assert_eq!(pool.status().idle, 0);
    assert_eq!(pool.status().outstanding, 0);
}

#[tokio::test]
async fn test_cancelled_auto_commit_restore_closes_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    tx.begin(&ctx).await.expect("begin");
    manager.set_auto_commit_delay(Some(Duration::from_millis(200)));
    let outcome = tokio::time::timeout(Duration::from_millis(20), tx.commit(&ctx)).await;
    assert!(outcome.is_err());

    assert_eq!(manager.commits(), vec![1], "the commit itself went through");
    assert_eq!(manager.close_count(1), 1);
    assert_eq!(pool.status().outstanding, 0);
}

#[tokio::test]
async fn test_cancelled_begin_closes_connection() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    manager.set_auto_commit_delay(Some(Duration::from_millis(200)));
    let outcome = tokio::time::timeout(Duration::from_millis(20), tx.begin(&ctx)).await;
    assert!(outcome.is_err());

    assert!(!tx.is_active(&ctx));
    assert_eq!(manager.close_count(1), 1);
    assert_eq!(pool.status().outstanding, 0);

    manager.set_auto_commit_delay(None);
    let conn = pool.acquire(&ctx).await.expect("acquire");
    assert_eq!(conn.id(), 2);
    assert!(conn.auto_commit());
}

#[tokio::test]
async fn test_in_transaction_cancelled_during_commit() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    manager.set_finish_delay(Some(Duration::from_millis(200)));
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        tx.in_transaction(&ctx, async {
            let _order = pool.acquire(&ctx).await?;
            Ok::<_, PoolError>(())
        }),
    )
    .await;
    assert!(outcome.is_err());

    assert!(!tx.is_active(&ctx));
    assert!(manager.commits().is_empty());
    assert_eq!(manager.close_count(1), 1);
    assert_eq!(pool.status().outstanding, 0);
}

// =============================================================================
// Concurrency
// =============================================================================

fn assert_consistent(status: PoolStatus, max: u32) {
    assert!(status.outstanding <= max, "over capacity: {status:?}");
    assert!(status.idle < status.outstanding, "a held connection counted idle: {status:?}");
    assert!(status.in_use >= 1, "{status:?}");
    assert!(status.bound <= max, "{status:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_workload_keeps_accounting_consistent() {
    init_tracing();
    let manager = MockManager::builder()
        .with_connect_delay(Duration::from_millis(5))
        .build();
    let pool = Pool::builder()
        .initial_size(0)
        .max_size(4)
        .borrow_timeout(Duration::from_secs(5))
        .build(manager.clone())
        .await
        .expect("Failed to create pool");
    let tx = TransactionManager::new(pool.clone());

    let mut handles = Vec::new();
    for i in 0..12 {
        let pool = pool.clone();
        let tx = tx.clone();

        handles.push(tokio::spawn(async move {
            let ctx = ExecutionContext::new();
            if i % 2 == 0 {
                tx.in_transaction(&ctx, async {
                    let copy = pool.acquire(&ctx).await?;
                    assert_consistent(pool.status(), 4);
                    let copy_id = copy.id();
                    drop(copy);

                    tokio::time::sleep(Duration::from_millis(10)).await;

                    let order = pool.acquire(&ctx).await?;
                    assert_eq!(order.id(), copy_id);
                    assert_consistent(pool.status(), 4);
                    Ok::<_, PoolError>(())
                })
                .await
                .expect("transaction");
            } else {
                let conn = pool.acquire(&ctx).await.expect("acquire");
                assert!(conn.auto_commit(), "pooled connection left mid-transaction");
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_consistent(pool.status(), 4);
            }
        }));
    }

    for handle in handles {
        handle.await.expect("Task panicked");
    }

    assert!(manager.connect_count() <= 4, "created {}", manager.connect_count());
    assert_eq!(manager.commits().len(), 6);

    let status = pool.status();
    assert_eq!(status.bound, 0);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.outstanding, status.idle);
}

// =============================================================================
// Scoped transactions
// =============================================================================

#[tokio::test]
async fn test_in_transaction_commits_on_success() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    let id = tx
        .in_transaction(&ctx, async {
            let copy = pool.acquire(&ctx).await?;
            let copy_id = copy.id();
            drop(copy);
            let order = pool.acquire(&ctx).await?;
            assert_eq!(order.id(), copy_id);
            Ok::<_, PoolError>(copy_id)
        })
        .await
        .expect("transaction");

    assert_eq!(manager.commits(), vec![id]);
    assert!(manager.rollbacks().is_empty());
    assert!(!tx.is_active(&ctx));
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_in_transaction_rolls_back_on_error() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    let result: Result<(), LendingError> = tx
        .in_transaction(&ctx, async {
            let _copy = pool.acquire(&ctx).await?;
            Err::<(), _>(LendingError::CopyUnavailable)
        })
        .await;

    assert!(matches!(result, Err(LendingError::CopyUnavailable)));
    assert!(manager.commits().is_empty());
    assert_eq!(manager.rollbacks().len(), 1);
    assert!(!tx.is_active(&ctx));
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_in_transaction_begin_failure() {
    let (pool, tx, manager) = setup(0, 1).await;
    let ctx = ExecutionContext::new();

    manager.fail_next_connects(1);
    let result: Result<(), LendingError> = tx.in_transaction(&ctx, async { Ok(()) }).await;

    assert!(matches!(result, Err(LendingError::Pool(PoolError::Creation(_)))));
    assert_eq!(pool.status().outstanding, 0);
}

#[tokio::test]
async fn test_in_transaction_cancelled_abandons_binding() {
    let (pool, tx, manager) = setup(1, 1).await;
    let ctx = ExecutionContext::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        tx.in_transaction(&ctx, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, PoolError>(())
        }),
    )
    .await;
    assert!(outcome.is_err());

    assert!(!tx.is_active(&ctx));
    assert!(manager.commits().is_empty());
    assert_eq!(manager.close_count(1), 1, "uncommitted work is discarded");
    assert_eq!(pool.status().outstanding, 0);

    let conn = pool.acquire(&ctx).await.expect("capacity was reclaimed");
    assert_eq!(conn.id(), 2);
}

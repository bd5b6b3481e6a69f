//! Lending desk example.
//!
//! Issues book copies to members. Each loan marks a copy as issued and
//! records an order; both writes happen in one transaction, so they share a
//! single pooled connection without it being passed between the two calls.
//!
//! The example runs against the in-memory manager from `shelf-pool-testing`,
//! so no database is needed.
//!
//! # Running
//!
//! ```bash
//! cargo run -p shelf-pool --example lending_desk
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use shelf_pool::{ExecutionContext, Pool, PoolError, TransactionManager};
use shelf_pool_testing::MockManager;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
enum LoanError {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("copy {0} is already issued")]
    CopyUnavailable(u32),
}

/// Data-access object for book copies.
struct Copies {
    pool: Pool<MockManager>,
}

impl Copies {
    async fn mark_issued(&self, ctx: &ExecutionContext, copy: u32) -> Result<u64, LoanError> {
        let conn = self.pool.acquire(ctx).await?;
        // Every third copy is out on loan already.
        if copy % 3 == 0 {
            return Err(LoanError::CopyUnavailable(copy));
        }
        println!("    copy {copy} marked issued on connection {}", conn.id());
        Ok(conn.id())
    }
}

/// Data-access object for loan orders.
struct Orders {
    pool: Pool<MockManager>,
}

impl Orders {
    async fn insert(&self, ctx: &ExecutionContext, member: &str, copy: u32) -> Result<u64, LoanError> {
        let conn = self.pool.acquire(ctx).await?;
        println!("    order for {member} / copy {copy} saved on connection {}", conn.id());
        Ok(conn.id())
    }
}

struct LendingDesk {
    tx: TransactionManager<MockManager>,
    copies: Copies,
    orders: Orders,
}

impl LendingDesk {
    fn new(pool: &Pool<MockManager>) -> Self {
        Self {
            tx: TransactionManager::new(pool.clone()),
            copies: Copies { pool: pool.clone() },
            orders: Orders { pool: pool.clone() },
        }
    }

    /// Issue a copy with explicit begin/commit/rollback.
    async fn issue(&self, member: &str, copy: u32) -> Result<(), LoanError> {
        let ctx = ExecutionContext::new();
        self.tx.begin(&ctx).await?;

        let result = async {
            let copy_conn = self.copies.mark_issued(&ctx, copy).await?;
            let order_conn = self.orders.insert(&ctx, member, copy).await?;
            assert_eq!(copy_conn, order_conn);
            Ok::<_, LoanError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.tx.commit(&ctx).await?;
                Ok(())
            }
            Err(e) => {
                self.tx.rollback(&ctx).await?;
                Err(e)
            }
        }
    }

    /// Issue a copy through the scoped helper.
    async fn issue_scoped(&self, member: &str, copy: u32) -> Result<(), LoanError> {
        let ctx = ExecutionContext::new();
        self.tx
            .in_transaction(&ctx, async {
                self.copies.mark_issued(&ctx, copy).await?;
                self.orders.insert(&ctx, member, copy).await?;
                Ok::<_, LoanError>(())
            })
            .await
    }
}

fn print_pool_status(pool: &Pool<MockManager>) {
    let status = pool.status();
    println!(
        "  Pool: {} idle, {} in use, {} bound, {}/{} outstanding",
        status.idle, status.in_use, status.bound, status.outstanding, status.max
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("=== Lending Desk Example ===\n");

    let manager = MockManager::builder()
        .with_connect_delay(Duration::from_millis(5))
        .build();
    let pool = Pool::builder()
        .initial_size(2)
        .max_size(4)
        .borrow_timeout(Duration::from_secs(2))
        .build(manager.clone())
        .await?;
    print_pool_status(&pool);

    let desk = Arc::new(LendingDesk::new(&pool));

    println!("\n1. Explicit transaction:");
    desk.issue("ada", 1).await?;
    print_pool_status(&pool);

    println!("\n2. Failed loan is rolled back:");
    match desk.issue("grace", 3).await {
        Ok(()) => println!("  unexpected success"),
        Err(e) => println!("  loan refused: {e}"),
    }
    print_pool_status(&pool);

    println!("\n3. Scoped transaction:");
    desk.issue_scoped("linus", 2).await?;
    print_pool_status(&pool);

    println!("\n4. Concurrent loans (8 members, 4 connections):");
    let start = Instant::now();
    let mut handles = vec![];
    for copy in 10..18 {
        let desk = Arc::clone(&desk);
        handles.push(tokio::spawn(async move {
            desk.issue_scoped(&format!("member-{copy}"), copy).await
        }));
    }

    let mut issued = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            issued += 1;
        }
    }
    println!("  Issued {issued} of 8 loans in {:?}", start.elapsed());
    print_pool_status(&pool);

    println!("\n5. Summary:");
    println!("  Connections opened: {}", manager.connect_count());
    println!("  Commits: {}", manager.commits().len());
    println!("  Rollbacks: {}", manager.rollbacks().len());

    pool.close();
    println!("\nPool closed, {} connections closed", manager.total_closes());

    Ok(())
}

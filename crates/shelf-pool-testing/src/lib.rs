//! # shelf-pool-testing
//!
//! Test infrastructure for `shelf-pool`.
//!
//! This crate provides a scripted, in-memory [`ConnectionManager`] so pool
//! and transaction behaviour can be exercised without a database.
//!
//! ## Features
//!
//! - Counts every connect, close, commit and rollback
//! - Per-connection liveness that tests can flip to simulate dropped sessions
//! - Failure injection for connect, commit, rollback and auto-commit
//! - Optional connect latency to widen race windows
//!
//! ## Example
//!
//! ```rust,ignore
//! use shelf_pool::{ExecutionContext, Pool};
//! use shelf_pool_testing::MockManager;
//!
//! #[tokio::test]
//! async fn test_with_mock_manager() {
//!     let manager = MockManager::new();
//!     let pool = Pool::builder()
//!         .initial_size(1)
//!         .build(manager.clone())
//!         .await
//!         .unwrap();
//!
//!     let conn = pool.acquire(&ExecutionContext::new()).await.unwrap();
//!     assert_eq!(manager.connect_count(), 1);
//!     manager.kill(conn.id());
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod manager;

pub use manager::{MockConnection, MockError, MockManager, MockManagerBuilder};

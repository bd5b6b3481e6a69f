//! # shelf-pool
//!
//! Bounded connection pool with transaction-scoped connection binding.
//!
//! The pool lends a limited number of expensive connections to concurrent
//! callers, validates idle connections before reuse, and waits with a
//! timeout when every connection is in use. On top of it,
//! [`TransactionManager`] binds one physical connection to an
//! [`ExecutionContext`] so that every data-access call made inside a
//! transaction reuses it without the connection being passed around.
//!
//! ## Features
//!
//! - Eager creation of an initial set of connections, lazy growth up to a cap
//! - Validation on checkout and checkin, transparent replacement of dead
//!   connections
//! - Borrow timeout and explicit cancellation of waiting callers
//! - Per-context transaction binding with commit/rollback and
//!   release-suppression for bound handles
//! - Properties-file configuration with documented defaults
//!
//! ## Example
//!
//! ```rust,ignore
//! use shelf_pool::{ExecutionContext, Pool, PoolConfig, TransactionManager};
//!
//! let pool = Pool::builder()
//!     .initial_size(5)
//!     .max_size(20)
//!     .borrow_timeout(Duration::from_secs(30))
//!     .build(manager)
//!     .await?;
//!
//! let ctx = ExecutionContext::new();
//! let conn = pool.acquire(&ctx).await?;
//! // Use connection...
//! // Connection automatically returned to pool on drop
//!
//! let tx = TransactionManager::new(pool.clone());
//! tx.in_transaction(&ctx, async {
//!     let conn = pool.acquire(&ctx).await?; // the transaction's connection
//!     // ...
//!     Ok::<_, PoolError>(())
//! })
//! .await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod transaction;

pub use config::{DataSourceConfig, PoolConfig, Settings};
pub use context::{ContextId, ExecutionContext};
pub use error::{BoxError, PoolError};
pub use lifecycle::{ConnectionManager, ConnectionMetadata};
pub use pool::{Pool, PoolBuilder, PoolStatus, PooledConnection};
pub use transaction::TransactionManager;

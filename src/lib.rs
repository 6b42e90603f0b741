//! # RowFlow - Serialized Transactions over SQLite
//!
//! RowFlow runs units of database work against one SQLite connection, one at
//! a time, and tells the rest of the program when they finish and what they
//! changed. It provides:
//!
//! - **Transaction descriptors**: a unit of work plus its name, native
//!   transaction flag and completion callbacks
//! - **A serial queue**: strict FIFO execution on a dedicated worker thread,
//!   with cancellation of work that has not started
//! - **Batch units of work**: save, insert, update or delete many entities
//!   with one change event
//! - **Async bridges**: futures, row streams with backpressure, and live
//!   queries that re-run after every relevant change
//! - **Change notification**: table-level listeners and broadcast
//!   subscriptions
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     DatabaseContext                             │
//! │     begin_transaction_async · transact · query_rows · observe   │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ execute()                       │ execute_sync()
//!                 ▼                                 │
//! ┌───────────────────────────────────┐             │
//! │      TransactionCoordinator       │             │
//! │   ┌───────────────────────────┐   │             │
//! │   │     TransactionQueue      │   │             │
//! │   │  (worker thread, FIFO)    │   │             │
//! │   └─────────────┬─────────────┘   │             │
//! └─────────────────┼─────────────────┘             │
//!                   ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             SharedConnection (one SQLite connection)            │
//! │          BEGIN IMMEDIATE / SAVEPOINT · ChangeNotifier           │
//! └─────────────────────────────────┬───────────────────────────────┘
//!                                   │ outcome
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Callback dispatch (inline or posted)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Serial execution**: at most one unit of work touches the connection
//!    at a time, and queued work runs in submission order
//! 2. **Atomicity**: a failing unit of work run in a native transaction
//!    leaves no trace
//! 3. **At most one callback**: each descriptor delivers one success, one
//!    error, or nothing
//! 4. **Changes before callbacks**: listeners hear about a batch's changes
//!    before its success callback runs
//!
//! ## Example
//!
//! ```rust
//! use rowflow::{DatabaseConfig, DatabaseConnection, DatabaseContext, Result};
//!
//! # fn main() -> Result<()> {
//! let ctx = DatabaseContext::builder(DatabaseConfig::in_memory("notes"))
//!     .create_table("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
//!     .open()?;
//!
//! let count = ctx.execute_transaction(|conn: &mut DatabaseConnection| -> Result<i64> {
//!     conn.execute("INSERT INTO notes (title) VALUES (?1)", ["first"])?;
//!     Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?.unwrap_or(0))
//! })?;
//!
//! assert_eq!(count, 1);
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for RowFlow operations.
pub mod error;

/// Identifiers, change events and status enums shared by every module.
pub mod types;

/// Database configuration and defaults.
pub mod config;

/// The SQLite connection wrapper, schema setup and native transactions.
pub mod connection;

/// Table change listeners and broadcast subscriptions.
pub mod notify;

/// Where completion callbacks run.
pub mod dispatch;

/// Units of work, transaction descriptors and their builder.
pub mod transaction;

/// The serial worker that executes queued descriptors.
mod queue;

/// Owns the queue for one database: submit, cancel, reset, shut down.
pub mod coordinator;

/// The per-database entry point.
pub mod context;

/// LRU entity cache kept coherent by batch operations.
pub mod cache;

/// Bulk entity operations as a single unit of work.
pub mod batch;

/// Futures over queued transactions.
pub mod bridge;

/// Streams of query results: single values, rows with backpressure, and
/// live queries.
pub mod stream;

// =============================================================================
// Re-exports
// =============================================================================

pub use batch::{BatchBuilder, BatchExt, BatchOperation, BatchUnitOfWork, EntityAdapter};
pub use cache::ModelLruCache;
pub use config::{DatabaseConfig, JournalMode, Synchronous};
pub use connection::DatabaseConnection;
pub use context::{DatabaseContext, DatabaseContextBuilder};
pub use coordinator::TransactionCoordinator;
pub use dispatch::{CallbackDispatcher, CallbackExecutor, InlineExecutor};
pub use error::{Error, Result};
pub use notify::{ChangeNotifier, ChangeObserver, ChangeSubscription, TableNotifierRegister};
pub use stream::{LiveQuery, Query, RowStream};
pub use transaction::{Transaction, TransactionBuilder, TransactionHandle, UnitOfWork};
pub use types::{
    CallbackPolicy, ChangeAction, ChangeEvent, PrimaryKey, TableId, TransactionId,
    TransactionStatus,
};

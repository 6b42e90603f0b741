//! # Error Handling for rowflow
//!
//! This module defines the error types used throughout rowflow. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which simplifies
//! error handling for library users and lets a unit of work return the same type
//! the queue, the bridges and the batch layer return.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Work failure | `Sqlite`, `Work`, `Panicked` | Delivered to the error callback |
//! | Unhandled | `ExecutionFailed` | Surfaced to the caller or the failure hook |
//! | Cancellation | `Cancelled` | Consumer stops waiting |
//! | Lifecycle | `QueueClosed`, `ReentrantTransaction` | Fix the calling code |
//! | Notification | `SubscriptionLagged` | Re-query, then keep listening |

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in rowflow operations.
///
/// # Example
///
/// ```rust
/// use rowflow::{Error, Result};
///
/// fn validate(title: &str) -> Result<()> {
///     if title.is_empty() {
///         return Err(Error::work("title must not be empty"));
///     }
///     Ok(())
/// }
///
/// assert!(validate("").is_err());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Unit of Work Failures
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// # When This Happens
    ///
    /// This wraps any error from the `rusqlite` crate raised while a unit of
    /// work talks to the connection:
    /// - Constraint violations (`UNIQUE`, `NOT NULL`, ...)
    /// - The database file is locked by another process
    /// - SQL syntax errors in adapter or query text
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// so `?` inside a unit of work converts rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A caller-defined unit of work reported a failure.
    ///
    /// Use [`Error::work`] to build one from a message or any boxed error.
    #[error("unit of work failed: {0}")]
    Work(#[source] Box<dyn StdError + Send + Sync>),

    /// A unit of work panicked.
    ///
    /// # When This Happens
    ///
    /// The queue worker and `execute_sync` run user code under
    /// `catch_unwind`. A panic is converted into this variant so the serial
    /// queue keeps draining and the native transaction is rolled back.
    #[error("transaction {transaction} panicked: {message}")]
    Panicked {
        /// Name or id of the transaction that panicked
        transaction: String,
        /// The panic payload, when it was a string
        message: String,
    },

    // =========================================================================
    // Unhandled Failures
    // =========================================================================

    /// A unit of work failed and no error callback was registered.
    ///
    /// # When This Happens
    ///
    /// `execute_sync` returns this instead of dropping the failure. On the
    /// queue path it is handed to the context's unhandled-failure hook.
    #[error("an error occurred while executing transaction {transaction}")]
    ExecutionFailed {
        /// Name or id of the failed transaction
        transaction: String,
        /// The original failure
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Cancellation and Lifecycle
    // =========================================================================

    /// The transaction was cancelled before it started.
    ///
    /// Only consumers that were still waiting see this, e.g. a `transact`
    /// future whose descriptor was cancelled by name or dropped by `reset`.
    #[error("transaction was cancelled before it started")]
    Cancelled,

    /// The transaction queue has been shut down.
    #[error("transaction queue for database '{0}' is closed")]
    QueueClosed(String),

    /// Synchronous execution was requested from inside a running unit of work.
    ///
    /// # Recovery
    ///
    /// Use the `&mut DatabaseConnection` handed to the running unit of work;
    /// nested native transactions become SAVEPOINTs.
    #[error("synchronous transaction requested while the connection is held by this thread")]
    ReentrantTransaction,

    // =========================================================================
    // Schema and Configuration
    // =========================================================================

    /// Schema version mismatch or a failed migration.
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid configuration, or a runtime resource could not be created.
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Change Notification
    // =========================================================================

    /// A change subscription fell behind and missed events.
    ///
    /// # Recovery
    ///
    /// Treat it as "something changed": re-run the dependent query and keep
    /// receiving from the same subscription.
    #[error("change subscription lagged behind by {0} events")]
    SubscriptionLagged(u64),
}

impl Error {
    /// Builds a [`Error::Work`] from a message or an existing error.
    pub fn work(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Error::Work(error.into())
    }

    /// Returns the original failure, looking through `ExecutionFailed`.
    pub fn root(&self) -> &Error {
        match self {
            Error::ExecutionFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Converts a caught panic payload into [`Error::Panicked`].
    pub(crate) fn from_panic(transaction: String, payload: Box<dyn Any + Send>) -> Self {
        Error::Panicked {
            transaction,
            message: panic_message(payload.as_ref()),
        }
    }
}

/// Extracts the message from a panic payload (`&str` or `String`).
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

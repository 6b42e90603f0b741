//! # Domain Types for rowflow
//!
//! This module defines the small value types shared by the queue, the batch
//! layer and the change notifier: table identities, primary keys, change
//! events, transaction ids and the transaction lifecycle.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! As elsewhere in the crate, primitives are wrapped in single-field structs:
//!
//! - **Type safety**: a [`TransactionId`] can't be passed where a [`PrimaryKey`] is expected
//! - **Self-documenting code**: signatures say what they expect
//! - **Encapsulation**: the representation can change without touching callers
//!
//! ## Example
//!
//! ```rust
//! use rowflow::types::{ChangeAction, ChangeEvent, PrimaryKey, TableId};
//!
//! let event = ChangeEvent::table("notes", ChangeAction::Insert)
//!     .with_keys([PrimaryKey::from_raw(1), PrimaryKey::from_raw(2)]);
//!
//! assert_eq!(event.table, TableId::new("notes"));
//! assert_eq!(event.affected_keys.map(|k| k.len()), Some(2));
//! ```

use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// Table Identification
// =============================================================================

/// The identity of a table, as used by adapters and change observers.
///
/// # Rust Pattern: Newtype
///
/// `TableId` wraps the table name. Observers register by `TableId`, adapters
/// report their `TableId`, and the notifier matches the two by equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(String);

impl TableId {
    /// Creates a table id from a table name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the table name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TableId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&TableId> for TableId {
    fn from(t: &TableId) -> Self {
        t.clone()
    }
}

// =============================================================================
// Primary Keys
// =============================================================================

/// A numeric primary key (SQLite `rowid` or an `INTEGER PRIMARY KEY` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrimaryKey(i64);

impl PrimaryKey {
    /// Creates a key from its raw value.
    pub const fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Change Events
// =============================================================================

/// The kind of write that produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// Rows were inserted.
    Insert,
    /// Rows were updated.
    Update,
    /// Rows were deleted.
    Delete,
    /// Rows were saved (inserted or updated, whichever applied per row).
    Save,
    /// The table changed in a way the writer did not classify.
    Change,
}

impl ChangeAction {
    /// Returns the lowercase action name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
            ChangeAction::Save => "save",
            ChangeAction::Change => "change",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification that rows of a table were written.
///
/// Events are published, never stored. `affected_keys` is `None` for
/// table-level notifications where the writer does not know which rows
/// changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The table that changed.
    pub table: TableId,

    /// What kind of write happened.
    pub action: ChangeAction,

    /// Keys of the rows that changed, when known.
    pub affected_keys: Option<BTreeSet<PrimaryKey>>,
}

impl ChangeEvent {
    /// Creates a table-level event with no key information.
    pub fn table(table: impl Into<TableId>, action: ChangeAction) -> Self {
        Self {
            table: table.into(),
            action,
            affected_keys: None,
        }
    }

    /// Attaches the affected keys.
    pub fn with_keys(mut self, keys: impl IntoIterator<Item = PrimaryKey>) -> Self {
        self.affected_keys = Some(keys.into_iter().collect());
        self
    }
}

// =============================================================================
// Transaction Identification and Lifecycle
// =============================================================================

/// Identifies one transaction descriptor within a database context.
///
/// Ids increase monotonically in build order. They are unique per context,
/// unlike names which are only a cancellation handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Creates an id from its raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a transaction descriptor.
///
/// ```text
///  Created ──► Pending ──► Executing ──► Completed
///     │           │                 └──► Failed
///     └───────────┴──► Cancelled
/// ```
///
/// `Cancelled` is reachable only before execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Built but not yet submitted.
    Created = 0,
    /// Submitted to the queue, waiting for the worker.
    Pending = 1,
    /// The unit of work is running.
    Executing = 2,
    /// The unit of work returned successfully.
    Completed = 3,
    /// The unit of work returned an error or panicked.
    Failed = 4,
    /// Cancelled before it started.
    Cancelled = 5,
}

impl TransactionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionStatus::Created,
            1 => TransactionStatus::Pending,
            2 => TransactionStatus::Executing,
            3 => TransactionStatus::Completed,
            4 => TransactionStatus::Failed,
            _ => TransactionStatus::Cancelled,
        }
    }

    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }
}

/// Where success and error callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackPolicy {
    /// On the thread that finished the unit of work.
    Inline,
    /// Posted to the context's callback executor (the "main" context).
    #[default]
    Posted,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id_conversions() {
        let a = TableId::new("notes");
        let b: TableId = "notes".into();
        let c: TableId = String::from("notes").into();

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.to_string(), "notes");
    }

    #[test]
    fn test_change_event_keys_are_deduplicated() {
        let event = ChangeEvent::table("notes", ChangeAction::Delete).with_keys([
            PrimaryKey::from_raw(3),
            PrimaryKey::from_raw(1),
            PrimaryKey::from_raw(3),
        ]);

        let keys: Vec<i64> = event
            .affected_keys
            .unwrap()
            .iter()
            .map(PrimaryKey::as_raw)
            .collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            TransactionStatus::Created,
            TransactionStatus::Pending,
            TransactionStatus::Executing,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
        ] {
            assert_eq!(TransactionStatus::from_u8(status as u8), status);
        }

        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Executing.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_default_callback_policy_is_posted() {
        assert_eq!(CallbackPolicy::default(), CallbackPolicy::Posted);
    }

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(TransactionId::from_raw(42).to_string(), "#42");
    }
}

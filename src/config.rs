//! # Database Configuration
//!
//! [`DatabaseConfig`] collects everything needed to open a database context:
//! where the file lives, which pragmas to apply, and the sizes of the
//! internal buffers. Every field has a default, so the usual pattern is
//! struct-update syntax or the `with_*` setters:
//!
//! ```rust
//! use std::time::Duration;
//! use rowflow::DatabaseConfig;
//!
//! let config = DatabaseConfig::in_memory("test")
//!     .with_busy_timeout(Duration::from_secs(1))
//!     .with_row_stream_prefetch(64);
//!
//! assert!(config.path.is_none());
//! assert_eq!(config.row_stream_prefetch, 64);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default busy timeout applied to the connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the change-event broadcast channel.
///
/// Subscribers that fall further behind than this see
/// `Error::SubscriptionLagged`.
pub const DEFAULT_CHANGE_BROADCAST_CAPACITY: usize = 1_024;

/// Default number of rows a [`RowStream`](crate::stream::RowStream) requests
/// at a time when it is polled with no outstanding demand.
pub const DEFAULT_ROW_STREAM_PREFETCH: usize = 32;

/// Default entity cache size, used when a cache is created with size <= 0.
pub const DEFAULT_CACHE_SIZE: usize = 25;

// =============================================================================
// Pragmas
// =============================================================================

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// Rollback journal (SQLite default).
    Delete,
    /// Write-ahead logging.
    Wal,
    /// Journal kept in memory.
    Memory,
}

impl JournalMode {
    pub(crate) fn as_pragma(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Wal => "WAL",
            JournalMode::Memory => "MEMORY",
        }
    }
}

/// SQLite `synchronous` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronous {
    /// No syncs.
    Off,
    /// Sync the WAL on commit, not on every write.
    Normal,
    /// Sync on every write.
    Full,
}

impl Synchronous {
    pub(crate) fn as_pragma(&self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Configuration for a [`DatabaseContext`](crate::DatabaseContext).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Logical database name. Used in thread names, log fields and errors.
    pub name: String,

    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,

    /// Schema version of the application tables.
    ///
    /// Stored in the metadata table; opening a database written by a newer
    /// version fails, an older one runs the registered migrations.
    pub version: u32,

    /// Journal mode. In-memory databases ignore WAL and use `MEMORY`.
    pub journal_mode: JournalMode,

    /// `synchronous` pragma.
    pub synchronous: Synchronous,

    /// Enforce foreign keys.
    pub foreign_keys: bool,

    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,

    /// Capacity of the change-event broadcast channel.
    pub change_broadcast_capacity: usize,

    /// Rows requested per refill by a row stream with no outstanding demand.
    pub row_stream_prefetch: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "rowflow".to_string(),
            path: None,
            version: 1,
            journal_mode: JournalMode::Wal,
            synchronous: Synchronous::Normal,
            foreign_keys: true,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            change_broadcast_capacity: DEFAULT_CHANGE_BROADCAST_CAPACITY,
            row_stream_prefetch: DEFAULT_ROW_STREAM_PREFETCH,
        }
    }
}

impl DatabaseConfig {
    /// Configuration for a database file.
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configuration for a private in-memory database.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            ..Self::default()
        }
    }

    /// Sets the schema version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Sets the journal mode.
    pub fn with_journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    /// Sets the `synchronous` pragma.
    pub fn with_synchronous(mut self, synchronous: Synchronous) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the change broadcast capacity.
    pub fn with_change_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.change_broadcast_capacity = capacity;
        self
    }

    /// Sets the row stream prefetch.
    pub fn with_row_stream_prefetch(mut self, prefetch: usize) -> Self {
        self.row_stream_prefetch = prefetch;
        self
    }

    /// Checks the values that would otherwise fail deep inside a channel or
    /// stream constructor.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("database name must not be empty".to_string()));
        }
        if self.change_broadcast_capacity == 0 {
            return Err(Error::Config(
                "change_broadcast_capacity must be greater than zero".to_string(),
            ));
        }
        if self.row_stream_prefetch == 0 {
            return Err(Error::Config(
                "row_stream_prefetch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

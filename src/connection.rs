//! # SQLite Connection and Schema
//!
//! This module owns the one SQLite connection a database context writes
//! through. It opens the file, applies the configured pragmas, creates the
//! application tables, and checks the stored schema version.
//!
//! ## Connection Sharing
//!
//! ```text
//!   queue worker thread ──┐
//!                         ├──► SharedConnection ──► Mutex<DatabaseConnection>
//!   execute_sync caller ──┘        (lock)                 │
//!                                                         ▼
//!                                                rusqlite::Connection
//! ```
//!
//! Exactly one unit of work holds the connection at a time. The queue worker
//! and synchronous callers take the same mutex, so queued and synchronous
//! work never interleave.
//!
//! ## Native Transactions
//!
//! [`DatabaseConnection::in_transaction`] wraps a closure in `BEGIN IMMEDIATE`
//! / `COMMIT`. When a transaction is already open the closure runs inside a
//! `SAVEPOINT` instead, so nested work can fail without discarding the outer
//! transaction:
//!
//! ```text
//! BEGIN IMMEDIATE                  depth 1
//!   SAVEPOINT rowflow_sp_1         depth 2
//!   RELEASE / ROLLBACK TO          depth 1
//! COMMIT / ROLLBACK                depth 0
//! ```
//!
//! Change events and other effects staged through
//! [`DatabaseConnection::publish`] and [`DatabaseConnection::after_commit`]
//! are held per level. A released savepoint hands its effects to the
//! enclosing level, a rolled-back one drops them, and the outermost `COMMIT`
//! runs them in the order they were staged.
//!
//! ## Schema Versioning
//!
//! The version lives in a small key/value table, `rowflow_metadata`:
//!
//! | Stored version | Action |
//! |----------------|--------|
//! | none | run table creation, then every migration up to the configured version |
//! | equal | nothing |
//! | older | run the migrations in `(stored, configured]` in one transaction |
//! | newer | `Error::Schema` |

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, Params, Row, Statement};
use tracing::{debug, warn};

use crate::config::{DatabaseConfig, JournalMode};
use crate::error::{Error, Result};
use crate::notify::ChangeNotifier;
use crate::types::ChangeEvent;

// =============================================================================
// DDL Statements
// =============================================================================

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS rowflow_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Table creation statements and migrations registered on the context builder.
#[derive(Debug, Clone, Default)]
pub(crate) struct SchemaPlan {
    /// Run once, when the database is created.
    pub(crate) create_tables: Vec<String>,

    /// Migration scripts keyed by the version they upgrade to.
    pub(crate) migrations: BTreeMap<u32, Vec<String>>,
}

impl SchemaPlan {
    fn migrations_between(&self, from_exclusive: Option<u32>, to_inclusive: u32) -> Vec<&str> {
        self.migrations
            .iter()
            .filter(|(version, _)| from_exclusive.map_or(true, |from| **version > from))
            .filter(|(version, _)| **version <= to_inclusive)
            .flat_map(|(_, scripts)| scripts.iter().map(String::as_str))
            .collect()
    }
}

// =============================================================================
// Database Connection
// =============================================================================

/// The connection capability handed to every unit of work.
///
/// Wraps a `rusqlite::Connection` and carries the context's
/// [`ChangeNotifier`], so adapters can publish changes from inside the unit
/// of work that made them.
///
/// # Example
///
/// ```rust,ignore
/// ctx.execute_transaction(|conn: &mut DatabaseConnection| {
///     conn.execute("INSERT INTO notes (title) VALUES (?1)", ["hello"])?;
///     conn.publish(ChangeEvent::table("notes", ChangeAction::Insert));
///     Ok(conn.last_insert_rowid())
/// })?;
/// ```
pub struct DatabaseConnection {
    conn: Connection,
    notifier: ChangeNotifier,
    name: String,

    /// Open native transactions, counting savepoints.
    depth: usize,

    /// Effects waiting for commit, one frame per open level.
    staged: RefCell<Vec<Vec<Staged>>>,
}

/// An effect held back until the outermost native transaction commits.
enum Staged {
    Publish(ChangeEvent),
    Run(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish()
    }
}

impl DatabaseConnection {
    /// Opens the connection described by `config` and brings the schema up to date.
    pub(crate) fn open(
        config: &DatabaseConfig,
        notifier: ChangeNotifier,
        schema: &SchemaPlan,
    ) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };

        let mut db = Self {
            conn,
            notifier,
            name: config.name.clone(),
            depth: 0,
            staged: RefCell::new(Vec::new()),
        };
        db.initialize(config, schema)?;
        Ok(db)
    }

    fn initialize(&mut self, config: &DatabaseConfig, schema: &SchemaPlan) -> Result<()> {
        // =====================================================================
        // Pragmas
        // =====================================================================

        let journal_mode = match (&config.path, config.journal_mode) {
            // WAL needs a file.
            (None, JournalMode::Wal) => JournalMode::Memory,
            (_, mode) => mode,
        };
        self.conn
            .execute_batch(&format!("PRAGMA journal_mode = {}", journal_mode.as_pragma()))?;
        self.conn
            .execute_batch(&format!("PRAGMA synchronous = {}", config.synchronous.as_pragma()))?;
        self.conn.execute_batch(if config.foreign_keys {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        })?;
        self.conn.busy_timeout(config.busy_timeout)?;

        // =====================================================================
        // Schema
        // =====================================================================

        self.conn.execute_batch(CREATE_METADATA)?;
        self.verify_or_set_version(config.version, schema)
    }

    /// Creates or upgrades the schema, or rejects a database from a newer version.
    fn verify_or_set_version(&mut self, version: u32, schema: &SchemaPlan) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM rowflow_metadata WHERE key = ?1",
                [SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let existing = match existing {
            Some(value) => Some(value.parse::<u32>().map_err(|_| {
                Error::Schema(format!("stored schema version '{value}' is not a number"))
            })?),
            None => None,
        };

        match existing {
            Some(v) if v == version => Ok(()),
            Some(v) if v > version => Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but '{}' is configured for {version}",
                self.name
            ))),
            _ => {
                let scripts = schema.migrations_between(existing, version);
                let creating = existing.is_none();
                let tables = &schema.create_tables;

                self.in_transaction(|db| {
                    if creating {
                        for sql in tables {
                            db.conn.execute_batch(sql)?;
                        }
                    }
                    for sql in &scripts {
                        db.conn.execute_batch(sql)?;
                    }
                    db.conn.execute(
                        "INSERT OR REPLACE INTO rowflow_metadata (key, value) VALUES (?1, ?2)",
                        [SCHEMA_VERSION_KEY, &version.to_string()],
                    )?;
                    Ok(())
                })
                .map_err(|e| match e {
                    Error::Sqlite(inner) => {
                        Error::Schema(format!("failed to bring schema to version {version}: {inner}"))
                    }
                    other => other,
                })?;

                debug!(
                    database = %self.name,
                    from = ?existing,
                    to = version,
                    migrations = scripts.len(),
                    "schema updated"
                );
                Ok(())
            }
        }
    }

    // =========================================================================
    // Statement Execution
    // =========================================================================

    /// Executes one statement, returning the number of changed rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Executes a batch of `;`-separated statements without parameters.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Prepares a cached statement.
    pub fn prepare(&self, sql: &str) -> Result<rusqlite::CachedStatement<'_>> {
        Ok(self.conn.prepare_cached(sql)?)
    }

    /// Prepares a statement outside the statement cache.
    ///
    /// Use this for statements that stay open across many calls, like a
    /// row stream's cursor.
    pub fn prepare_uncached(&self, sql: &str) -> Result<Statement<'_>> {
        Ok(self.conn.prepare(sql)?)
    }

    /// Runs a query expected to return at most one row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f).optional()?)
    }

    /// Runs a query and maps every row.
    pub fn query_list<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, f)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Row id of the most recent successful insert on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    /// The underlying rusqlite connection.
    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    /// The change notifier of the owning context.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// The logical database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes `event` once the enclosing native transaction commits.
    ///
    /// Outside a native transaction the event is published immediately. If
    /// the transaction, or the savepoint the event was staged in, rolls back,
    /// the event is dropped.
    pub fn publish(&self, event: ChangeEvent) {
        self.stage(Staged::Publish(event));
    }

    /// Runs `effect` once the enclosing native transaction commits, under the
    /// same rules as [`publish`](Self::publish).
    pub fn after_commit(&self, effect: impl FnOnce() + Send + 'static) {
        self.stage(Staged::Run(Box::new(effect)));
    }

    fn stage(&self, effect: Staged) {
        if let Some(frame) = self.staged.borrow_mut().last_mut() {
            frame.push(effect);
            return;
        }
        self.apply(vec![effect]);
    }

    fn apply(&self, effects: Vec<Staged>) {
        for effect in effects {
            match effect {
                Staged::Publish(event) => self.notifier.notify(event),
                Staged::Run(run) => run(),
            }
        }
    }

    // =========================================================================
    // Native Transactions
    // =========================================================================

    /// Runs `f` inside a native transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err` or
    /// panics. A panic is re-raised after the rollback. Nested calls use
    /// savepoints.
    pub fn in_transaction<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.begin()?;

        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(value)) => match self.commit() {
                Ok(committed) => {
                    self.apply(committed);
                    Ok(value)
                }
                Err(e) => {
                    self.rollback_logged();
                    Err(e)
                }
            },
            Ok(Err(e)) => {
                self.rollback_logged();
                Err(e)
            }
            Err(payload) => {
                self.rollback_logged();
                resume_unwind(payload)
            }
        }
    }

    /// Returns true while a native transaction is open on this connection.
    pub fn is_in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Open native transactions started through this wrapper, counting savepoints.
    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    fn begin(&mut self) -> Result<()> {
        if self.depth == 0 {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            debug!(database = %self.name, "native transaction started");
        } else {
            self.conn
                .execute_batch(&format!("SAVEPOINT rowflow_sp_{}", self.depth))?;
        }
        self.depth += 1;
        self.staged.get_mut().push(Vec::new());
        Ok(())
    }

    /// Commits the innermost level. Returns the effects to apply now, which
    /// is everything staged once the outermost transaction commits.
    fn commit(&mut self) -> Result<Vec<Staged>> {
        let depth = self.depth.saturating_sub(1);
        if depth == 0 {
            self.conn.execute_batch("COMMIT")?;
            debug!(database = %self.name, "native transaction committed");
        } else {
            self.conn
                .execute_batch(&format!("RELEASE SAVEPOINT rowflow_sp_{depth}"))?;
        }
        self.depth = depth;

        let staged = self.staged.get_mut();
        let frame = staged.pop().unwrap_or_default();
        match staged.last_mut() {
            Some(parent) => {
                parent.extend(frame);
                Ok(Vec::new())
            }
            None => Ok(frame),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        let depth = self.depth.saturating_sub(1);
        self.depth = depth;
        let discarded = self.staged.get_mut().pop().map_or(0, |frame| frame.len());
        if discarded > 0 {
            debug!(database = %self.name, discarded, "staged effects dropped on rollback");
        }
        if depth == 0 {
            self.conn.execute_batch("ROLLBACK")?;
            debug!(database = %self.name, "native transaction rolled back");
        } else {
            self.conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT rowflow_sp_{depth}; RELEASE SAVEPOINT rowflow_sp_{depth}"
            ))?;
        }
        Ok(())
    }

    fn rollback_logged(&mut self) {
        if let Err(e) = self.rollback() {
            warn!(database = %self.name, error = %e, "rollback failed");
        }
    }
}

// =============================================================================
// Shared Connection
// =============================================================================

thread_local! {
    /// Set while this thread holds a connection guard.
    static HOLDING_CONNECTION: Cell<bool> = const { Cell::new(false) };
}

/// The connection shared between the queue worker and synchronous callers.
#[derive(Clone)]
pub(crate) struct SharedConnection {
    inner: Arc<Mutex<DatabaseConnection>>,
}

impl SharedConnection {
    pub(crate) fn new(conn: DatabaseConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Locks the connection for one unit of work.
    ///
    /// Fails with `Error::ReentrantTransaction` when this thread already
    /// holds it; blocking would deadlock.
    pub(crate) fn lock(&self) -> Result<ConnectionGuard<'_>> {
        if HOLDING_CONNECTION.with(Cell::get) {
            return Err(Error::ReentrantTransaction);
        }

        // A panic inside a unit of work is caught before the guard drops,
        // but a poisoned lock is still usable.
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        HOLDING_CONNECTION.with(|flag| flag.set(true));
        Ok(ConnectionGuard { guard })
    }
}

/// Exclusive access to the connection; clears the reentrancy flag on drop.
pub(crate) struct ConnectionGuard<'a> {
    guard: MutexGuard<'a, DatabaseConnection>,
}

impl Deref for ConnectionGuard<'_> {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ConnectionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        HOLDING_CONNECTION.with(|flag| flag.set(false));
    }
}

// =============================================================================
// Tests
// =============================================================================

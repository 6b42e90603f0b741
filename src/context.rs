//! # Database Context
//!
//! [`DatabaseContext`] is the handle applications hold. It owns, for one
//! database:
//!
//! ```text
//! DatabaseContext (Clone, Arc inside)
//!   ├── SharedConnection ─────── Mutex<DatabaseConnection>
//!   ├── TransactionCoordinator ─ rowflow-queue-<db> thread
//!   ├── ChangeNotifier ───────── registers + broadcast channel
//!   ├── CallbackExecutor ─────── rowflow-callbacks-<db> thread (default)
//!   └── unhandled-failure hook
//! ```
//!
//! There is no process-wide registry: every context is constructed
//! explicitly, and two contexts on two files are fully independent.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rowflow::{DatabaseConfig, DatabaseConnection, DatabaseContext};
//!
//! let ctx = DatabaseContext::builder(DatabaseConfig::file("app", "app.db"))
//!     .create_table("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
//!     .on_unhandled_error(|e| eprintln!("background write failed: {e}"))
//!     .open()?;
//!
//! let inserted = ctx.execute_transaction(|conn: &mut DatabaseConnection| {
//!     conn.execute("INSERT INTO notes (title) VALUES (?1)", ["hello"])
//! })?;
//! assert_eq!(inserted, 1);
//! # Ok::<(), rowflow::Error>(())
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::DatabaseConfig;
use crate::connection::{DatabaseConnection, SchemaPlan, SharedConnection};
use crate::coordinator::TransactionCoordinator;
use crate::dispatch::{CallbackDispatcher, CallbackExecutor};
use crate::error::{panic_message, Error, Result};
use crate::notify::ChangeNotifier;
use crate::transaction::{run_guarded, TransactionBuilder, UnitOfWork};
use crate::types::TransactionId;

/// Receives failures no error callback handled.
pub type UnhandledErrorHook = Arc<dyn Fn(Error) + Send + Sync>;

struct ContextInner {
    config: DatabaseConfig,
    connection: SharedConnection,
    coordinator: TransactionCoordinator,
    notifier: ChangeNotifier,
    callbacks: Arc<dyn CallbackExecutor>,

    /// The default executor, when the builder was not given one.
    dispatcher: Option<Arc<CallbackDispatcher>>,
    on_unhandled: UnhandledErrorHook,
    next_transaction_id: AtomicU64,
}

/// The handle to one open database.
///
/// # Thread Safety
///
/// `DatabaseContext` is `Clone`, `Send` and `Sync`. Clones share everything;
/// the database closes when the last clone is dropped or on [`close`](Self::close).
#[derive(Clone)]
pub struct DatabaseContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("name", &self.name())
            .field("path", &self.inner.config.path)
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

impl DatabaseContext {
    /// Opens a database with no application tables.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::builder(config).open()
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        Self::open(DatabaseConfig::in_memory(name))
    }

    /// Starts configuring a context.
    pub fn builder(config: DatabaseConfig) -> DatabaseContextBuilder {
        DatabaseContextBuilder {
            config,
            schema: SchemaPlan::default(),
            callbacks: None,
            on_unhandled: None,
        }
    }

    /// The logical database name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The configuration this context was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// The change notifier.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// The transaction coordinator.
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.inner.coordinator
    }

    /// Starts a transaction descriptor around `work`.
    pub fn begin_transaction_async<W: UnitOfWork>(&self, work: W) -> TransactionBuilder<W::Output> {
        TransactionBuilder::new(self.clone(), work)
    }

    /// Runs `work` on the calling thread inside a native transaction and
    /// returns its result.
    ///
    /// Waits for queued work that holds the connection. Fails with
    /// `Error::ReentrantTransaction` when called from inside a unit of work.
    pub fn execute_transaction<W: UnitOfWork>(&self, work: W) -> Result<W::Output> {
        let mut conn = self.inner.connection.lock()?;
        run_guarded(&mut conn, "execute_transaction", true, |conn| work.execute(conn))
    }

    /// Cancels all waiting descriptors and restarts the queue.
    pub fn reset(&self) -> Result<()> {
        self.inner.coordinator.reset()
    }

    /// Cancels all waiting descriptors and stops the queue and the default
    /// callback thread. Later submissions fail with `Error::QueueClosed`.
    pub fn close(&self) {
        self.inner.coordinator.shutdown();
        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher.shutdown();
        }
        debug!(database = %self.name(), "database context closed");
    }

    // =========================================================================
    // Crate Internals
    // =========================================================================

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId::from_raw(self.inner.next_transaction_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn shared_connection(&self) -> &SharedConnection {
        &self.inner.connection
    }

    pub(crate) fn callback_executor(&self) -> &Arc<dyn CallbackExecutor> {
        &self.inner.callbacks
    }

    /// Hands a failure with no error callback to the hook.
    pub(crate) fn report_unhandled(&self, error: Error) {
        let hook = &self.inner.on_unhandled;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(error))) {
            warn!(
                database = %self.name(),
                panic = %panic_message(payload.as_ref()),
                "unhandled-failure hook panicked"
            );
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures a [`DatabaseContext`] before opening it.
pub struct DatabaseContextBuilder {
    config: DatabaseConfig,
    schema: SchemaPlan,
    callbacks: Option<Arc<dyn CallbackExecutor>>,
    on_unhandled: Option<UnhandledErrorHook>,
}

impl DatabaseContextBuilder {
    /// Runs `sql` when the database file is created.
    pub fn create_table(mut self, sql: impl Into<String>) -> Self {
        self.schema.create_tables.push(sql.into());
        self
    }

    /// Runs `sql` when upgrading a database to `version`.
    pub fn migration(mut self, version: u32, sql: impl Into<String>) -> Self {
        self.schema.migrations.entry(version).or_default().push(sql.into());
        self
    }

    /// Where posted callbacks run. Defaults to a dedicated callback thread.
    pub fn callback_executor(mut self, executor: impl CallbackExecutor + 'static) -> Self {
        self.callbacks = Some(Arc::new(executor));
        self
    }

    /// Receives queued failures no error callback handled.
    ///
    /// Defaults to logging them with `tracing::error!`.
    pub fn on_unhandled_error(mut self, hook: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_unhandled = Some(Arc::new(hook));
        self
    }

    /// Opens the database and starts the queue.
    pub fn open(self) -> Result<DatabaseContext> {
        self.config.validate()?;

        let notifier = ChangeNotifier::new(self.config.change_broadcast_capacity);
        let connection = SharedConnection::new(DatabaseConnection::open(
            &self.config,
            notifier.clone(),
            &self.schema,
        )?);
        let coordinator = TransactionCoordinator::start(&self.config.name, connection.clone())?;

        let (callbacks, dispatcher) = match self.callbacks {
            Some(callbacks) => (callbacks, None),
            None => {
                let dispatcher = Arc::new(CallbackDispatcher::spawn(&self.config.name)?);
                let callbacks: Arc<dyn CallbackExecutor> = dispatcher.clone();
                (callbacks, Some(dispatcher))
            }
        };

        let name = self.config.name.clone();
        let on_unhandled = self.on_unhandled.unwrap_or_else(|| {
            Arc::new(move |e: Error| {
                error!(database = %name, error = %e, cause = %e.root(), "unhandled transaction failure");
            })
        });

        debug!(database = %self.config.name, path = ?self.config.path, "database context opened");

        Ok(DatabaseContext {
            inner: Arc::new(ContextInner {
                config: self.config,
                connection,
                coordinator,
                notifier,
                callbacks,
                dispatcher,
                on_unhandled,
                next_transaction_id: AtomicU64::new(1),
            }),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Stream Bridges
//!
//! Three ways to consume query results as a `futures::Stream`:
//!
//! | Constructor | Emits | Ends |
//! |-------------|-------|------|
//! | [`DatabaseContext::single`] | one `Result<R>` | after the one item |
//! | [`DatabaseContext::query_rows`] | one mapped row per item, on demand | after the last row, an error, or `cancel` |
//! | [`DatabaseContext::observe`] | the full result list, again after every change | when dropped |
//!
//! ## Row Streams and Backpressure
//!
//! A [`RowStream`] walks a live SQLite cursor on the queue worker. Rows are
//! produced only against outstanding demand:
//!
//! ```text
//!   consumer                         queue worker (unit of work)
//!   ────────                         ───────────────────────────
//!   request(n) ──► demand += n ────► wait while demand == 0
//!                                    row = cursor.next()
//!   recv() ◄──── unbounded mpsc ◄─── send(mapper(row)); demand -= 1
//!   cancel()/drop ─► cancelled ────► stop; statement dropped
//! ```
//!
//! While the cursor is open the stream holds the queue, so other queued work
//! waits until the stream completes, fails, or is cancelled. Drain it or drop
//! it; do not hold a paused stream while awaiting other work on the same
//! context.
//!
//! ## Live Queries
//!
//! A [`LiveQuery`] registers a [`TableNotifierRegister`] for its query's
//! tables. Every matching change stores a single wake-up permit; while a
//! re-query is running further changes collapse into that one permit, so a
//! burst of writes causes one re-query, and the last emitted list is always
//! the latest.

use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Row};
use tokio::sync::{mpsc, Notify};

use crate::connection::DatabaseConnection;
use crate::context::DatabaseContext;
use crate::error::{Error, Result};
use crate::notify::TableNotifierRegister;
use crate::transaction::{Transaction, TransactionHandle, UnitOfWork};
use crate::types::{ChangeAction, TableId};

// =============================================================================
// Query
// =============================================================================

/// SQL text, its bound parameters, and the tables its result depends on.
///
/// ```rust
/// use rowflow::stream::Query;
///
/// let query = Query::new("SELECT id, title FROM notes WHERE id > ?1")
///     .bind(10_i64)
///     .depends_on("notes");
///
/// assert_eq!(query.tables().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
    tables: Vec<TableId>,
}

impl Query {
    /// A query with no parameters and no table dependencies.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            tables: Vec::new(),
        }
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Declares that the result changes when `table` changes.
    pub fn depends_on(mut self, table: impl Into<TableId>) -> Self {
        let table = table.into();
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
        self
    }

    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The bound parameters, in order.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// The tables the result depends on.
    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    /// Runs the query on `conn` and maps every row.
    pub fn fetch<T, F>(&self, conn: &DatabaseConnection, mapper: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        conn.query_list(&self.sql, params_from_iter(self.params.iter()), mapper)
    }
}

// =============================================================================
// One-Shot Streams and Lists
// =============================================================================

impl DatabaseContext {
    /// A stream that runs `work` on the queue when first polled and yields
    /// its result once.
    pub fn single<W: UnitOfWork>(&self, work: W) -> impl Stream<Item = Result<W::Output>> + Send + 'static {
        stream::once(self.transact(work))
    }

    /// Runs `query` on the queue and collects the mapped rows.
    pub async fn query_list<T, F>(&self, query: Query, mut mapper: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        self.transact(move |conn: &mut DatabaseConnection| query.fetch(conn, &mut mapper))
            .await
    }

    /// Streams the mapped rows of `query` with explicit demand.
    ///
    /// Nothing is queued until the stream is first polled or `request`ed.
    pub fn query_rows<T, F>(&self, query: Query, mapper: F) -> RowStream<T>
    where
        T: Send + 'static,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        RowStream::new(self, query, mapper)
    }

    /// Emits the mapped rows of `query`, then emits them again after every
    /// change to one of the query's tables.
    pub fn observe<T, F>(&self, query: Query, mapper: F) -> LiveQuery<T>
    where
        T: Send + 'static,
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        LiveQuery::new(self, query, mapper)
    }
}

// =============================================================================
// Row Stream
// =============================================================================

#[derive(Debug, Default)]
struct DemandState {
    requested: u64,
    cancelled: bool,
}

/// Demand shared between the consumer and the producing unit of work.
#[derive(Debug, Default)]
struct Demand {
    state: Mutex<DemandState>,
    changed: Condvar,
}

impl Demand {
    fn state(&self) -> MutexGuard<'_, DemandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, n: u64) {
        let mut state = self.state();
        state.requested = state.requested.saturating_add(n);
        self.changed.notify_all();
    }

    fn cancel(&self) {
        self.state().cancelled = true;
        self.changed.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Blocks until one row may be produced. False once cancelled.
    fn take_one(&self) -> bool {
        let mut state = self.state();
        while state.requested == 0 && !state.cancelled {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.cancelled {
            return false;
        }
        state.requested -= 1;
        true
    }
}

/// A cold, demand-driven stream of mapped rows.
///
/// Use [`request`](RowStream::request) and [`recv`](RowStream::recv) for
/// explicit flow control, or poll it as a `Stream`, which requests
/// `DatabaseConfig::row_stream_prefetch` rows whenever no demand is
/// outstanding.
///
/// Dropping the stream cancels it.
pub struct RowStream<T: Send + 'static> {
    rows_rx: mpsc::UnboundedReceiver<Result<T>>,
    demand: Arc<Demand>,
    producer: Option<Transaction<()>>,
    handle: TransactionHandle,
    prefetch: u64,
    outstanding: u64,
    start_error: Option<Error>,
    finished: bool,
}

impl<T: Send + 'static> std::fmt::Debug for RowStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("transaction", &self.handle)
            .field("outstanding", &self.outstanding)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T: Send + 'static> RowStream<T> {
    fn new<F>(ctx: &DatabaseContext, query: Query, mut mapper: F) -> Self
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let (rows_tx, rows_rx) = mpsc::unbounded_channel();
        let demand = Arc::new(Demand::default());
        let producer_demand = Arc::clone(&demand);
        let failure_tx = rows_tx.clone();

        let producer = ctx
            .begin_transaction_async(move |conn: &mut DatabaseConnection| -> Result<()> {
                let mut stmt = conn.prepare_uncached(query.sql())?;
                let mut rows = stmt.query(params_from_iter(query.params().iter()))?;

                // The cursor advances before demand is taken, so exhaustion
                // ends the stream without waiting for another request.
                loop {
                    let item = match rows.next() {
                        Ok(Some(row)) => mapper(row).map_err(Error::from),
                        Ok(None) => break,
                        Err(e) => Err(Error::from(e)),
                    };
                    if !producer_demand.take_one() {
                        break;
                    }
                    let failed = item.is_err();
                    if rows_tx.send(item).is_err() || failed {
                        break;
                    }
                }
                Ok(())
            })
            .should_run_in_transaction(false)
            .run_callbacks_on_same_thread(true)
            .completion(move |result| {
                if let Err(e) = result {
                    let _ = failure_tx.send(Err(e));
                }
            })
            .build();

        Self {
            rows_rx,
            demand,
            handle: producer.handle(),
            producer: Some(producer),
            prefetch: ctx.config().row_stream_prefetch as u64,
            outstanding: 0,
            start_error: None,
            finished: false,
        }
    }

    fn start(&mut self) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.execute() {
                self.start_error = Some(e);
            }
        }
    }

    /// Allows `n` more rows to be produced. Starts the stream if needed.
    pub fn request(&mut self, n: u64) {
        if n == 0 || self.demand.is_cancelled() {
            return;
        }
        self.outstanding = self.outstanding.saturating_add(n);
        self.demand.add(n);
        self.start();
    }

    /// Stops the stream. Rows already produced are still delivered; the
    /// cursor is released at the next demand check.
    pub fn cancel(&mut self) {
        self.demand.cancel();
        self.handle.cancel();
        // Never started: nothing will send, close the channel.
        self.producer = None;
    }

    /// Receives the next row without requesting more.
    ///
    /// Returns `None` when the stream has ended, including when no demand is
    /// outstanding and the producer has been cancelled.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        futures::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Rows requested but not yet received.
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<T>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(e) = self.start_error.take() {
            self.finished = true;
            return Poll::Ready(Some(Err(e)));
        }
        match self.rows_rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if item.is_err() {
                    self.finished = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> Stream for RowStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.finished && this.outstanding == 0 && !this.demand.is_cancelled() {
            let prefetch = this.prefetch;
            this.request(prefetch);
        }
        this.poll_recv(cx)
    }
}

impl<T: Send + 'static> Drop for RowStream<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

// =============================================================================
// Live Query
// =============================================================================

/// A stream of query results that re-emits after every relevant change.
///
/// Emits the initial result first. Errors are emitted as items and the query
/// keeps observing. Dropping the stream unregisters it.
pub struct LiveQuery<T: Send + 'static> {
    results: BoxStream<'static, Result<Vec<T>>>,
    register: TableNotifierRegister,
}

impl<T: Send + 'static> std::fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("register", &self.register)
            .finish()
    }
}

impl<T: Send + 'static> LiveQuery<T> {
    fn new<F>(ctx: &DatabaseContext, query: Query, mapper: F) -> Self
    where
        F: Fn(&Row<'_>) -> rusqlite::Result<T> + Send + Sync + 'static,
    {
        let changed = Arc::new(Notify::new());
        let register = ctx.notifier().new_register();
        for table in query.tables() {
            register.register(table);
        }
        let waker = Arc::clone(&changed);
        register.set_listener(move |_: &TableId, _: ChangeAction| waker.notify_one());

        let mapper = Arc::new(mapper);
        let ctx = ctx.clone();
        let results = stream::unfold(true, move |first| {
            let ctx = ctx.clone();
            let query = query.clone();
            let mapper = Arc::clone(&mapper);
            let changed = Arc::clone(&changed);
            async move {
                if !first {
                    changed.notified().await;
                }
                let result = ctx
                    .query_list(query, move |row: &Row<'_>| (*mapper)(row))
                    .await;
                Some((result, false))
            }
        })
        .boxed();

        Self { results, register }
    }

    /// Tables this query is observing.
    pub fn tables(&self) -> Vec<TableId> {
        self.register.tables()
    }
}

impl<T: Send + 'static> Stream for LiveQuery<T> {
    type Item = Result<Vec<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.results.poll_next_unpin(cx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_query_collects_params_and_unique_tables() {
        let query = Query::new("SELECT * FROM notes WHERE id > ?1 AND title = ?2")
            .bind(3_i64)
            .bind("draft".to_string())
            .depends_on("notes")
            .depends_on("notes")
            .depends_on("tags");

        assert_eq!(query.params(), &[Value::Integer(3), Value::Text("draft".into())]);
        assert_eq!(query.tables(), &[TableId::new("notes"), TableId::new("tags")]);
    }

    #[test]
    fn test_demand_blocks_until_requested() {
        let demand = Arc::new(Demand::default());
        let producer = Arc::clone(&demand);

        let taken = thread::spawn(move || {
            let mut taken = 0;
            while producer.take_one() {
                taken += 1;
            }
            taken
        });

        thread::sleep(Duration::from_millis(20));
        demand.add(2);
        thread::sleep(Duration::from_millis(20));
        demand.cancel();

        assert_eq!(taken.join().unwrap(), 2);
    }

    #[test]
    fn test_query_fetch_maps_rows() {
        let ctx = DatabaseContext::builder(crate::config::DatabaseConfig::in_memory("fetch"))
            .create_table("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
            .open()
            .unwrap();

        let titles = ctx
            .execute_transaction(|conn: &mut DatabaseConnection| -> Result<Vec<String>> {
                conn.execute("INSERT INTO notes (title) VALUES ('a'), ('b')", [])?;
                Query::new("SELECT title FROM notes WHERE id >= ?1 ORDER BY id")
                    .bind(2_i64)
                    .fetch(conn, |row| row.get(0))
            })
            .unwrap();

        assert_eq!(titles, vec!["b".to_string()]);
    }
}

//! # Units of Work and Transaction Descriptors
//!
//! A [`UnitOfWork`] is a piece of database work: it receives the connection,
//! does its reads and writes, and returns a result or an error. A
//! [`Transaction`] wraps one unit of work with everything needed to run it
//! later: a name, whether to wrap it in a native transaction, where callbacks
//! run, and the callbacks themselves.
//!
//! ## Lifecycle
//!
//! ```text
//!   begin_transaction_async(work)
//!            │
//!            ▼
//!   TransactionBuilder ──build()──► Transaction (Created)
//!                                        │
//!                    ┌───────────────────┼──────────────────────┐
//!                    ▼                   ▼                      ▼
//!             execute()            execute_sync()            cancel()
//!          queue (Pending)      caller's thread              (Cancelled)
//!                    │                   │
//!                    ▼                   ▼
//!               Executing ──► Completed / Failed ──► one callback, at most once
//! ```
//!
//! ## At-Most-Once Callbacks
//!
//! Callbacks are `FnOnce` boxes. Delivering one consumes it, so a descriptor
//! can't report twice. Status changes go through compare-and-swap on a shared
//! ticket, so a cancel racing the worker's dequeue has exactly
//! one winner: either the work runs, or it is cancelled and never runs.
//!
//! ## Failure Routing
//!
//! | Outcome | Error callback set | No error callback |
//! |---------|--------------------|-------------------|
//! | queued | error callback | `Error::ExecutionFailed` to the context's unhandled-failure hook |
//! | `execute_sync` | error callback | `Err(Error::ExecutionFailed)` returned to the caller |
//!
//! A panic inside the unit of work becomes `Error::Panicked` and follows the
//! same routes.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::connection::DatabaseConnection;
use crate::context::DatabaseContext;
use crate::dispatch::{run_job, Job};
use crate::error::{Error, Result};
use crate::types::{CallbackPolicy, TransactionId, TransactionStatus};

// =============================================================================
// Unit of Work
// =============================================================================

/// Work executed against the database connection.
///
/// Implemented for every `FnOnce(&mut DatabaseConnection) -> Result<R>`
/// closure, and by [`BatchUnitOfWork`](crate::batch::BatchUnitOfWork).
///
/// # Example
///
/// ```rust,ignore
/// let count = ctx.execute_transaction(|conn: &mut DatabaseConnection| {
///     conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get::<_, i64>(0))
/// })?;
/// ```
pub trait UnitOfWork: Send + 'static {
    /// The value produced on success.
    type Output: Send + 'static;

    /// Runs the work. Called at most once.
    fn execute(self, conn: &mut DatabaseConnection) -> Result<Self::Output>;
}

impl<F, R> UnitOfWork for F
where
    F: FnOnce(&mut DatabaseConnection) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    type Output = R;

    fn execute(self, conn: &mut DatabaseConnection) -> Result<R> {
        self(conn)
    }
}

type BoxedWork<R> = Box<dyn FnOnce(&mut DatabaseConnection) -> Result<R> + Send>;
type SuccessCallback<R> = Box<dyn FnOnce(R) + Send>;
type ErrorCallback = Box<dyn FnOnce(Error) + Send>;
type CompletionCallback<R> = Box<dyn FnOnce(Result<R>) + Send>;

fn boxed<W: UnitOfWork>(work: W) -> BoxedWork<W::Output> {
    Box::new(move |conn: &mut DatabaseConnection| work.execute(conn))
}

/// Runs `work`, optionally inside a native transaction, converting a panic
/// into `Error::Panicked`.
pub(crate) fn run_guarded<R>(
    conn: &mut DatabaseConnection,
    label: &str,
    native: bool,
    work: impl FnOnce(&mut DatabaseConnection) -> Result<R>,
) -> Result<R> {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if native {
            conn.in_transaction(work)
        } else {
            work(conn)
        }
    }));

    result.unwrap_or_else(|payload| Err(Error::from_panic(label.to_string(), payload)))
}

// =============================================================================
// Ticket
// =============================================================================

/// Shared, atomically updated identity and status of one descriptor.
///
/// Held by the descriptor, its handles, and the queue registry.
#[derive(Debug)]
pub(crate) struct TransactionTicket {
    id: TransactionId,
    name: Option<String>,
    state: AtomicU8,
    token: CancellationToken,
}

impl TransactionTicket {
    pub(crate) fn new(id: TransactionId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            state: AtomicU8::new(TransactionStatus::Created as u8),
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name if set, otherwise the id.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn transition(&self, from: TransactionStatus, to: TransactionStatus) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Created | Pending -> `to`, in one atomic step.
    fn leave_waiting(&self, to: TransactionStatus) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match TransactionStatus::from_u8(current) {
                    TransactionStatus::Created | TransactionStatus::Pending => Some(to as u8),
                    _ => None,
                }
            })
            .is_ok()
    }

    /// Created -> Pending.
    pub(crate) fn mark_pending(&self) -> bool {
        self.transition(TransactionStatus::Created, TransactionStatus::Pending)
    }

    /// Created | Pending -> Executing. False if cancelled or already started.
    pub(crate) fn try_start(&self) -> bool {
        self.leave_waiting(TransactionStatus::Executing)
    }

    /// Created | Pending -> Cancelled. False once execution has started.
    pub(crate) fn try_cancel(&self) -> bool {
        let cancelled = self.leave_waiting(TransactionStatus::Cancelled);
        if cancelled {
            self.token.cancel();
        }
        cancelled
    }

    /// Executing -> Completed | Failed.
    pub(crate) fn finish(&self, succeeded: bool) {
        let to = if succeeded {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };
        self.transition(TransactionStatus::Executing, to);
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A cheap, cloneable reference to a submitted descriptor.
///
/// Returned by [`Transaction::execute`]. Use it to observe the status or to
/// cancel the descriptor while it is still waiting.
#[derive(Clone)]
pub struct TransactionHandle {
    ticket: Arc<TransactionTicket>,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.ticket.id())
            .field("name", &self.ticket.name())
            .field("status", &self.ticket.status())
            .finish()
    }
}

impl TransactionHandle {
    pub(crate) fn new(ticket: Arc<TransactionTicket>) -> Self {
        Self { ticket }
    }

    /// The descriptor's id.
    pub fn id(&self) -> TransactionId {
        self.ticket.id()
    }

    /// The descriptor's name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.ticket.name()
    }

    /// The current status.
    pub fn status(&self) -> TransactionStatus {
        self.ticket.status()
    }

    /// Cancels the descriptor if it has not started.
    ///
    /// Returns `false`, and changes nothing, once execution has begun or the
    /// descriptor has already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.ticket.try_cancel();
        if cancelled {
            trace!(transaction_id = %self.id(), name = ?self.name(), "transaction cancelled");
        }
        cancelled
    }

    /// Completes when the descriptor is cancelled.
    ///
    /// Never completes for a descriptor that starts executing.
    pub async fn cancelled(&self) {
        self.ticket.token().cancelled().await
    }
}

// =============================================================================
// Completion
// =============================================================================

/// How a descriptor reports its outcome.
enum Completion<R> {
    /// Separate success and error callbacks, each optional.
    Split {
        success: Option<SuccessCallback<R>>,
        error: Option<ErrorCallback>,
    },
    /// One callback receiving the `Result`.
    Unified(CompletionCallback<R>),
}

impl<R> Default for Completion<R> {
    fn default() -> Self {
        Completion::Split {
            success: None,
            error: None,
        }
    }
}

// =============================================================================
// Transaction Descriptor
// =============================================================================

/// A unit of work plus how and where it reports back.
///
/// Build one with [`DatabaseContext::begin_transaction_async`], then either
/// [`execute`](Transaction::execute) it on the queue or run it with
/// [`execute_sync`](Transaction::execute_sync).
pub struct Transaction<R: Send + 'static> {
    ctx: DatabaseContext,
    ticket: Arc<TransactionTicket>,
    work: Option<BoxedWork<R>>,
    run_in_transaction: bool,
    callback_policy: CallbackPolicy,
    completion: Completion<R>,
    outcome: Option<Result<R>>,
}

impl<R: Send + 'static> fmt::Debug for Transaction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.ticket.id())
            .field("name", &self.ticket.name())
            .field("status", &self.ticket.status())
            .field("run_in_transaction", &self.run_in_transaction)
            .field("callback_policy", &self.callback_policy)
            .finish()
    }
}

impl<R: Send + 'static> Transaction<R> {
    /// The descriptor's id.
    pub fn id(&self) -> TransactionId {
        self.ticket.id()
    }

    /// The descriptor's name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.ticket.name()
    }

    /// The current status.
    pub fn status(&self) -> TransactionStatus {
        self.ticket.status()
    }

    /// Whether the unit of work runs inside a native transaction.
    pub fn runs_in_transaction(&self) -> bool {
        self.run_in_transaction
    }

    /// Where callbacks run.
    pub fn callback_policy(&self) -> CallbackPolicy {
        self.callback_policy
    }

    /// A handle that outlives submission.
    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle::new(Arc::clone(&self.ticket))
    }

    /// Cancels the descriptor if it has not started. See [`TransactionHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.handle().cancel()
    }

    /// Submits the descriptor to the context's queue.
    ///
    /// Never blocks. Fails only when the context has been closed.
    pub fn execute(self) -> Result<TransactionHandle> {
        let ctx = self.ctx.clone();
        ctx.coordinator().add_transaction(self)
    }

    /// Runs the descriptor on the calling thread.
    ///
    /// Waits for the connection, runs the unit of work (inside a native
    /// transaction unless disabled), releases the connection, then delivers
    /// the outcome. A failure with no error callback is returned as
    /// `Err(Error::ExecutionFailed)`.
    ///
    /// # Errors
    ///
    /// - `Error::Cancelled` if the descriptor was cancelled before this call
    /// - `Error::ReentrantTransaction` if called from inside a running unit of work
    /// - `Error::ExecutionFailed` for an unhandled failure
    pub fn execute_sync(mut self) -> Result<()> {
        if !self.ticket.try_start() {
            return Err(Error::Cancelled);
        }

        {
            let shared = self.ctx.shared_connection().clone();
            let mut conn = match shared.lock() {
                Ok(conn) => conn,
                Err(e) => {
                    self.ticket.finish(false);
                    return Err(e);
                }
            };
            self.run_work(&mut conn);
        }

        match self.deliver() {
            Some(unhandled) => Err(unhandled),
            None => Ok(()),
        }
    }

    /// Runs the unit of work and records the outcome. The ticket must be Executing.
    fn run_work(&mut self, conn: &mut DatabaseConnection) {
        let Some(work) = self.work.take() else {
            return;
        };

        let label = self.ticket.label();
        let outcome = run_guarded(conn, &label, self.run_in_transaction, work);
        self.ticket.finish(outcome.is_ok());
        self.outcome = Some(outcome);
    }

    /// Delivers the recorded outcome. Returns the failure nobody handled.
    fn deliver(mut self) -> Option<Error> {
        let outcome = self.outcome.take()?;
        let completion = std::mem::take(&mut self.completion);

        let job: Job = match (outcome, completion) {
            (result, Completion::Unified(callback)) => Box::new(move || callback(result)),
            (Ok(value), Completion::Split { success, .. }) => {
                let callback = success?;
                Box::new(move || callback(value))
            }
            (Err(e), Completion::Split { error: Some(callback), .. }) => {
                Box::new(move || callback(e))
            }
            (Err(e), Completion::Split { error: None, .. }) => {
                return Some(Error::ExecutionFailed {
                    transaction: self.ticket.label(),
                    source: Box::new(e),
                });
            }
        };

        match self.callback_policy {
            CallbackPolicy::Inline => run_job(job),
            CallbackPolicy::Posted => self.ctx.callback_executor().post(job),
        }
        None
    }
}

// =============================================================================
// Type-Erased Queue Entry
// =============================================================================

/// What the queue worker sees of a descriptor, independent of its result type.
pub(crate) trait QueuedWork: Send {
    fn ticket(&self) -> &Arc<TransactionTicket>;

    /// Runs the unit of work. Called once, after a successful `try_start`.
    fn run(&mut self, conn: &mut DatabaseConnection);

    /// Records `error` as the outcome without running the unit of work.
    fn fail(&mut self, error: Error);

    /// Delivers callbacks, or reports an unhandled failure to the context.
    fn complete(self: Box<Self>);
}

impl<R: Send + 'static> QueuedWork for Transaction<R> {
    fn ticket(&self) -> &Arc<TransactionTicket> {
        &self.ticket
    }

    fn run(&mut self, conn: &mut DatabaseConnection) {
        self.run_work(conn);
    }

    fn fail(&mut self, error: Error) {
        self.work = None;
        self.ticket.finish(false);
        self.outcome = Some(Err(error));
    }

    fn complete(self: Box<Self>) {
        let ctx = self.ctx.clone();
        if let Some(unhandled) = self.deliver() {
            ctx.report_unhandled(unhandled);
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures a [`Transaction`] before it is built.
///
/// # Example
///
/// ```rust,ignore
/// ctx.begin_transaction_async(|conn: &mut DatabaseConnection| {
///         conn.execute("DELETE FROM notes", [])
///     })
///     .name("clear-notes")
///     .success(|deleted| println!("deleted {deleted} notes"))
///     .error(|e| eprintln!("clear failed: {e}"))
///     .execute()?;
/// ```
pub struct TransactionBuilder<R: Send + 'static> {
    ctx: DatabaseContext,
    work: BoxedWork<R>,
    name: Option<String>,
    run_in_transaction: bool,
    callback_policy: CallbackPolicy,
    completion: Completion<R>,
}

impl<R: Send + 'static> TransactionBuilder<R> {
    pub(crate) fn new<W>(ctx: DatabaseContext, work: W) -> Self
    where
        W: UnitOfWork<Output = R>,
    {
        Self {
            ctx,
            work: boxed(work),
            name: None,
            run_in_transaction: true,
            callback_policy: CallbackPolicy::default(),
            completion: Completion::default(),
        }
    }

    /// Names the descriptor. Names need not be unique; cancelling by name
    /// cancels every pending descriptor that carries it.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether to wrap the unit of work in a native transaction. Defaults to `true`.
    pub fn should_run_in_transaction(mut self, run_in_transaction: bool) -> Self {
        self.run_in_transaction = run_in_transaction;
        self
    }

    /// Run callbacks on the thread that finished the work instead of
    /// posting them to the callback executor.
    pub fn run_callbacks_on_same_thread(mut self, same_thread: bool) -> Self {
        self.callback_policy = if same_thread {
            CallbackPolicy::Inline
        } else {
            CallbackPolicy::Posted
        };
        self
    }

    /// Sets the callback policy directly.
    pub fn callback_policy(mut self, policy: CallbackPolicy) -> Self {
        self.callback_policy = policy;
        self
    }

    /// Called with the result when the work succeeds. Replaces a `completion`.
    pub fn success(mut self, callback: impl FnOnce(R) + Send + 'static) -> Self {
        let error = match self.completion {
            Completion::Split { error, .. } => error,
            Completion::Unified(_) => None,
        };
        self.completion = Completion::Split {
            success: Some(Box::new(callback)),
            error,
        };
        self
    }

    /// Called with the failure when the work fails. Replaces a `completion`.
    pub fn error(mut self, callback: impl FnOnce(Error) + Send + 'static) -> Self {
        let success = match self.completion {
            Completion::Split { success, .. } => success,
            Completion::Unified(_) => None,
        };
        self.completion = Completion::Split {
            success,
            error: Some(Box::new(callback)),
        };
        self
    }

    /// Called once with the outcome. Replaces `success` and `error`.
    ///
    /// A completion handles failures, so nothing reaches the
    /// unhandled-failure hook.
    pub fn completion(mut self, callback: impl FnOnce(Result<R>) + Send + 'static) -> Self {
        self.completion = Completion::Unified(Box::new(callback));
        self
    }

    /// Builds the descriptor.
    pub fn build(self) -> Transaction<R> {
        let id = self.ctx.next_transaction_id();
        Transaction {
            ticket: Arc::new(TransactionTicket::new(id, self.name)),
            ctx: self.ctx,
            work: Some(self.work),
            run_in_transaction: self.run_in_transaction,
            callback_policy: self.callback_policy,
            completion: self.completion,
            outcome: None,
        }
    }

    /// Builds the descriptor and submits it to the queue.
    pub fn execute(self) -> Result<TransactionHandle> {
        self.build().execute()
    }

    /// Builds the descriptor and runs it on the calling thread.
    pub fn execute_sync(self) -> Result<()> {
        self.build().execute_sync()
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Serial Transaction Queue
//!
//! One worker thread per database drains a FIFO channel of descriptors and
//! runs them one at a time against the shared connection.
//!
//! ```text
//!   Transaction::execute ──► registry.insert(ticket)
//!                        └─► mpsc::Sender<WorkerRequest> ──► rowflow-queue-<db>
//!                                                                  │
//!                            ┌─────────────────────────────────────┘
//!                            ▼
//!                  registry.remove(ticket)
//!                  ticket.try_start()? ── no ──► drop (cancelled)
//!                            │ yes
//!                            ▼
//!                  lock connection ─► run unit of work ─► unlock
//!                            │
//!                            ▼
//!                  complete: callbacks / unhandled-failure hook
//! ```
//!
//! ## Why a Registry?
//!
//! A `std::sync::mpsc` channel can't remove an element from the middle. The
//! registry holds the ticket of every descriptor still waiting, which is what
//! cancel-by-name and `pending_count` look at. A cancelled descriptor stays in
//! the channel until the worker reaches it, sees the `Cancelled` status, and
//! drops it without running it or calling back.
//!
//! ## Rust Concepts
//!
//! - **Actor thread**: the worker owns the receiving end; submitters only
//!   hold a `Sender`, so submission never blocks on running work.
//! - **Type erasure**: descriptors of any result type travel as
//!   `Box<dyn QueuedWork>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::connection::SharedConnection;
use crate::error::{Error, Result};
use crate::transaction::{QueuedWork, TransactionHandle, TransactionTicket};
use crate::types::{TransactionId, TransactionStatus};

/// Requests handled by the queue worker.
pub(crate) enum WorkerRequest {
    /// Run one descriptor.
    Execute(Box<dyn QueuedWork>),

    /// Stop after the requests already queued.
    Shutdown,
}

type Registry = Arc<Mutex<HashMap<TransactionId, Arc<TransactionTicket>>>>;

fn lock_registry(
    registry: &Registry,
) -> MutexGuard<'_, HashMap<TransactionId, Arc<TransactionTicket>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running queue: its worker thread and the tickets still waiting.
pub(crate) struct TransactionQueue {
    name: String,
    request_tx: Sender<WorkerRequest>,
    registry: Registry,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TransactionQueue {
    /// Spawns the worker thread `rowflow-queue-<name>`.
    pub(crate) fn spawn(name: &str, connection: SharedConnection) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            name: name.to_string(),
            connection,
            registry: Arc::clone(&registry),
            running: Arc::clone(&running),
        };

        let thread_handle = thread::Builder::new()
            .name(format!("rowflow-queue-{name}"))
            .spawn(move || worker.run(request_rx))
            .map_err(|e| Error::Config(format!("failed to spawn queue thread: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            request_tx,
            registry,
            running,
            thread_handle: Some(thread_handle),
        })
    }

    /// Appends a descriptor to the end of the queue.
    pub(crate) fn add(&self, work: Box<dyn QueuedWork>) -> Result<TransactionHandle> {
        let ticket = Arc::clone(work.ticket());
        let handle = TransactionHandle::new(Arc::clone(&ticket));

        if !ticket.mark_pending() {
            // Cancelled before submission.
            trace!(transaction_id = %ticket.id(), "descriptor not queued, status {:?}", ticket.status());
            return Ok(handle);
        }

        lock_registry(&self.registry).insert(ticket.id(), Arc::clone(&ticket));

        if self.request_tx.send(WorkerRequest::Execute(work)).is_err() {
            lock_registry(&self.registry).remove(&ticket.id());
            ticket.try_cancel();
            return Err(Error::QueueClosed(self.name.clone()));
        }

        trace!(transaction_id = %ticket.id(), name = ?ticket.name(), "transaction queued");
        Ok(handle)
    }

    /// Cancels one descriptor if it is still waiting.
    pub(crate) fn cancel_transaction(&self, handle: &TransactionHandle) -> bool {
        let cancelled = handle.cancel();
        if cancelled {
            lock_registry(&self.registry).remove(&handle.id());
        }
        cancelled
    }

    /// Cancels every waiting descriptor named `name`. Returns how many.
    pub(crate) fn cancel(&self, name: &str) -> usize {
        let mut registry = lock_registry(&self.registry);
        let matching: Vec<TransactionId> = registry
            .values()
            .filter(|ticket| ticket.name() == Some(name))
            .filter(|ticket| ticket.try_cancel())
            .map(|ticket| ticket.id())
            .collect();

        for id in &matching {
            registry.remove(id);
        }
        if !matching.is_empty() {
            trace!(name, cancelled = matching.len(), "transactions cancelled by name");
        }
        matching.len()
    }

    /// Cancels every waiting descriptor. Returns how many.
    pub(crate) fn cancel_all(&self) -> usize {
        lock_registry(&self.registry)
            .drain()
            .filter(|(_, ticket)| ticket.try_cancel())
            .count()
    }

    /// Descriptors submitted but not yet started or cancelled.
    pub(crate) fn pending_count(&self) -> usize {
        lock_registry(&self.registry)
            .values()
            .filter(|ticket| ticket.status() == TransactionStatus::Pending)
            .count()
    }

    /// True until the worker thread has exited.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the worker after the requests already queued and waits for it.
    ///
    /// Called from the worker itself (e.g. from inside a unit of work), it
    /// only signals and returns.
    pub(crate) fn shutdown(&mut self) {
        let _ = self.request_tx.send(WorkerRequest::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(database = %self.name, "queue worker thread panicked");
            }
        }
    }
}

impl Drop for TransactionQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

struct Worker {
    name: String,
    connection: SharedConnection,
    registry: Registry,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, request_rx: Receiver<WorkerRequest>) {
        debug!(database = %self.name, "transaction queue started");

        while let Ok(request) = request_rx.recv() {
            match request {
                WorkerRequest::Execute(work) => self.execute(work),
                WorkerRequest::Shutdown => break,
            }
        }

        self.running.store(false, Ordering::Release);
        debug!(database = %self.name, "transaction queue stopped");
    }

    fn execute(&self, mut work: Box<dyn QueuedWork>) {
        let ticket = Arc::clone(work.ticket());
        lock_registry(&self.registry).remove(&ticket.id());

        if !ticket.try_start() {
            trace!(transaction_id = %ticket.id(), name = ?ticket.name(), "skipping cancelled transaction");
            return;
        }
        trace!(transaction_id = %ticket.id(), name = ?ticket.name(), "transaction dequeued");

        match self.connection.lock() {
            Ok(mut conn) => work.run(&mut conn),
            Err(e) => {
                error!(database = %self.name, transaction_id = %ticket.id(), error = %e, "queue worker could not take the connection");
                work.fail(e);
            }
        }

        work.complete();
    }
}

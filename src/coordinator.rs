//! # Transaction Coordinator
//!
//! The per-database owner of the transaction queue. Everything that submits,
//! cancels or inspects queued work goes through here.
//!
//! Resetting replaces the queue: a fresh worker is started on the same
//! connection, then the old queue's waiting descriptors are cancelled and
//! its worker is stopped once the descriptor it is running (if any) returns.
//! Work submitted concurrently with a reset lands on one queue or the other,
//! never nowhere.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::connection::SharedConnection;
use crate::error::{Error, Result};
use crate::queue::TransactionQueue;
use crate::transaction::{Transaction, TransactionHandle};

/// Owns the queue of one database context.
pub struct TransactionCoordinator {
    name: String,
    connection: SharedConnection,
    queue: Mutex<Option<TransactionQueue>>,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("name", &self.name)
            .field("queue", &*self.queue())
            .finish()
    }
}

impl TransactionCoordinator {
    pub(crate) fn start(name: &str, connection: SharedConnection) -> Result<Self> {
        let queue = TransactionQueue::spawn(name, connection.clone())?;

        Ok(Self {
            name: name.to_string(),
            connection,
            queue: Mutex::new(Some(queue)),
        })
    }

    fn queue(&self) -> MutexGuard<'_, Option<TransactionQueue>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits a descriptor. Fails with `Error::QueueClosed` after `shutdown`.
    pub fn add_transaction<R: Send + 'static>(
        &self,
        transaction: Transaction<R>,
    ) -> Result<TransactionHandle> {
        match &*self.queue() {
            Some(queue) => queue.add(Box::new(transaction)),
            None => Err(Error::QueueClosed(self.name.clone())),
        }
    }

    /// Cancels one descriptor if it has not started.
    pub fn cancel_transaction(&self, handle: &TransactionHandle) -> bool {
        match &*self.queue() {
            Some(queue) => queue.cancel_transaction(handle),
            None => handle.cancel(),
        }
    }

    /// Cancels every waiting descriptor named `name`. Returns how many.
    pub fn cancel(&self, name: &str) -> usize {
        self.queue().as_ref().map_or(0, |queue| queue.cancel(name))
    }

    /// Descriptors submitted but not yet started or cancelled.
    pub fn pending_count(&self) -> usize {
        self.queue().as_ref().map_or(0, TransactionQueue::pending_count)
    }

    /// True while a worker is accepting and running work.
    pub fn is_running(&self) -> bool {
        self.queue()
            .as_ref()
            .is_some_and(TransactionQueue::is_running)
    }

    /// Drops every waiting descriptor without calling back and restarts the
    /// worker on the same connection.
    pub fn reset(&self) -> Result<()> {
        let fresh = TransactionQueue::spawn(&self.name, self.connection.clone())?;
        let old = self.queue().replace(fresh);

        if let Some(old) = old {
            self.tear_down(old);
        }
        debug!(database = %self.name, "transaction queue reset");
        Ok(())
    }

    /// Drops every waiting descriptor and stops the worker for good.
    pub fn shutdown(&self) {
        let old = self.queue().take();
        if let Some(old) = old {
            self.tear_down(old);
        }
    }

    fn tear_down(&self, mut queue: TransactionQueue) {
        let dropped = queue.cancel_all();
        if dropped > 0 {
            warn!(database = %self.name, dropped, "pending transactions dropped");
        }
        queue.shutdown();
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::config::DatabaseConfig;
    use crate::connection::DatabaseConnection;
    use crate::context::DatabaseContext;
    use crate::error::Error;
    use crate::types::TransactionStatus;

    fn context() -> DatabaseContext {
        DatabaseContext::open_in_memory("coordinator-unit").unwrap()
    }

    #[test]
    fn test_runs_on_named_worker_thread() {
        let ctx = context();
        let (tx, rx) = mpsc::channel();

        ctx.begin_transaction_async(|_: &mut DatabaseConnection| {
            Ok(std::thread::current().name().map(str::to_string))
        })
        .run_callbacks_on_same_thread(true)
        .success(move |name| tx.send(name).unwrap())
        .execute()
        .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("rowflow-queue-coordinator-unit"));
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let ctx = context();
        ctx.coordinator().shutdown();

        assert!(!ctx.coordinator().is_running());
        let result = ctx
            .begin_transaction_async(|_: &mut DatabaseConnection| Ok(()))
            .execute();
        assert!(matches!(result, Err(Error::QueueClosed(_))));
    }

    #[test]
    fn test_cancel_by_name_skips_all_matches() {
        let ctx = context();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        ctx.begin_transaction_async(move |_: &mut DatabaseConnection| {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Ok(())
        })
        .execute()
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                ctx.begin_transaction_async(|_: &mut DatabaseConnection| Ok(()))
                    .name("dup")
                    .execute()
                    .unwrap()
            })
            .collect();
        assert_eq!(ctx.coordinator().pending_count(), 3);

        assert_eq!(ctx.coordinator().cancel("dup"), 3);
        assert_eq!(ctx.coordinator().pending_count(), 0);
        release_tx.send(()).unwrap();

        for handle in handles {
            assert_eq!(handle.status(), TransactionStatus::Cancelled);
        }
    }

    #[test]
    fn test_reset_keeps_queue_usable() {
        let ctx = context();
        ctx.coordinator().reset().unwrap();
        assert!(ctx.coordinator().is_running());

        let value = ctx
            .execute_transaction(|_: &mut DatabaseConnection| Ok(41 + 1))
            .unwrap();
        assert_eq!(value, 42);

        let (tx, rx) = mpsc::channel();
        ctx.begin_transaction_async(|_: &mut DatabaseConnection| Ok(()))
            .success(move |_| tx.send(()).unwrap())
            .execute()
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}

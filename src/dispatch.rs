//! # Callback Delivery
//!
//! Success and error callbacks never run while the connection is held. They
//! run either inline, on the thread that finished the unit of work, or are
//! posted to a [`CallbackExecutor`], the context's "main" execution context.
//!
//! The default executor is a [`CallbackDispatcher`]: one named thread draining
//! a channel of boxed jobs, the same actor shape as the queue worker.
//!
//! ```text
//!   queue worker ──post(job)──► mpsc ──► rowflow-callbacks-<db> thread ──► job()
//! ```
//!
//! Applications with their own event loop implement [`CallbackExecutor`] and
//! hand it to `DatabaseContext::builder(..).callback_executor(..)`.
//!
//! A panicking callback is caught and logged; it never takes down the
//! thread that ran it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{panic_message, Error, Result};

/// A boxed callback invocation.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs completion callbacks somewhere other than the connection's thread.
pub trait CallbackExecutor: Send + Sync {
    /// Schedules `job`. Must not block on the job's completion.
    fn post(&self, job: Job);
}

/// Runs every job immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn post(&self, job: Job) {
        run_job(job);
    }
}

/// Runs a job, logging instead of unwinding if it panics.
pub(crate) fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        warn!(panic = %panic_message(payload.as_ref()), "transaction callback panicked");
    }
}

// =============================================================================
// Callback Dispatcher
// =============================================================================

enum DispatchRequest {
    Run(Job),
    Shutdown,
}

/// A dedicated thread that runs posted callbacks in order.
#[derive(Debug)]
pub struct CallbackDispatcher {
    request_tx: Sender<DispatchRequest>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    /// Spawns the dispatcher thread `rowflow-callbacks-<name>`.
    pub fn spawn(name: &str) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel();

        let thread_handle = thread::Builder::new()
            .name(format!("rowflow-callbacks-{name}"))
            .spawn(move || run_dispatcher(request_rx))
            .map_err(|e| Error::Config(format!("failed to spawn callback thread: {e}")))?;

        Ok(Self {
            request_tx,
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    /// Runs the jobs already posted, then stops the thread.
    ///
    /// Jobs posted afterwards run inline. Calling this from a callback does
    /// not wait for the dispatcher thread.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(DispatchRequest::Shutdown);

        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("callback dispatcher thread panicked");
            }
        }
    }
}

impl CallbackExecutor for CallbackDispatcher {
    fn post(&self, job: Job) {
        if let Err(mpsc::SendError(request)) = self.request_tx.send(DispatchRequest::Run(job)) {
            if let DispatchRequest::Run(job) = request {
                debug!("callback dispatcher stopped, running callback inline");
                run_job(job);
            }
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatcher(request_rx: Receiver<DispatchRequest>) {
    while let Ok(request) = request_rx.recv() {
        match request {
            DispatchRequest::Run(job) => run_job(job),
            DispatchRequest::Shutdown => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_dispatcher_runs_jobs_in_order_on_its_thread() {
        let dispatcher = CallbackDispatcher::spawn("test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            dispatcher.post(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                seen.lock().unwrap().push((i, name));
            }));
        }
        dispatcher.shutdown();

        let seen = seen.lock().unwrap();
        let order: Vec<i32> = seen.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(seen
            .iter()
            .all(|(_, name)| name.as_deref() == Some("rowflow-callbacks-test")));
    }

    #[test]
    fn test_panicking_job_does_not_stop_dispatcher() {
        let dispatcher = CallbackDispatcher::spawn("panics").unwrap();
        let (tx, rx) = mpsc::channel();

        dispatcher.post(Box::new(|| panic!("callback failure")));
        dispatcher.post(Box::new(move || tx.send(()).unwrap()));

        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("second job should run");
    }

    #[test]
    fn test_post_after_shutdown_runs_inline() {
        let dispatcher = CallbackDispatcher::spawn("closed").unwrap();
        dispatcher.shutdown();

        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        dispatcher.post(Box::new(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        }));

        assert_eq!(*ran_on.lock().unwrap(), Some(thread::current().id()));
    }
}

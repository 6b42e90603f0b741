//! # Async Bridges
//!
//! Turns a queued transaction into something you can `.await`.
//!
//! ```text
//!   ctx.transact(work)              (cold: nothing happens until polled)
//!         │ first poll
//!         ▼
//!   build descriptor with an inline completion ──► oneshot::Sender
//!   execute() on the queue
//!         │
//!         ▼
//!   select! {
//!       oneshot::Receiver      ──► Ok(value) / Err(e)
//!       descriptor cancelled   ──► Err(Error::Cancelled)
//!       caller's token         ──► cancel descriptor if still waiting
//!   }
//! ```
//!
//! ## Cancellation
//!
//! - Dropping the future cancels the descriptor if it has not started.
//! - A descriptor cancelled by name or dropped by `reset` resolves the
//!   future with `Err(Error::Cancelled)`.
//! - Once the work has started it runs to completion; its result is
//!   delivered if anyone is still waiting and discarded otherwise.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchBuilder, BatchUnitOfWork, EntityAdapter};
use crate::context::DatabaseContext;
use crate::error::{Error, Result};
use crate::transaction::{TransactionHandle, UnitOfWork};

/// Cancels the descriptor when the awaiting future is dropped early.
struct CancelOnDrop {
    handle: TransactionHandle,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.cancel();
        }
    }
}

async fn run_awaited<W: UnitOfWork>(
    ctx: DatabaseContext,
    work: W,
    token: Option<CancellationToken>,
) -> Result<W::Output> {
    let (result_tx, mut result_rx) = oneshot::channel();

    let transaction = ctx
        .begin_transaction_async(work)
        .run_callbacks_on_same_thread(true)
        .completion(move |result| {
            // The receiver is gone if the caller stopped waiting.
            let _ = result_tx.send(result);
        })
        .build();

    let mut guard = CancelOnDrop {
        handle: transaction.handle(),
        armed: true,
    };
    transaction.execute()?;

    let token = token.unwrap_or_default();
    let outcome = tokio::select! {
        biased;

        result = &mut result_rx => result.unwrap_or(Err(Error::Cancelled)),
        _ = guard.handle.cancelled() => Err(Error::Cancelled),
        _ = token.cancelled() => {
            if guard.handle.cancel() {
                Err(Error::Cancelled)
            } else {
                // Already running; wait for it.
                (&mut result_rx).await.unwrap_or(Err(Error::Cancelled))
            }
        }
    };

    guard.armed = false;
    outcome
}

impl DatabaseContext {
    /// Runs `work` on the queue and resolves with its result.
    ///
    /// The returned future is cold and `'static`: nothing is queued until it
    /// is first polled, and it may be spawned onto any runtime.
    ///
    /// # Errors
    ///
    /// - Whatever `work` returns, or `Error::Panicked`
    /// - `Error::Cancelled` if the descriptor is cancelled before it starts
    /// - `Error::QueueClosed` after `close`
    pub fn transact<W: UnitOfWork>(
        &self,
        work: W,
    ) -> impl Future<Output = Result<W::Output>> + Send + 'static {
        run_awaited(self.clone(), work, None)
    }

    /// Like [`transact`](Self::transact), with an explicit cancellation token.
    ///
    /// Cancelling the token cancels the descriptor if it has not started;
    /// otherwise the future still resolves with the work's result.
    pub fn transact_with_cancel<W: UnitOfWork>(
        &self,
        work: W,
        token: CancellationToken,
    ) -> impl Future<Output = Result<W::Output>> + Send + 'static {
        run_awaited(self.clone(), work, Some(token))
    }
}

// =============================================================================
// Entity Helpers
// =============================================================================

async fn await_one<A: EntityAdapter>(
    ctx: &DatabaseContext,
    builder: BatchBuilder<A>,
) -> Result<A::Entity> {
    let mut items = ctx.transact(builder.build()).await?;
    items
        .pop()
        .ok_or_else(|| Error::work("batch returned no entity"))
}

/// Saves one entity on the queue and returns it (with its key assigned).
pub async fn await_save<A: EntityAdapter>(
    ctx: &DatabaseContext,
    entity: A::Entity,
    adapter: Arc<A>,
) -> Result<A::Entity> {
    await_one(ctx, BatchUnitOfWork::save_builder(adapter).add(entity)).await
}

/// Inserts one entity on the queue and returns it (with its key assigned).
pub async fn await_insert<A: EntityAdapter>(
    ctx: &DatabaseContext,
    entity: A::Entity,
    adapter: Arc<A>,
) -> Result<A::Entity> {
    await_one(ctx, BatchUnitOfWork::insert_builder(adapter).add(entity)).await
}

/// Updates one entity on the queue.
pub async fn await_update<A: EntityAdapter>(
    ctx: &DatabaseContext,
    entity: A::Entity,
    adapter: Arc<A>,
) -> Result<A::Entity> {
    await_one(ctx, BatchUnitOfWork::update_builder(adapter).add(entity)).await
}

/// Deletes one entity on the queue.
pub async fn await_delete<A: EntityAdapter>(
    ctx: &DatabaseContext,
    entity: A::Entity,
    adapter: Arc<A>,
) -> Result<A::Entity> {
    await_one(ctx, BatchUnitOfWork::delete_builder(adapter).add(entity)).await
}

/// Saves every entity in one unit of work.
pub async fn await_save_all<A: EntityAdapter>(
    ctx: &DatabaseContext,
    items: impl IntoIterator<Item = A::Entity>,
    adapter: Arc<A>,
) -> Result<Vec<A::Entity>> {
    ctx.transact(BatchUnitOfWork::save_builder(adapter).add_all(items).build())
        .await
}

/// Inserts every entity in one unit of work.
pub async fn await_insert_all<A: EntityAdapter>(
    ctx: &DatabaseContext,
    items: impl IntoIterator<Item = A::Entity>,
    adapter: Arc<A>,
) -> Result<Vec<A::Entity>> {
    ctx.transact(BatchUnitOfWork::insert_builder(adapter).add_all(items).build())
        .await
}

/// Updates every entity in one unit of work.
pub async fn await_update_all<A: EntityAdapter>(
    ctx: &DatabaseContext,
    items: impl IntoIterator<Item = A::Entity>,
    adapter: Arc<A>,
) -> Result<Vec<A::Entity>> {
    ctx.transact(BatchUnitOfWork::update_builder(adapter).add_all(items).build())
        .await
}

/// Deletes every entity in one unit of work.
pub async fn await_delete_all<A: EntityAdapter>(
    ctx: &DatabaseContext,
    items: impl IntoIterator<Item = A::Entity>,
    adapter: Arc<A>,
) -> Result<Vec<A::Entity>> {
    ctx.transact(BatchUnitOfWork::delete_builder(adapter).add_all(items).build())
        .await
}

// =============================================================================
// Tests
// =============================================================================

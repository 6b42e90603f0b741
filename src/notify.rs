//! # Change Notification
//!
//! After a write, the adapter layer tells the [`ChangeNotifier`] which table
//! changed. The notifier fans the event out two ways:
//!
//! ```text
//!                 notify_table_changed / notify_model_changed
//!                                  │
//!                                  ▼
//!                        ┌───────────────────┐
//!                        │  ChangeNotifier   │
//!                        └─────────┬─────────┘
//!                    ┌─────────────┴──────────────┐
//!                    ▼                            ▼
//!        ┌───────────────────────┐    ┌───────────────────────┐
//!        │ TableNotifierRegister │    │  broadcast::Sender    │
//!        │  (sync listener call, │    │  (ChangeSubscription, │
//!        │   per registered      │    │   async consumers)    │
//!        │   table)              │    │                       │
//!        └───────────────────────┘    └───────────────────────┘
//! ```
//!
//! 1. **Registers** are synchronous: the listener runs on the writer's thread
//!    before `notify_*` returns. This is what [`LiveQuery`](crate::stream::LiveQuery)
//!    uses to learn that it must re-query.
//! 2. **Subscriptions** ride a `tokio::sync::broadcast` channel, the same
//!    pub/sub shape as live event tailing: every receiver gets a copy, slow
//!    receivers see `Error::SubscriptionLagged`.
//!
//! ## Failure Isolation
//!
//! `notify_*` never fails and never panics into the writer. A listener that
//! panics is caught, logged at `warn`, and the remaining listeners still run.
//!
//! ## Rust Concepts
//!
//! - **`RwLock` snapshot**: listeners are cloned out of the registry under a
//!   read lock and invoked after the lock is released, so a listener may
//!   register or unregister without deadlocking.
//! - **RAII**: dropping a [`TableNotifierRegister`] removes it from the registry.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::batch::EntityAdapter;
use crate::error::{panic_message, Error, Result};
use crate::types::{ChangeAction, ChangeEvent, TableId};

// =============================================================================
// Observer Capability
// =============================================================================

/// Receives table change notifications.
///
/// Implemented for any `Fn(&TableId, ChangeAction) + Send + Sync` closure.
/// Override [`on_change`](ChangeObserver::on_change) to see affected keys.
pub trait ChangeObserver: Send + Sync {
    /// Called once per change event for a registered table.
    fn on_table_changed(&self, table: &TableId, action: ChangeAction);

    /// Called with the full event. Defaults to `on_table_changed`.
    fn on_change(&self, event: &ChangeEvent) {
        self.on_table_changed(&event.table, event.action);
    }
}

impl<F> ChangeObserver for F
where
    F: Fn(&TableId, ChangeAction) + Send + Sync,
{
    fn on_table_changed(&self, table: &TableId, action: ChangeAction) {
        self(table, action)
    }
}

// =============================================================================
// Change Notifier
// =============================================================================

/// One registration: the tables it listens to and its listener.
#[derive(Default)]
struct RegisterEntry {
    tables: HashSet<TableId>,
    listener: Option<Arc<dyn ChangeObserver>>,
}

struct NotifierShared {
    registers: RwLock<HashMap<u64, RegisterEntry>>,
    next_register_id: AtomicU64,
    broadcast_tx: broadcast::Sender<ChangeEvent>,
}

/// Distributes change events to registers and subscriptions.
///
/// `ChangeNotifier` is cheap to clone; all clones share one registry. Each
/// [`DatabaseContext`](crate::DatabaseContext) owns one, and every
/// [`DatabaseConnection`](crate::DatabaseConnection) it hands to a unit of
/// work carries a clone.
#[derive(Clone)]
pub struct ChangeNotifier {
    shared: Arc<NotifierShared>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("registers", &self.register_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ChangeNotifier {
    /// Creates a notifier whose broadcast channel buffers `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; `DatabaseConfig::validate` rejects that.
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);

        Self {
            shared: Arc::new(NotifierShared {
                registers: RwLock::new(HashMap::new()),
                next_register_id: AtomicU64::new(1),
                broadcast_tx,
            }),
        }
    }

    /// Publishes a table-level change.
    pub fn notify_table_changed(&self, table: impl Into<TableId>, action: ChangeAction) {
        self.notify(ChangeEvent::table(table, action));
    }

    /// Publishes a change for one entity, keyed by its primary key when it has one.
    pub fn notify_model_changed<A: EntityAdapter + ?Sized>(
        &self,
        entity: &A::Entity,
        adapter: &A,
        action: ChangeAction,
    ) {
        let event = ChangeEvent::table(adapter.table(), action)
            .with_keys(adapter.primary_key(entity));
        self.notify(event);
    }

    /// Publishes an event to every register listening on its table, then to
    /// the broadcast channel.
    pub fn notify(&self, event: ChangeEvent) {
        let listeners: Vec<Arc<dyn ChangeObserver>> = {
            let registers = self
                .shared
                .registers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            registers
                .values()
                .filter(|entry| entry.tables.contains(&event.table))
                .filter_map(|entry| entry.listener.clone())
                .collect()
        };

        for listener in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_change(&event)));
            if let Err(payload) = delivered {
                warn!(
                    table = %event.table,
                    action = %event.action,
                    panic = %panic_message(payload.as_ref()),
                    "change observer panicked"
                );
            }
        }

        // No receivers is fine.
        let _ = self.shared.broadcast_tx.send(event);
    }

    /// Creates a new, empty registration.
    pub fn new_register(&self) -> TableNotifierRegister {
        let id = self.shared.next_register_id.fetch_add(1, Ordering::Relaxed);
        self.write_registers().insert(id, RegisterEntry::default());

        TableNotifierRegister {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Subscribes to every change event.
    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription::new(self.shared.broadcast_tx.subscribe())
    }

    /// Subscribes to change events of one table.
    pub fn subscribe_table(&self, table: impl Into<TableId>) -> ChangeSubscription {
        ChangeSubscription::with_filter(self.shared.broadcast_tx.subscribe(), table.into())
    }

    /// Returns the number of live registrations.
    pub fn register_count(&self) -> usize {
        self.shared
            .registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns the number of broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.broadcast_tx.receiver_count()
    }

    fn write_registers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, RegisterEntry>> {
        self.shared
            .registers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Table Notifier Register
// =============================================================================

/// A per-consumer registration of tables and one listener.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use rowflow::notify::ChangeNotifier;
/// use rowflow::types::{ChangeAction, TableId};
///
/// let notifier = ChangeNotifier::new(16);
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// let register = notifier.new_register();
/// register.register("notes");
/// let counter = Arc::clone(&hits);
/// register.set_listener(move |_: &TableId, _: ChangeAction| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// notifier.notify_table_changed("notes", ChangeAction::Insert);
/// notifier.notify_table_changed("tags", ChangeAction::Insert);
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
pub struct TableNotifierRegister {
    id: u64,
    shared: Arc<NotifierShared>,
}

impl std::fmt::Debug for TableNotifierRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableNotifierRegister")
            .field("id", &self.id)
            .field("tables", &self.tables())
            .finish()
    }
}

impl TableNotifierRegister {
    /// Starts listening to `table`. Registering the same table twice is a no-op.
    pub fn register(&self, table: impl Into<TableId>) {
        let table = table.into();
        self.with_entry(|entry| {
            entry.tables.insert(table);
        });
    }

    /// Stops listening to `table`.
    pub fn unregister(&self, table: impl Into<TableId>) {
        let table = table.into();
        self.with_entry(|entry| {
            entry.tables.remove(&table);
        });
    }

    /// Stops listening to every table and drops the listener.
    pub fn unregister_all(&self) {
        self.with_entry(|entry| {
            entry.tables.clear();
            entry.listener = None;
        });
    }

    /// Sets the listener, replacing any previous one.
    pub fn set_listener(&self, listener: impl ChangeObserver + 'static) {
        let listener: Arc<dyn ChangeObserver> = Arc::new(listener);
        self.with_entry(|entry| entry.listener = Some(listener));
    }

    /// Removes the listener but keeps the table registrations.
    pub fn clear_listener(&self) {
        self.with_entry(|entry| entry.listener = None);
    }

    /// Returns true while at least one table is registered.
    pub fn is_subscribed(&self) -> bool {
        self.shared
            .registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.id)
            .is_some_and(|entry| !entry.tables.is_empty())
    }

    /// Returns the registered tables.
    pub fn tables(&self) -> Vec<TableId> {
        self.shared
            .registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.id)
            .map(|entry| entry.tables.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn with_entry(&self, f: impl FnOnce(&mut RegisterEntry)) {
        let mut registers = self
            .shared
            .registers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(registers.entry(self.id).or_default());
    }
}

impl Drop for TableNotifierRegister {
    fn drop(&mut self) {
        self.shared
            .registers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

// =============================================================================
// Change Subscription
// =============================================================================

/// An async subscription to change events.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = ctx.notifier().subscribe_table("notes");
///
/// while let Some(event) = sub.next().await {
///     let event = event?;
///     println!("{} on {}", event.action, event.table);
/// }
/// ```
///
/// # Backpressure
///
/// Events are buffered up to `DatabaseConfig::change_broadcast_capacity`.
/// A subscriber that falls further behind receives
/// `Err(Error::SubscriptionLagged(n))` once and then continues with the
/// oldest retained event.
pub struct ChangeSubscription {
    /// Broadcast receiver for change events.
    receiver: broadcast::Receiver<ChangeEvent>,

    /// Optional table filter.
    table_filter: Option<TableId>,
}

impl ChangeSubscription {
    /// Creates a subscription from a broadcast receiver.
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            receiver,
            table_filter: None,
        }
    }

    /// Creates a subscription that only yields events of `table`.
    pub fn with_filter(receiver: broadcast::Receiver<ChangeEvent>, table: TableId) -> Self {
        Self {
            receiver,
            table_filter: Some(table),
        }
    }

    /// Receives the next event.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(event))` - Next event
    /// - `Some(Err(e))` - Lagged
    /// - `None` - The notifier was dropped
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if !self.accepts(&event) {
                        continue;
                    }
                    return Some(Ok(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Receives the next event without waiting.
    ///
    /// Returns `None` when nothing is buffered or the notifier is gone.
    pub fn try_next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if !self.accepts(&event) {
                        continue;
                    }
                    return Some(Ok(event));
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return None;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Converts the subscription into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent>> + Send + 'static {
        let filter = self.table_filter;
        BroadcastStream::new(self.receiver).filter_map(move |item| {
            let item = match item {
                Ok(event) => match &filter {
                    Some(table) if &event.table != table => None,
                    _ => Some(Ok(event)),
                },
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(Error::SubscriptionLagged(n))),
            };
            futures::future::ready(item)
        })
    }

    /// Returns the number of events waiting in this subscriber's buffer.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn accepts(&self, event: &ChangeEvent) -> bool {
        match &self.table_filter {
            Some(table) => &event.table == table,
            None => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Bulk Entity Operations
//!
//! [`BatchUnitOfWork`] saves, inserts, updates or deletes a list of entities
//! of one type through a single [`EntityAdapter`] bulk call. Run it like any
//! other unit of work; it returns the same list it was built with.
//!
//! ```text
//! vec![a, b, c].fast_save(adapter)      BatchBuilder { Save, [a, b, c] }
//!         │                                      │ build()
//!         ▼                                      ▼
//!  BatchUnitOfWork::execute(conn) ──► adapter.save_all(conn, [a, b, c])
//!                                           │  per-row INSERT / UPDATE
//!                                           │  cache writes staged
//!                                           └► ONE ChangeEvent { Save, keys }
//!                                              published on commit
//! ```
//!
//! ## The Adapter Seam
//!
//! Mapping between an entity and its row is the adapter's business. An
//! adapter implements the per-row statements ([`EntityAdapter::insert`],
//! [`update`](EntityAdapter::update), [`delete`](EntityAdapter::delete),
//! [`exists`](EntityAdapter::exists)) and inherits the bulk methods, which
//! take care of the cache and of change notification.
//!
//! Cache writes and the change event are staged on the connection. They take
//! effect when the enclosing native transaction commits and vanish if it
//! rolls back.

use std::slice;
use std::sync::Arc;

use rusqlite::Row;

use crate::cache::ModelLruCache;
use crate::connection::DatabaseConnection;
use crate::error::Result;
use crate::transaction::UnitOfWork;
use crate::types::{ChangeAction, ChangeEvent, PrimaryKey, TableId};

// =============================================================================
// Entity Adapter
// =============================================================================

/// Maps one entity type to one table.
pub trait EntityAdapter: Send + Sync + 'static {
    /// The entity type.
    type Entity: Clone + Send + 'static;

    /// The table this adapter writes.
    fn table(&self) -> TableId;

    /// The entity's primary key, or `None` if it has not been stored yet.
    fn primary_key(&self, entity: &Self::Entity) -> Option<PrimaryKey>;

    /// Inserts one row. Assigns the generated key to the entity, if any.
    fn insert(&self, conn: &DatabaseConnection, entity: &mut Self::Entity) -> Result<()>;

    /// Updates one row. Returns whether a row was changed.
    fn update(&self, conn: &DatabaseConnection, entity: &Self::Entity) -> Result<bool>;

    /// Deletes one row. Returns whether a row was removed.
    fn delete(&self, conn: &DatabaseConnection, entity: &Self::Entity) -> Result<bool>;

    /// Whether the entity's row exists.
    fn exists(&self, conn: &DatabaseConnection, entity: &Self::Entity) -> Result<bool>;

    /// Builds an entity from a row of this table.
    fn load(&self, row: &Row<'_>) -> rusqlite::Result<Self::Entity>;

    /// The entity cache, if this adapter has one.
    fn cache(&self) -> Option<&ModelLruCache<Self::Entity>> {
        None
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Inserts or updates each entity, whichever applies.
    ///
    /// Publishes one `Save` event carrying every stored key.
    fn save_all(&self, conn: &DatabaseConnection, entities: &mut [Self::Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut stored = Stored::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            let updated = self.exists(conn, entity)? && self.update(conn, entity)?;
            if !updated {
                self.insert(conn, entity)?;
            }
            stored.remember(self, entity);
        }

        stored.publish(self, conn, ChangeAction::Save);
        Ok(())
    }

    /// Inserts each entity. Publishes one `Insert` event.
    fn insert_all(&self, conn: &DatabaseConnection, entities: &mut [Self::Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut stored = Stored::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            self.insert(conn, entity)?;
            stored.remember(self, entity);
        }

        stored.publish(self, conn, ChangeAction::Insert);
        Ok(())
    }

    /// Updates each entity. Publishes one `Update` event.
    fn update_all(&self, conn: &DatabaseConnection, entities: &[Self::Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut stored = Stored::with_capacity(entities.len());
        for entity in entities {
            self.update(conn, entity)?;
            stored.remember(self, entity);
        }

        stored.publish(self, conn, ChangeAction::Update);
        Ok(())
    }

    /// Deletes each entity and evicts it from the cache. Publishes one `Delete` event.
    fn delete_all(&self, conn: &DatabaseConnection, entities: &[Self::Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        let mut stored = Stored::with_capacity(entities.len());
        for entity in entities {
            self.delete(conn, entity)?;
            stored.forget(self, entity);
        }

        stored.publish(self, conn, ChangeAction::Delete);
        Ok(())
    }

    // =========================================================================
    // Single-Entity Conveniences
    // =========================================================================

    /// Saves one entity.
    fn save(&self, conn: &DatabaseConnection, entity: &mut Self::Entity) -> Result<()> {
        self.save_all(conn, slice::from_mut(entity))
    }

    /// Loads every row of the table.
    fn load_all(&self, conn: &DatabaseConnection) -> Result<Vec<Self::Entity>> {
        conn.query_list(&format!("SELECT * FROM {}", self.table()), [], |row| {
            self.load(row)
        })
    }
}

enum CacheWrite<E> {
    Put(PrimaryKey, E),
    Evict(PrimaryKey),
}

/// Keys touched by one bulk call, and the cache writes they imply.
struct Stored<E> {
    keys: Vec<PrimaryKey>,
    writes: Vec<CacheWrite<E>>,
}

impl<E: Clone + Send + 'static> Stored<E> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            writes: Vec::new(),
        }
    }

    fn remember<A>(&mut self, adapter: &A, entity: &E)
    where
        A: EntityAdapter<Entity = E> + ?Sized,
    {
        if let Some(key) = adapter.primary_key(entity) {
            if adapter.cache().is_some() {
                self.writes.push(CacheWrite::Put(key, entity.clone()));
            }
            self.keys.push(key);
        }
    }

    fn forget<A>(&mut self, adapter: &A, entity: &E)
    where
        A: EntityAdapter<Entity = E> + ?Sized,
    {
        if let Some(key) = adapter.primary_key(entity) {
            if adapter.cache().is_some() {
                self.writes.push(CacheWrite::Evict(key));
            }
            self.keys.push(key);
        }
    }

    /// Stages the cache writes, then the change event, on `conn`.
    fn publish<A>(self, adapter: &A, conn: &DatabaseConnection, action: ChangeAction)
    where
        A: EntityAdapter<Entity = E> + ?Sized,
    {
        if let Some(cache) = adapter.cache() {
            if !self.writes.is_empty() {
                let cache = cache.clone();
                let writes = self.writes;
                conn.after_commit(move || {
                    for write in writes {
                        match write {
                            CacheWrite::Put(key, model) => cache.add_model(key, model),
                            CacheWrite::Evict(key) => {
                                cache.remove_model(key);
                            }
                        }
                    }
                });
            }
        }

        conn.publish(ChangeEvent::table(adapter.table(), action).with_keys(self.keys));
    }
}

// =============================================================================
// Batch Unit of Work
// =============================================================================

/// Which bulk adapter call a batch makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    /// `save_all`
    Save,
    /// `insert_all`
    Insert,
    /// `update_all`
    Update,
    /// `delete_all`
    Delete,
}

impl BatchOperation {
    /// The change action the adapter publishes for this operation.
    pub fn action(&self) -> ChangeAction {
        match self {
            BatchOperation::Save => ChangeAction::Save,
            BatchOperation::Insert => ChangeAction::Insert,
            BatchOperation::Update => ChangeAction::Update,
            BatchOperation::Delete => ChangeAction::Delete,
        }
    }
}

/// A list of entities and one bulk operation to apply to them.
///
/// Items keep insertion order; duplicates are kept.
pub struct BatchUnitOfWork<A: EntityAdapter> {
    adapter: Arc<A>,
    operation: BatchOperation,
    items: Vec<A::Entity>,
}

impl<A: EntityAdapter> std::fmt::Debug for BatchUnitOfWork<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUnitOfWork")
            .field("table", &self.adapter.table())
            .field("operation", &self.operation)
            .field("items", &self.items.len())
            .finish()
    }
}

impl<A: EntityAdapter> BatchUnitOfWork<A> {
    /// Starts a batch that saves entities.
    pub fn save_builder(adapter: Arc<A>) -> BatchBuilder<A> {
        BatchBuilder::new(adapter, BatchOperation::Save)
    }

    /// Starts a batch that inserts entities.
    pub fn insert_builder(adapter: Arc<A>) -> BatchBuilder<A> {
        BatchBuilder::new(adapter, BatchOperation::Insert)
    }

    /// Starts a batch that updates entities.
    pub fn update_builder(adapter: Arc<A>) -> BatchBuilder<A> {
        BatchBuilder::new(adapter, BatchOperation::Update)
    }

    /// Starts a batch that deletes entities.
    pub fn delete_builder(adapter: Arc<A>) -> BatchBuilder<A> {
        BatchBuilder::new(adapter, BatchOperation::Delete)
    }

    /// The operation this batch performs.
    pub fn operation(&self) -> BatchOperation {
        self.operation
    }

    /// The entities, in insertion order.
    pub fn items(&self) -> &[A::Entity] {
        &self.items
    }
}

impl<A: EntityAdapter> UnitOfWork for BatchUnitOfWork<A> {
    type Output = Vec<A::Entity>;

    fn execute(mut self, conn: &mut DatabaseConnection) -> Result<Vec<A::Entity>> {
        let conn: &DatabaseConnection = conn;
        match self.operation {
            BatchOperation::Save => self.adapter.save_all(conn, &mut self.items)?,
            BatchOperation::Insert => self.adapter.insert_all(conn, &mut self.items)?,
            BatchOperation::Update => self.adapter.update_all(conn, &self.items)?,
            BatchOperation::Delete => self.adapter.delete_all(conn, &self.items)?,
        }
        Ok(self.items)
    }
}

/// Collects the entities of a [`BatchUnitOfWork`].
pub struct BatchBuilder<A: EntityAdapter> {
    adapter: Arc<A>,
    operation: BatchOperation,
    items: Vec<A::Entity>,
}

impl<A: EntityAdapter> BatchBuilder<A> {
    fn new(adapter: Arc<A>, operation: BatchOperation) -> Self {
        Self {
            adapter,
            operation,
            items: Vec::new(),
        }
    }

    /// Appends one entity.
    pub fn add(mut self, entity: A::Entity) -> Self {
        self.items.push(entity);
        self
    }

    /// Appends every entity of `entities`, in order.
    pub fn add_all(mut self, entities: impl IntoIterator<Item = A::Entity>) -> Self {
        self.items.extend(entities);
        self
    }

    /// Number of entities collected so far.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no entity has been added.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Builds the unit of work. The builder's items move into it.
    pub fn build(self) -> BatchUnitOfWork<A> {
        BatchUnitOfWork {
            adapter: self.adapter,
            operation: self.operation,
            items: self.items,
        }
    }
}

// =============================================================================
// Collection Extensions
// =============================================================================

/// Starts a batch from any collection of entities.
///
/// ```rust,ignore
/// let notes = ctx
///     .transact(vec![a, b, c].fast_insert(adapter).build())
///     .await?;
/// ```
pub trait BatchExt: IntoIterator + Sized {
    /// `BatchUnitOfWork::save_builder(adapter).add_all(self)`
    fn fast_save<A>(self, adapter: Arc<A>) -> BatchBuilder<A>
    where
        A: EntityAdapter<Entity = Self::Item>,
    {
        BatchUnitOfWork::save_builder(adapter).add_all(self)
    }

    /// `BatchUnitOfWork::insert_builder(adapter).add_all(self)`
    fn fast_insert<A>(self, adapter: Arc<A>) -> BatchBuilder<A>
    where
        A: EntityAdapter<Entity = Self::Item>,
    {
        BatchUnitOfWork::insert_builder(adapter).add_all(self)
    }

    /// `BatchUnitOfWork::update_builder(adapter).add_all(self)`
    fn fast_update<A>(self, adapter: Arc<A>) -> BatchBuilder<A>
    where
        A: EntityAdapter<Entity = Self::Item>,
    {
        BatchUnitOfWork::update_builder(adapter).add_all(self)
    }

    /// `BatchUnitOfWork::delete_builder(adapter).add_all(self)`
    fn fast_delete<A>(self, adapter: Arc<A>) -> BatchBuilder<A>
    where
        A: EntityAdapter<Entity = Self::Item>,
    {
        BatchUnitOfWork::delete_builder(adapter).add_all(self)
    }
}

impl<I: IntoIterator> BatchExt for I {}

// =============================================================================
// Tests
// =============================================================================

//! # Entity Cache
//!
//! A bounded, least-recently-used cache of loaded entities keyed by numeric
//! primary key. Adapters that return one from
//! [`EntityAdapter::cache`](crate::batch::EntityAdapter::cache) have it kept
//! coherent by every bulk save, insert, update and delete, once the write
//! commits.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;

use crate::config::DEFAULT_CACHE_SIZE;
use crate::types::PrimaryKey;

/// Turns a requested size into a capacity; non-positive sizes use the default.
fn capacity(size: i64) -> NonZeroUsize {
    usize::try_from(size)
        .ok()
        .and_then(NonZeroUsize::new)
        .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE))
        .unwrap_or(NonZeroUsize::MIN)
}

/// An LRU cache of entities.
///
/// Clones are handles to the same entries.
///
/// # Example
///
/// ```rust
/// use rowflow::cache::ModelLruCache;
/// use rowflow::types::PrimaryKey;
///
/// let cache = ModelLruCache::new(2);
/// cache.add_model(PrimaryKey::from_raw(1), "a");
/// cache.add_model(PrimaryKey::from_raw(2), "b");
/// cache.add_model(PrimaryKey::from_raw(3), "c");
///
/// assert_eq!(cache.get(PrimaryKey::from_raw(1)), None);
/// assert_eq!(cache.get(PrimaryKey::from_raw(3)), Some("c"));
/// ```
pub struct ModelLruCache<T> {
    entries: Arc<Mutex<LruCache<i64, T>>>,
}

impl<T> Clone for ModelLruCache<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> std::fmt::Debug for ModelLruCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries();
        f.debug_struct("ModelLruCache")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

impl<T> ModelLruCache<T> {
    fn entries(&self) -> MutexGuard<'_, LruCache<i64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> ModelLruCache<T> {
    /// Creates a cache holding up to `size` entities (`DEFAULT_CACHE_SIZE` if `size <= 0`).
    pub fn new(size: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity(size)))),
        }
    }

    /// Inserts or replaces an entity.
    pub fn add_model(&self, key: PrimaryKey, model: T) {
        self.entries().put(key.as_raw(), model);
    }

    /// Returns a copy of the cached entity and marks it recently used.
    pub fn get(&self, key: PrimaryKey) -> Option<T> {
        self.entries().get(&key.as_raw()).cloned()
    }

    /// Removes an entity, returning it if it was cached.
    pub fn remove_model(&self, key: PrimaryKey) -> Option<T> {
        self.entries().pop(&key.as_raw())
    }

    /// Removes every entity.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Changes the capacity, evicting least recently used entities if needed.
    pub fn set_cache_size(&self, size: i64) {
        self.entries().resize(capacity(size));
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached entities.
    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }
}

impl<T: Clone> Default for ModelLruCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE as i64)
    }
}

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{PoolInner, PoolKey};

/// An object borrowed from a [`KeyedResourcePool`](super::KeyedResourcePool).
///
/// Dropping the guard returns the object to its key's idle set (or destroys
/// it if the idle set is full or the pool is closed).
pub struct PooledObject<K: PoolKey, T: Send + 'static> {
    key: K,
    object: Option<T>,
    pool: Arc<PoolInner<K, T>>,
}

impl<K: PoolKey, T: Send + 'static> PooledObject<K, T> {
    pub(super) fn new(key: K, object: T, pool: Arc<PoolInner<K, T>>) -> Self {
        Self {
            key,
            object: Some(object),
            pool,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Destroy the object instead of returning it, e.g. after it failed in use.
    pub fn invalidate(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.invalidate_object(&self.key, object);
        }
    }
}

impl<K: PoolKey, T: Send + 'static> Deref for PooledObject<K, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `invalidate` and `drop` take the object, and both consume the guard
        self.object.as_ref().unwrap_or_else(|| unreachable!("pooled object already released"))
    }
}

impl<K: PoolKey, T: Send + 'static> DerefMut for PooledObject<K, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().unwrap_or_else(|| unreachable!("pooled object already released"))
    }
}

impl<K: PoolKey, T: Send + 'static> Drop for PooledObject<K, T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.return_object(&self.key, object);
        }
    }
}

impl<K: PoolKey, T: Send + 'static> fmt::Debug for PooledObject<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("key", &self.key.to_string())
            .field("pool", &self.pool.name)
            .finish()
    }
}

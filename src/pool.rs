//! Keyed object pool for dispatchers and requesters.
//!
//! Objects are partitioned by key (the endpoint they talk to). Each key has
//! its own active/idle accounting bounded by `max_active` and `max_idle`,
//! and a global `max_total` bounds the sum over all keys so that many
//! short-lived dynamic endpoints cannot grow the pool without limit. When
//! the global cap is hit, an idle object of another key is evicted to make
//! room before the exhausted action applies.
//!
//! Borrowed objects come back through the [`PooledObject`] guard's `Drop`.

mod exhausted_action;
mod pooled_object;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ConnectorError, ConnectorResult, LockResultExt};

pub use exhausted_action::ExhaustedAction;
pub use pooled_object::PooledObject;

const LOG_TARGET: &str = "connector_runtime::pool";

/// Global cap multiplier: `max_total = TOTAL_PER_ACTIVE * max_active`.
pub const TOTAL_PER_ACTIVE: usize = 20;

/// Requirements on a pool key.
pub trait PoolKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<K> PoolKey for K where K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// Creates and maintains the objects held by a [`KeyedResourcePool`].
#[async_trait]
pub trait PooledObjectFactory<K: PoolKey, T: Send + 'static>: Send + Sync {
    async fn create(&self, key: &K) -> Result<T, BoxError>;

    /// Prepare an object for a borrower.
    fn activate(&self, _key: &K, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }

    /// Reset an object coming back to the idle set.
    fn passivate(&self, _key: &K, _object: &mut T) -> Result<(), BoxError> {
        Ok(())
    }

    fn validate(&self, _key: &K, _object: &T) -> bool {
        true
    }

    fn destroy(&self, _key: &K, _object: T) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    max_active: usize,
    max_idle: usize,
    max_total: usize,
    exhausted_action: ExhaustedAction,
    max_wait: Option<Duration>,
}

struct KeyEntry<T> {
    idle: VecDeque<T>,
    active: usize,
}

impl<T> Default for KeyEntry<T> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            active: 0,
        }
    }
}

impl<T> KeyEntry<T> {
    fn is_empty(&self) -> bool {
        self.active == 0 && self.idle.is_empty()
    }
}

struct PoolState<K, T> {
    entries: HashMap<K, KeyEntry<T>>,
    /// Active plus idle objects over all keys
    total: usize,
    limits: Limits,
    closed: bool,
}

pub(crate) struct PoolInner<K: PoolKey, T: Send + 'static> {
    name: String,
    factory: Arc<dyn PooledObjectFactory<K, T>>,
    state: Mutex<PoolState<K, T>>,
    /// Signalled whenever capacity may have been freed
    released: Notify,
    interrupt: CancellationToken,
}

enum Slot<K, T> {
    Idle(T),
    Create { evicted: Option<(K, T)> },
    Wait,
}

/// Object pool partitioned by key with per-key and global capacity.
pub struct KeyedResourcePool<K: PoolKey, T: Send + 'static> {
    inner: Arc<PoolInner<K, T>>,
}

impl<K: PoolKey, T: Send + 'static> Clone for KeyedResourcePool<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: PoolKey, T: Send + 'static> fmt::Debug for KeyedResourcePool<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock("KeyedResourcePool::fmt()");
        f.debug_struct("KeyedResourcePool")
            .field("name", &self.inner.name)
            .field("limits", &state.limits)
            .field("total", &state.total)
            .finish()
    }
}

impl<K: PoolKey, T: Send + 'static> KeyedResourcePool<K, T> {
    /// Create a pool with `max_active` objects per key.
    ///
    /// `interrupt` aborts `Block` waits with [`ConnectorError::Interrupted`].
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn PooledObjectFactory<K, T>>,
        max_active: usize,
        exhausted_action: ExhaustedAction,
        max_wait: Option<Duration>,
        interrupt: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                factory,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    total: 0,
                    limits: Limits {
                        max_active,
                        max_idle: max_active,
                        max_total: TOTAL_PER_ACTIVE * max_active,
                        exhausted_action,
                        max_wait,
                    },
                    closed: false,
                }),
                released: Notify::new(),
                interrupt,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Borrow an object for `key`, creating one if the key has none idle.
    pub async fn borrow(&self, key: &K) -> ConnectorResult<PooledObject<K, T>> {
        let max_wait = self.inner.lock("KeyedResourcePool::borrow()").limits.max_wait;
        let deadline = max_wait.map(|wait| tokio::time::Instant::now() + wait);

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.inner.reserve(key)? {
                Slot::Idle(mut object) => {
                    match self.inner.prepare(key, &mut object) {
                        Ok(()) => {
                            return Ok(PooledObject::new(key.clone(), object, Arc::clone(&self.inner)));
                        }
                        Err(e) => {
                            debug!(
                                target: LOG_TARGET,
                                "Discarding idle object for {} in {}: {}",
                                key,
                                self.inner.name,
                                e
                            );
                            self.inner.invalidate_object(key, object);
                        }
                    }
                }
                Slot::Create { evicted } => {
                    if let Some((evicted_key, object)) = evicted {
                        debug!(
                            target: LOG_TARGET,
                            "Pool {} at capacity, evicted idle object for {}",
                            self.inner.name,
                            evicted_key
                        );
                        self.inner.factory.destroy(&evicted_key, object);
                    }
                    return self.create(key).await;
                }
                Slot::Wait => {
                    let interrupted = self.inner.interrupt.cancelled();
                    let woke = match deadline {
                        Some(deadline) => tokio::select! {
                            _ = interrupted => None,
                            result = tokio::time::timeout_at(deadline, released) => Some(result.is_ok()),
                        },
                        None => tokio::select! {
                            _ = interrupted => None,
                            _ = released => Some(true),
                        },
                    };
                    match woke {
                        None => {
                            return Err(ConnectorError::interrupted(format!(
                                "waiting for {} in pool {}",
                                key, self.inner.name
                            )));
                        }
                        Some(false) => {
                            return Err(ConnectorError::resource_unavailable(format!(
                                "timed out waiting for an object for {} in pool {}",
                                key, self.inner.name
                            )));
                        }
                        Some(true) => {}
                    }
                }
            }
        }
    }

    async fn create(&self, key: &K) -> ConnectorResult<PooledObject<K, T>> {
        let created = self.inner.factory.create(key).await;
        let mut object = match created {
            Ok(object) => object,
            Err(e) => {
                self.inner.release_slot(key);
                return Err(ConnectorError::resource_unavailable(format!(
                    "failed to create object for {} in pool {}: {}",
                    key, self.inner.name, e
                )));
            }
        };

        if let Err(e) = self.inner.prepare(key, &mut object) {
            self.inner.invalidate_object(key, object);
            return Err(ConnectorError::resource_unavailable(format!(
                "new object for {} in pool {} failed activation: {}",
                key, self.inner.name, e
            )));
        }
        Ok(PooledObject::new(key.clone(), object, Arc::clone(&self.inner)))
    }

    /// Destroy every idle object. Borrowed objects are unaffected.
    pub fn clear(&self) {
        let drained = {
            let mut state = self.inner.lock("KeyedResourcePool::clear()");
            let mut drained = Vec::new();
            for (key, entry) in state.entries.iter_mut() {
                for object in entry.idle.drain(..) {
                    drained.push((key.clone(), object));
                }
            }
            state.total -= drained.len();
            state.entries.retain(|_, entry| !entry.is_empty());
            drained
        };
        self.inner.destroy_all(drained);
    }

    /// Destroy the idle objects of one key.
    pub fn clear_key(&self, key: &K) {
        let drained: Vec<(K, T)> = {
            let mut state = self.inner.lock("KeyedResourcePool::clear_key()");
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            let drained: Vec<(K, T)> = entry.idle.drain(..).map(|o| (key.clone(), o)).collect();
            if entry.is_empty() {
                state.entries.remove(key);
            }
            state.total -= drained.len();
            drained
        };
        self.inner.destroy_all(drained);
    }

    /// Clear the pool and destroy borrowed objects as they come back.
    pub fn close(&self) {
        self.inner.lock("KeyedResourcePool::close()").closed = true;
        self.clear();
        self.inner.released.notify_waiters();
    }

    /// Set the per-key cap. Also sets `max_idle = n` and `max_total = 20 * n`.
    pub fn set_max_active(&self, max_active: usize) {
        {
            let mut state = self.inner.lock("KeyedResourcePool::set_max_active()");
            state.limits.max_active = max_active;
            state.limits.max_idle = max_active;
            state.limits.max_total = TOTAL_PER_ACTIVE * max_active;
        }
        self.inner.released.notify_waiters();
    }

    pub fn max_active(&self) -> usize {
        self.inner.lock("KeyedResourcePool::max_active()").limits.max_active
    }

    pub fn max_idle(&self) -> usize {
        self.inner.lock("KeyedResourcePool::max_idle()").limits.max_idle
    }

    pub fn max_total(&self) -> usize {
        self.inner.lock("KeyedResourcePool::max_total()").limits.max_total
    }

    pub fn set_exhausted_action(&self, action: ExhaustedAction) {
        self.inner.lock("KeyedResourcePool::set_exhausted_action()").limits.exhausted_action = action;
        self.inner.released.notify_waiters();
    }

    pub fn exhausted_action(&self) -> ExhaustedAction {
        self.inner.lock("KeyedResourcePool::exhausted_action()").limits.exhausted_action
    }

    pub fn set_max_wait(&self, max_wait: Option<Duration>) {
        self.inner.lock("KeyedResourcePool::set_max_wait()").limits.max_wait = max_wait;
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.inner.lock("KeyedResourcePool::max_wait()").limits.max_wait
    }

    /// Borrowed objects over all keys.
    pub fn num_active(&self) -> usize {
        let state = self.inner.lock("KeyedResourcePool::num_active()");
        state.entries.values().map(|e| e.active).sum()
    }

    /// Idle objects over all keys.
    pub fn num_idle(&self) -> usize {
        let state = self.inner.lock("KeyedResourcePool::num_idle()");
        state.entries.values().map(|e| e.idle.len()).sum()
    }

    pub fn num_active_for(&self, key: &K) -> usize {
        let state = self.inner.lock("KeyedResourcePool::num_active_for()");
        state.entries.get(key).map_or(0, |e| e.active)
    }

    pub fn num_idle_for(&self, key: &K) -> usize {
        let state = self.inner.lock("KeyedResourcePool::num_idle_for()");
        state.entries.get(key).map_or(0, |e| e.idle.len())
    }
}

impl<K: PoolKey, T: Send + 'static> PoolInner<K, T> {
    fn lock(&self, context: &str) -> std::sync::MutexGuard<'_, PoolState<K, T>> {
        self.state.lock().recover_poison(context)
    }

    /// Claim an idle object or a slot for a new one.
    fn reserve(&self, key: &K) -> ConnectorResult<Slot<K, T>> {
        let mut guard = self.lock("KeyedResourcePool::reserve()");
        let state = &mut *guard;
        if state.closed {
            return Err(ConnectorError::resource_unavailable(format!(
                "pool {} is closed",
                self.name
            )));
        }
        let limits = state.limits;
        let total = state.total;

        let entry = state.entries.entry(key.clone()).or_default();
        if let Some(object) = entry.idle.pop_front() {
            entry.active += 1;
            return Ok(Slot::Idle(object));
        }

        let key_has_room = limits.max_active == 0 || entry.active < limits.max_active;
        let pool_has_room = limits.max_total == 0 || total < limits.max_total;

        if key_has_room && pool_has_room {
            entry.active += 1;
            state.total += 1;
            return Ok(Slot::Create { evicted: None });
        }

        if key_has_room {
            let victim = state
                .entries
                .iter_mut()
                .find(|(k, e)| *k != key && !e.idle.is_empty())
                .and_then(|(k, e)| e.idle.pop_front().map(|object| (k.clone(), object)));
            if let Some(evicted) = victim {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.active += 1;
                }
                state.entries.retain(|_, e| !e.is_empty());
                return Ok(Slot::Create {
                    evicted: Some(evicted),
                });
            }
        }

        if state.entries.get(key).is_some_and(KeyEntry::is_empty) {
            state.entries.remove(key);
        }
        match limits.exhausted_action {
            ExhaustedAction::Grow => {
                let entry = state.entries.entry(key.clone()).or_default();
                entry.active += 1;
                state.total += 1;
                Ok(Slot::Create { evicted: None })
            }
            ExhaustedAction::Block => Ok(Slot::Wait),
            ExhaustedAction::Fail => Err(ConnectorError::resource_unavailable(format!(
                "pool {} exhausted for {} (max_active {}, max_total {})",
                self.name, key, limits.max_active, limits.max_total
            ))),
        }
    }

    fn prepare(&self, key: &K, object: &mut T) -> Result<(), BoxError> {
        self.factory.activate(key, object)?;
        if !self.factory.validate(key, object) {
            return Err("validation failed".into());
        }
        Ok(())
    }

    /// Give back a slot whose object was never created.
    fn release_slot(&self, key: &K) {
        {
            let mut state = self.lock("KeyedResourcePool::release_slot()");
            Self::forget_active(&mut state, key);
        }
        self.released.notify_waiters();
    }

    fn forget_active(state: &mut PoolState<K, T>, key: &K) {
        state.total = state.total.saturating_sub(1);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.active = entry.active.saturating_sub(1);
            if entry.is_empty() {
                state.entries.remove(key);
            }
        }
    }

    pub(crate) fn invalidate_object(&self, key: &K, object: T) {
        self.release_slot(key);
        self.factory.destroy(key, object);
    }

    pub(crate) fn return_object(&self, key: &K, mut object: T) {
        if let Err(e) = self.factory.passivate(key, &mut object) {
            warn!(
                target: LOG_TARGET,
                "Failed to return object for {} to pool {}, destroying it (possible resource leak): {}",
                key,
                self.name,
                e
            );
            self.invalidate_object(key, object);
            return;
        }

        let surplus = {
            let mut state = self.lock("KeyedResourcePool::return_object()");
            let max_idle = state.limits.max_idle;
            let closed = state.closed;
            let keep = state
                .entries
                .get(key)
                .map(|entry| !closed && entry.idle.len() < max_idle);
            match keep {
                Some(true) => match state.entries.get_mut(key) {
                    Some(entry) => {
                        entry.active = entry.active.saturating_sub(1);
                        entry.idle.push_back(object);
                        None
                    }
                    None => Some(object),
                },
                Some(false) => {
                    Self::forget_active(&mut state, key);
                    Some(object)
                }
                None => {
                    warn!(
                        target: LOG_TARGET,
                        "Returned object for {} is unknown to pool {}; destroying it (possible resource leak)",
                        key,
                        self.name
                    );
                    Some(object)
                }
            }
        };

        if let Some(object) = surplus {
            self.factory.destroy(key, object);
        }
        self.released.notify_waiters();
    }

    fn destroy_all(&self, objects: Vec<(K, T)>) {
        for (key, object) in objects {
            self.factory.destroy(&key, object);
        }
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        reject_idle: AtomicBool,
    }

    #[async_trait]
    impl PooledObjectFactory<String, usize> for CountingFactory {
        async fn create(&self, _key: &String) -> Result<usize, BoxError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn validate(&self, _key: &String, _object: &usize) -> bool {
            !self.reject_idle.load(Ordering::SeqCst)
        }

        fn destroy(&self, _key: &String, _object: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(
        factory: &Arc<CountingFactory>,
        max_active: usize,
        action: ExhaustedAction,
        max_wait: Option<Duration>,
    ) -> KeyedResourcePool<String, usize> {
        KeyedResourcePool::new(
            "test.dispatchers",
            Arc::clone(factory) as Arc<dyn PooledObjectFactory<String, usize>>,
            max_active,
            action,
            max_wait,
            CancellationToken::new(),
        )
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn set_max_active_derives_idle_and_total() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Grow, None);

        pool.set_max_active(5);

        assert_eq!(pool.max_active(), 5);
        assert_eq!(pool.max_idle(), 5);
        assert_eq!(pool.max_total(), 100);
    }

    #[tokio::test]
    async fn returned_objects_are_reused() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 2, ExhaustedAction::Grow, None);

        let first = pool.borrow(&key("a")).await.unwrap();
        let value = *first;
        drop(first);
        assert_eq!(pool.num_idle_for(&key("a")), 1);

        let second = pool.borrow(&key("a")).await.unwrap();
        assert_eq!(*second, value);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_active(), 1);
    }

    #[tokio::test]
    async fn fail_policy_rejects_at_capacity() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Fail, None);

        let _held = pool.borrow(&key("a")).await.unwrap();
        let err = pool.borrow(&key("a")).await.unwrap_err();

        assert!(matches!(err, ConnectorError::ResourceUnavailable { .. }));
        // Other keys are unaffected
        assert!(pool.borrow(&key("b")).await.is_ok());
    }

    #[tokio::test]
    async fn grow_policy_exceeds_per_key_cap() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Grow, None);

        let _a = pool.borrow(&key("a")).await.unwrap();
        let _b = pool.borrow(&key("a")).await.unwrap();

        assert_eq!(pool.num_active_for(&key("a")), 2);
    }

    #[tokio::test]
    async fn block_policy_times_out() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Block, Some(Duration::from_millis(50)));

        let _held = pool.borrow(&key("a")).await.unwrap();
        let err = pool.borrow(&key("a")).await.unwrap_err();

        assert!(matches!(err, ConnectorError::ResourceUnavailable { .. }));
    }

    /// A borrow that blocks on a key it holds nothing for leaves no entry
    /// behind once it gives up.
    #[tokio::test]
    async fn timed_out_block_leaves_no_empty_key() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Block, Some(Duration::from_millis(50)));

        let mut held = Vec::new();
        for i in 0..TOTAL_PER_ACTIVE {
            held.push(pool.borrow(&format!("k{i}")).await.unwrap());
        }
        let err = pool.borrow(&key("late")).await.unwrap_err();

        assert!(matches!(err, ConnectorError::ResourceUnavailable { .. }));
        let state = pool.inner.lock("timed_out_block_leaves_no_empty_key");
        assert!(!state.entries.contains_key(&key("late")));
        assert_eq!(state.entries.len(), TOTAL_PER_ACTIVE);
    }

    /// A blocked borrower proceeds as soon as the holder returns its object.
    #[tokio::test]
    async fn block_policy_wakes_on_return() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Block, Some(Duration::from_secs(5)));

        let held = pool.borrow(&key("a")).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(&key("a")).await.map(|o| *o) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let value = *held;
        drop(held);

        let borrowed = waiter.await.unwrap().unwrap();
        assert_eq!(borrowed, value);
    }

    #[tokio::test]
    async fn block_policy_is_interruptible() {
        let factory = Arc::new(CountingFactory::default());
        let interrupt = CancellationToken::new();
        let pool = KeyedResourcePool::new(
            "test.requesters",
            Arc::clone(&factory) as Arc<dyn PooledObjectFactory<String, usize>>,
            1,
            ExhaustedAction::Block,
            None,
            interrupt.clone(),
        );

        let _held = pool.borrow(&key("a")).await.unwrap();
        interrupt.cancel();
        let err = pool.borrow(&key("a")).await.unwrap_err();

        assert!(matches!(err, ConnectorError::Interrupted { .. }));
    }

    #[tokio::test]
    async fn invalid_idle_object_is_replaced() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Fail, None);

        drop(pool.borrow(&key("a")).await.unwrap());
        factory.reject_idle.store(true, Ordering::SeqCst);

        // The fresh object fails validation too, so the borrow reports it
        assert!(pool.borrow(&key("a")).await.is_err());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 0);
    }

    /// At the global cap an idle object of another key is evicted.
    #[tokio::test]
    async fn global_cap_evicts_idle_object_of_other_key() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 1, ExhaustedAction::Fail, None);

        for i in 0..TOTAL_PER_ACTIVE {
            drop(pool.borrow(&format!("k{i}")).await.unwrap());
        }
        assert_eq!(pool.num_idle(), TOTAL_PER_ACTIVE);

        let fresh = pool.borrow(&key("new")).await.unwrap();
        assert_eq!(*fresh, TOTAL_PER_ACTIVE);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_idle(), TOTAL_PER_ACTIVE - 1);
    }

    #[tokio::test]
    async fn close_destroys_idle_and_returning_objects() {
        let factory = Arc::new(CountingFactory::default());
        let pool = pool(&factory, 2, ExhaustedAction::Grow, None);

        let held = pool.borrow(&key("a")).await.unwrap();
        drop(pool.borrow(&key("b")).await.unwrap());

        pool.close();
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        drop(held);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.num_idle(), 0);
        assert!(pool.borrow(&key("a")).await.is_err());
    }
}

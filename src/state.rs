//! Shared flags with change notification.
//!
//! Modules get an `Arc<ObservableState>` and use it instead of globals.
//! Subscribing to a key is the only extension point: a write that actually
//! changes the value calls that key's subscribers synchronously, in
//! subscription order, with `(key, old, new)`. Writing an equal value is
//! silent.
//!
//! Callbacks run after the lock is released, on a snapshot of the
//! subscriber list, so a callback may write to the state (or subscribe)
//! without deadlocking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::signal::{IdGen, SubscriptionId};

type Callback<V> = Arc<dyn Fn(&str, Option<&V>, &V) + Send + Sync>;

struct Inner<V> {
    values: HashMap<String, V>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback<V>)>>,
}

/// Key/value map whose writes notify subscribers.
pub struct ObservableState<V = serde_json::Value> {
    ids: IdGen,
    inner: Mutex<Inner<V>>,
}

impl<V> Default for ObservableState<V> {
    fn default() -> Self {
        Self {
            ids: IdGen::default(),
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }
}

impl<V> ObservableState<V>
where
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded with `initial`, without notifications.
    pub fn with_initial<K, I>(initial: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let state = Self::default();
        {
            let mut inner = state.inner.lock();
            inner
                .values
                .extend(initial.into_iter().map(|(k, v)| (k.into(), v)));
        }
        state
    }

    /// Seed `key` unless it already has a value. Never notifies.
    /// Returns whether the default was applied.
    pub fn insert_default(&self, key: impl Into<String>, value: V) -> bool {
        let mut inner = self.inner.lock();
        let key = key.into();
        if inner.values.contains_key(&key) {
            return false;
        }
        inner.values.insert(key, value);
        true
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().values.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().values.contains_key(key)
    }

    /// Write `value` under `key`. Returns whether the value changed; only
    /// then are subscribers called.
    pub fn set(&self, key: &str, value: V) -> bool {
        let (old, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.values.get(key) == Some(&value) {
                trace!(key, "state unchanged");
                return false;
            }
            let old = inner.values.insert(key.to_string(), value.clone());
            let callbacks = inner.subscribers.get(key).cloned().unwrap_or_default();
            (old, callbacks)
        };

        debug!(key, subscribers = callbacks.len(), "state changed");
        for (_, callback) in callbacks {
            callback(key, old.as_ref(), &value);
        }
        true
    }

    /// Call `callback` on every future change of `key`. Not called for the
    /// current value.
    pub fn subscribe<F>(&self, key: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&str, Option<&V>, &V) + Send + Sync + 'static,
    {
        let id = self.ids.next();
        self.inner
            .lock()
            .subscribers
            .entry(key.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if `id` was not subscribed to `key`.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(list) = inner.subscribers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.subscribers.remove(key);
        }
        removed
    }

    /// Copy of every key and value.
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.inner.lock().values.clone()
    }
}

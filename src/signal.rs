//! Named broadcast channels.
//!
//! A [`Signal`] keeps an ordered list of subscribers. [`Signal::send`] is
//! fire-and-forget fan-out; [`Signal::process`] is fan-in and hands back one
//! [`Delivery`] per subscriber, in subscription order, carrying either the
//! subscriber's return value or its error. A failing (or panicking)
//! subscriber never stops delivery to the ones after it.
//!
//! Delivery always runs on a snapshot of the subscriber list taken under the
//! lock, with the lock released, so subscribers may connect or disconnect
//! from inside a callback.
//!
//! [`EventBus`] is the registry of named channels modules share.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::panic_message;
use crate::telemetry::metrics;

/// Identifies one connection to a signal or a state key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out increasing subscription ids.
#[derive(Debug, Default)]
pub(crate) struct IdGen(AtomicU64);

impl IdGen {
    pub(crate) fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a subscriber did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("subscriber failed: {0}")]
    Failed(String),

    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

impl SignalError {
    pub fn failed(message: impl Into<String>) -> Self {
        SignalError::Failed(message.into())
    }
}

/// Outcome of one subscriber during [`Signal::process`].
#[derive(Debug, Clone)]
pub struct Delivery<R> {
    pub subscription: SubscriptionId,
    pub result: Result<R, SignalError>,
}

/// All deliveries of one [`Signal::process`] call, in subscription order.
#[derive(Debug, Clone)]
pub struct Processed<R> {
    deliveries: Vec<Delivery<R>>,
}

impl<R> Processed<R> {
    pub fn deliveries(&self) -> &[Delivery<R>] {
        &self.deliveries
    }

    /// Values from subscribers that returned normally, in order.
    pub fn results(&self) -> Vec<&R> {
        self.deliveries
            .iter()
            .filter_map(|d| d.result.as_ref().ok())
            .collect()
    }

    /// Errors from subscribers that failed, in order.
    pub fn errors(&self) -> Vec<&SignalError> {
        self.deliveries
            .iter()
            .filter_map(|d| d.result.as_ref().err())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn into_vec(self) -> Vec<Delivery<R>> {
        self.deliveries
    }
}

type Subscriber<A, R> = Arc<dyn Fn(&A) -> Result<R, SignalError> + Send + Sync>;

/// A named broadcast point.
pub struct Signal<A, R = ()> {
    name: String,
    ids: IdGen,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<A, R>)>>,
}

impl<A, R> Signal<A, R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: IdGen::default(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a subscriber at the end of the delivery order.
    pub fn connect<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&A) -> Result<R, SignalError> + Send + Sync + 'static,
    {
        let id = self.ids.next();
        self.subscribers.lock().push((id, Arc::new(subscriber)));
        debug!(signal = %self.name, subscription = %id, "subscriber connected");
        id
    }

    /// Remove a subscriber. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(signal = %self.name, subscription = %id, "subscriber disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<(SubscriptionId, Subscriber<A, R>)> {
        self.subscribers.lock().clone()
    }

    fn call(&self, id: SubscriptionId, subscriber: &Subscriber<A, R>, args: &A) -> Result<R, SignalError> {
        let result = catch_unwind(AssertUnwindSafe(|| subscriber(args)))
            .unwrap_or_else(|payload| Err(SignalError::Panicked(panic_message(payload.as_ref()))));

        if let Err(ref e) = result {
            warn!(signal = %self.name, subscription = %id, error = %e, "subscriber failed");
            metrics::subscriber_failures().add(1, &[KeyValue::new("signal", self.name.clone())]);
        }
        result
    }

    /// Deliver to every subscriber, ignoring results. Failures are logged.
    pub fn send(&self, args: &A) {
        for (id, subscriber) in self.snapshot() {
            let _ = self.call(id, &subscriber, args);
        }
    }

    /// Deliver to every subscriber and collect what each one returned.
    pub fn process(&self, args: &A) -> Processed<R> {
        let deliveries = self
            .snapshot()
            .into_iter()
            .map(|(id, subscriber)| Delivery {
                subscription: id,
                result: self.call(id, &subscriber, args),
            })
            .collect();
        Processed { deliveries }
    }
}

impl<A, R> std::fmt::Debug for Signal<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

/// The kind of channel modules exchange through the [`EventBus`].
pub type Channel = Signal<Value, Value>;

/// Registry of named channels, created on first use.
#[derive(Debug, Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel called `name`, creating it if needed.
    pub fn channel(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        Arc::clone(
            channels
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Signal::new(name))),
        )
    }

    /// The channel called `name`, if it exists.
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(name).cloned()
    }

    /// Drop a channel from the registry. Holders of the `Arc` keep theirs.
    pub fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().remove(name)
    }

    /// Names of all channels, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Send on the channel called `name`. Nothing happens, and no channel is
    /// created, if it does not exist.
    pub fn send(&self, name: &str, args: &Value) {
        if let Some(channel) = self.get(name) {
            channel.send(args);
        }
    }

    /// Process on the channel called `name`. Empty if it does not exist.
    pub fn process(&self, name: &str, args: &Value) -> Processed<Value> {
        match self.get(name) {
            Some(channel) => channel.process(args),
            None => Processed {
                deliveries: Vec::new(),
            },
        }
    }
}

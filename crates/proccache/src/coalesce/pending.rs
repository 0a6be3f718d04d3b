//! In-flight call registry
//!
//! Each key being computed maps to one [`PendingCall`], created fresh for
//! every round. The leader holds a [`LeaderGuard`]; followers hold a
//! [`Waiter`] subscribed to the call's watch cell. The guard publishes the
//! round's result and then unregisters the call. If the leader is dropped
//! first, the guard still unregisters it and the closed cell tells every
//! waiter the round was abandoned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{CacheError, CacheResult};

/// Result shared by every caller of one round
pub(crate) type CallResult<V> = CacheResult<Option<V>>;

/// One round of computation for a key
pub(crate) struct PendingCall<V> {
    round: u64,
    result: watch::Sender<Option<CallResult<V>>>,
}

impl<V> PendingCall<V> {
    fn new(round: u64) -> Self {
        let (result, _) = watch::channel(None);
        Self { round, result }
    }
}

/// Registry of keys currently being computed
pub(crate) struct InFlight<V> {
    calls: Mutex<HashMap<String, Arc<PendingCall<V>>>>,
    next_round: AtomicU64,
}

impl<V> InFlight<V> {
    pub(crate) fn new() -> Self {
        Self { calls: Mutex::new(HashMap::new()), next_round: AtomicU64::new(1) }
    }

    /// Join the round in flight for `key`, or start a new one
    pub(crate) fn claim(&self, key: &str) -> Claim<'_, V> {
        let mut calls = self.calls.lock();

        if let Some(call) = calls.get(key) {
            return Claim::Follower(Waiter {
                key: key.to_string(),
                round: call.round,
                rx: call.result.subscribe(),
            });
        }

        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        let call = Arc::new(PendingCall::new(round));
        calls.insert(key.to_string(), Arc::clone(&call));

        Claim::Leader(LeaderGuard { registry: self, key: key.to_string(), call })
    }

    /// Number of keys in flight
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }

    fn release(&self, key: &str, call: &Arc<PendingCall<V>>) {
        let mut calls = self.calls.lock();
        if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, call)) {
            calls.remove(key);
        }
    }
}

/// Outcome of [`InFlight::claim`]
pub(crate) enum Claim<'a, V> {
    /// The caller runs this round
    Leader(LeaderGuard<'a, V>),
    /// Another caller is already running the round
    Follower(Waiter<V>),
}

/// Held by the leader for the duration of its round
pub(crate) struct LeaderGuard<'a, V> {
    registry: &'a InFlight<V>,
    key: String,
    call: Arc<PendingCall<V>>,
}

impl<V> LeaderGuard<'_, V> {
    pub(crate) fn round(&self) -> u64 {
        self.call.round
    }

    /// Publish the round's result, then unregister the call
    pub(crate) fn publish(self, result: CallResult<V>) {
        self.call.result.send_replace(Some(result));
        // Drop unregisters the call after the value is visible
    }
}

impl<V> Drop for LeaderGuard<'_, V> {
    fn drop(&mut self) {
        self.registry.release(&self.key, &self.call);
    }
}

/// Follower handle for a round in flight
pub(crate) struct Waiter<V> {
    key: String,
    round: u64,
    rx: watch::Receiver<Option<CallResult<V>>>,
}

impl<V: Clone> Waiter<V> {
    pub(crate) fn round(&self) -> u64 {
        self.round
    }

    /// Wait for the leader's result
    pub(crate) async fn wait(mut self) -> CallResult<V> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(published) => match &*published {
                Some(result) => result.clone(),
                None => Err(CacheError::Abandoned { key: self.key.clone() }),
            },
            Err(_) => Err(CacheError::Abandoned { key: self.key }),
        }
    }
}

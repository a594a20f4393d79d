//! Multi-topic change notification (spec.md §4.1).
//!
//! Waiters register for `(topic, id)` pairs; a notifier wakes all waiters
//! registered for an id, recording the id into each waiter's changed set.
//! Registration happens before the caller parks and notify-then-deliver is
//! race-free: a notification that races with registration is never lost, and
//! a waiter whose changed set is already non-empty at registration time
//! returns immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// The three topics waiters can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Job,
    Machine,
    Blacklist,
}

struct WaiterState {
    changed: Mutex<HashSet<i64>>,
    notify: Notify,
}

impl WaiterState {
    fn new() -> Self {
        Self {
            changed: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }
}

struct Inner {
    waiters: HashMap<(Topic, i64), Vec<Arc<WaiterState>>>,
}

/// The registry. Cheap to clone (wraps an `Arc`); share one instance across
/// the Allocator, Lifecycle Controller, and whatever long-polls on top of
/// them.
#[derive(Clone)]
pub struct EpochRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl Default for EpochRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                waiters: HashMap::new(),
            })),
        }
    }

    /// Register a waiter for a set of ids under one topic. The returned
    /// handle is registered immediately (before any `await`), so a
    /// notification delivered between this call and `wait_for_change` is
    /// never lost.
    pub fn get_epoch(&self, topic: Topic, ids: &[i64]) -> EpochHandle {
        let state = Arc::new(WaiterState::new());
        let mut inner = self.inner.lock().unwrap();
        for &id in ids {
            inner
                .waiters
                .entry((topic, id))
                .or_default()
                .push(state.clone());
        }
        EpochHandle {
            registry: self.clone(),
            topic,
            ids: ids.to_vec(),
            state,
        }
    }

    fn notify(&self, topic: Topic, id: i64) {
        let inner = self.inner.lock().unwrap();
        if let Some(waiters) = inner.waiters.get(&(topic, id)) {
            for w in waiters {
                w.changed.lock().unwrap().insert(id);
                w.notify.notify_one();
            }
        }
    }

    fn unregister(&self, topic: Topic, ids: &[i64], state: &Arc<WaiterState>) {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            if let Some(v) = inner.waiters.get_mut(&(topic, *id)) {
                v.retain(|w| !Arc::ptr_eq(w, state));
                if v.is_empty() {
                    inner.waiters.remove(&(topic, *id));
                }
            }
        }
    }

    pub fn job_changed(&self, job_id: i64) {
        self.notify(Topic::Job, job_id);
    }

    pub fn machine_changed(&self, machine_id: i64) {
        self.notify(Topic::Machine, machine_id);
    }

    pub fn blacklist_changed(&self, board_id: i64) {
        self.notify(Topic::Blacklist, board_id);
    }
}

/// A subscription handle returned by `EpochRegistry::get_epoch`.
pub struct EpochHandle {
    registry: EpochRegistry,
    topic: Topic,
    ids: Vec<i64>,
    state: Arc<WaiterState>,
}

impl EpochHandle {
    /// Suspend until any registered id is notified or `timeout` elapses.
    /// Returns the set of ids that changed (empty on timeout). Always
    /// unregisters before returning.
    pub async fn wait_for_change(self, timeout: Duration) -> HashSet<i64> {
        // Fast path: a notification already landed before we got here.
        {
            let mut changed = self.state.changed.lock().unwrap();
            if !changed.is_empty() {
                let result = std::mem::take(&mut *changed);
                drop(changed);
                self.registry.unregister(self.topic, &self.ids, &self.state);
                return result;
            }
        }

        let notified = self.state.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }

        let result = std::mem::take(&mut *self.state.changed.lock().unwrap());
        self.registry.unregister(self.topic, &self.ids, &self.state);
        result
    }
}

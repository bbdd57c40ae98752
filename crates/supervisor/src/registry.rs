//! Keyed task registry: at most one live task per key, with the key released
//! however the task ends.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::OwnedMutexGuard;
use tokio_util::task::TaskTracker;
use tracing::{error, Instrument, Span};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set of keys with a live task behind them.
pub struct TaskRegistry<K> {
    active: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for TaskRegistry<K> {
    fn clone(&self) -> Self {
        Self { active: self.active.clone() }
    }
}

impl<K> Default for TaskRegistry<K> {
    fn default() -> Self {
        Self { active: Arc::new(Mutex::new(HashSet::new())) }
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Claim `key`, or `None` when a task already holds it.
    pub fn try_claim(&self, key: K) -> Option<TaskSlot<K>> {
        if !locked(&self.active).insert(key.clone()) {
            return None;
        }
        Some(TaskSlot { key, active: self.active.clone() })
    }

    pub fn contains(&self, key: &K) -> bool {
        locked(&self.active).contains(key)
    }

    pub fn len(&self) -> usize {
        locked(&self.active).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the task built by `make` on `tracker` unless one already runs for `key`.
    /// The slot is held for the task's whole life and released when it returns or panics;
    /// a panic is logged inside `span` and does not reach the caller.
    pub fn spawn_if_absent<F, Fut>(&self, key: K, tracker: &TaskTracker, class: &'static str, span: Span, make: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(slot) = self.try_claim(key) else {
            return false;
        };
        let task = make();
        metrics::counter!("kubeauto_tasks_started_total", 1u64, "class" => class);
        tracker.spawn(
            async move {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    metrics::counter!("kubeauto_task_panics_total", 1u64, "class" => class);
                    error!(class, task = %slot.key(), panic = %panic_message(panic.as_ref()), "task panicked");
                }
                drop(slot);
            }
            .instrument(span),
        );
        true
    }
}

/// A claimed registry key; dropping it (also during unwinding) frees the key.
pub struct TaskSlot<K: Eq + Hash> {
    key: K,
    active: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> TaskSlot<K> {
    pub fn key(&self) -> &K { &self.key }
}

impl<K: Eq + Hash> Drop for TaskSlot<K> {
    fn drop(&mut self) {
        locked(&self.active).remove(&self.key);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One async mutex per local port so a restarted forward never binds while the
/// previous listener is still tearing down.
#[derive(Clone, Default)]
pub struct PortLocks {
    locks: Arc<Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PortLocks {
    pub fn new() -> Self { Self::default() }

    pub async fn lock(&self, port: u16) -> OwnedMutexGuard<()> {
        let m = locked(&self.locks).entry(port).or_default().clone();
        m.lock_owned().await
    }
}

//! Named, cancellable background tasks.
//!
//! [`TimerSet`] owns the join handles of recurring tasks keyed by name. The
//! session runtime uses [`TimerSet::switch_to`] so that a phase change always
//! cancels every outstanding timer before starting exactly one new one; the
//! proxy uses the same type to own its discovery and health loops.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use tokio::task::JoinHandle;
use tracing::trace;

/// A set of running tasks keyed by name.
#[derive(Debug)]
pub struct TimerSet<K: Eq + Hash> {
    handles: HashMap<K, JoinHandle<()>>,
}

impl<K: Eq + Hash> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }
}

impl<K> TimerSet<K>
where
    K: Eq + Hash + Copy + Debug,
{
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name`, aborting any task already registered there.
    pub fn arm<F>(&mut self, name: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(previous) = self.handles.insert(name, tokio::spawn(task)) {
            previous.abort();
        }
        trace!(timer = ?name, "timer armed");
    }

    /// Abort the task registered under `name`. Returns whether one existed.
    pub fn cancel(&mut self, name: K) -> bool {
        self.handles.remove(&name).map_or(false, |handle| {
            handle.abort();
            trace!(timer = ?name, "timer cancelled");
            true
        })
    }

    /// Abort every task.
    pub fn cancel_all(&mut self) {
        for (name, handle) in self.handles.drain() {
            handle.abort();
            trace!(timer = ?name, "timer cancelled");
        }
    }

    /// Cancel everything, then arm exactly one task (or none).
    pub fn switch_to<F>(&mut self, next: Option<(K, F)>)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel_all();
        if let Some((name, task)) = next {
            self.arm(name, task);
        }
    }

    /// Whether a live task is registered under `name`.
    #[must_use]
    pub fn is_active(&self, name: K) -> bool {
        self.handles
            .get(&name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Names of registered tasks that have not finished.
    #[must_use]
    pub fn active(&self) -> Vec<K> {
        self.handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Number of registered tasks, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<K: Eq + Hash> Drop for TimerSet<K> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

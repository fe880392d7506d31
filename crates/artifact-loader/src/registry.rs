use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::listener::Listener;

/// A shared, type-erased [`Listener`].
pub type SharedListener<K, V> = Arc<dyn Listener<K, V>>;

/// A computation that was submitted to the worker pool and did not finish yet.
pub struct InFlightTask<K, V> {
    /// A later task for the same key gets a different id.
    id: u64,
    listeners: Vec<SharedListener<K, V>>,
    cancel: CancellationToken,
}

impl<K, V> InFlightTask<K, V> {
    /// Consumes the task, yielding the listeners waiting for its result.
    pub fn into_listeners(self) -> Vec<SharedListener<K, V>> {
        self.listeners
    }
}

impl<K, V> fmt::Debug for InFlightTask<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightTask")
            .field("id", &self.id)
            .field("listeners", &self.listeners.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Keeps track of the computations currently in flight, by key.
///
/// There is at most one task per key. Like the [`SizedCache`](crate::SizedCache), the registry
/// is not synchronized by itself.
pub struct TaskRegistry<K, V> {
    tasks: HashMap<K, InFlightTask<K, V>>,
    next_id: u64,
}

impl<K: Hash + Eq, V> TaskRegistry<K, V> {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            next_id: 0,
        }
    }

    /// Whether a computation for `key` is in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    /// Registers a new task for `key`, returning its id and cancellation token.
    ///
    /// Returns `None` if a task for `key` is already in flight.
    pub fn register(
        &mut self,
        key: K,
        listener: SharedListener<K, V>,
    ) -> Option<(u64, CancellationToken)> {
        if self.tasks.contains_key(&key) {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();
        let task = InFlightTask {
            id,
            listeners: vec![listener],
            cancel: cancel.clone(),
        };
        self.tasks.insert(key, task);

        Some((id, cancel))
    }

    /// Adds another listener to the task in flight for `key`.
    ///
    /// Hands the listener back if there is no such task.
    pub fn attach(
        &mut self,
        key: &K,
        listener: SharedListener<K, V>,
    ) -> Result<(), SharedListener<K, V>> {
        match self.tasks.get_mut(key) {
            Some(task) => {
                task.listeners.push(listener);
                Ok(())
            }
            None => Err(listener),
        }
    }

    /// Removes the task `id` for `key` once it finished.
    ///
    /// Returns `None` if the task is not registered (anymore), which happens when it was
    /// cancelled in the meantime.
    pub fn complete(&mut self, key: &K, id: u64) -> Option<InFlightTask<K, V>> {
        if self.tasks.get(key)?.id != id {
            return None;
        }
        self.tasks.remove(key)
    }

    /// Cancels and removes all tasks.
    ///
    /// The removed tasks are returned so that their listeners can be dropped outside of any lock.
    pub fn cancel_all(&mut self) -> Vec<InFlightTask<K, V>> {
        self.tasks
            .drain()
            .map(|(_, task)| {
                task.cancel.cancel();
                task
            })
            .collect()
    }

    /// The number of computations in flight.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<K: Hash + Eq, V> Default for TaskRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for TaskRegistry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test::RecordingListener;

    type Registry = TaskRegistry<&'static str, Vec<u8>>;

    fn listener() -> SharedListener<&'static str, Vec<u8>> {
        Arc::new(RecordingListener::<&'static str>::new())
    }

    #[test]
    fn test_register_once_per_key() {
        let mut registry = Registry::new();

        let (first, _) = registry.register("a", listener()).unwrap();
        assert!(registry.register("a", listener()).is_none());
        let (second, _) = registry.register("b", listener()).unwrap();

        assert_ne!(first, second);
        assert!(registry.contains(&"a"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_complete_removes_task() {
        let mut registry = Registry::new();
        let (id, _) = registry.register("a", listener()).unwrap();

        let task = registry.complete(&"a", id).unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.into_listeners().len(), 1);
        assert!(registry.is_empty());
        assert!(registry.complete(&"a", id).is_none());
    }

    #[test]
    fn test_complete_ignores_stale_id() {
        let mut registry = Registry::new();
        let (stale, _) = registry.register("a", listener()).unwrap();
        registry.cancel_all();
        let (current, _) = registry.register("a", listener()).unwrap();

        assert!(registry.complete(&"a", stale).is_none());
        assert!(registry.contains(&"a"));
        assert!(registry.complete(&"a", current).is_some());
    }

    #[test]
    fn test_attach_listeners() {
        let mut registry = Registry::new();
        assert!(registry.attach(&"a", listener()).is_err());

        let (id, _) = registry.register("a", listener()).unwrap();
        assert!(registry.attach(&"a", listener()).is_ok());

        let task = registry.complete(&"a", id).unwrap();
        assert_eq!(task.into_listeners().len(), 2);
    }

    #[test]
    fn test_cancel_all() {
        let mut registry = Registry::new();
        let (_, a) = registry.register("a", listener()).unwrap();
        let (_, b) = registry.register("b", listener()).unwrap();

        let cancelled = registry.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|task| task.cancel.is_cancelled()));
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.is_empty());
    }
}

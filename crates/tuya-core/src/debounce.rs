//! Debounce gate for rapid local commands

use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Coalesces repeated schedules for the same key into one deferred fire
///
/// Delay classification (cold start vs steady state) is up to the caller.
pub struct DebounceGate<K: Eq + Hash> {
    /// Pending timers (keyed by control)
    pending: Arc<DashMap<K, Pending>>,
    next_generation: AtomicU64,
}

impl<K: Eq + Hash> Default for DebounceGate<K> {
    fn default() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<K> DebounceGate<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_fire(target)` after `delay`, replacing any pending
    /// schedule for `key`
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<V, F>(&self, key: K, target: V, delay: Duration, on_fire: F)
    where
        V: Send + 'static,
        F: FnOnce(V) + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            // Entry must be in the map before the generation check can match
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            if pending
                .remove_if(&task_key, |_, p| p.generation == generation)
                .is_some()
            {
                tracing::debug!("Debounce fired for {:?}", task_key);
                on_fire(target);
            }
        });

        if let Some(previous) = self.pending.insert(key.clone(), Pending { generation, handle }) {
            previous.handle.abort();
            tracing::debug!("Debounce for {:?} superseded", key);
        }
        let _ = armed_tx.send(());
    }

    /// Cancel the pending schedule for `key`; true if one was pending
    pub fn cancel(&self, key: &K) -> bool {
        if let Some((_, previous)) = self.pending.remove(key) {
            previous.handle.abort();
            tracing::debug!("Debounce for {:?} cancelled", key);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn cancel_all(&self) {
        self.pending.retain(|_, p| {
            p.handle.abort();
            false
        });
    }
}

impl<K: Eq + Hash> Drop for DebounceGate<K> {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_to_last_value() {
        let gate = DebounceGate::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for target in [0.2, 0.5, 0.8] {
            let fired = Arc::clone(&fired);
            gate.schedule("gang1", target, Duration::from_millis(800), move |v| {
                fired.lock().unwrap().push(v);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gate.is_pending(&"gang1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec![0.8]);
        assert!(!gate.is_pending(&"gang1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let gate = DebounceGate::new();
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        gate.schedule(1usize, (), Duration::from_millis(800), move |()| {
            *counter.lock().unwrap() += 1;
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(gate.cancel(&1));
        assert!(!gate.cancel(&1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let gate = DebounceGate::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (key, delay) in [(1usize, 800), (2usize, 1500)] {
            let fired = Arc::clone(&fired);
            gate.schedule(key, key, Duration::from_millis(delay), move |v| {
                fired.lock().unwrap().push(v);
            });
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1]);
        assert!(gate.is_pending(&2));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1, 2]);
    }
}

// Per-key serialized access
//
// At most one handler runs per key; callers for the same key are admitted in
// FIFO order (tokio's Mutex queues waiters fairly). Different keys never
// contend beyond the short registry lookup. Entries are created on first
// invoke and removed when the last queued caller for a key leaves.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, Instrument};

/// Guarantees non-overlapping critical sections per key.
///
/// Cloning shares the same registry, so one instance created at process start
/// can be handed to every component that mutates keyed entities.
#[derive(Debug)]
pub struct KeyedSerializer<K = String>
where
    K: Eq + Hash,
{
    registry: Arc<Mutex<RegistryState<K>>>,
}

#[derive(Debug)]
struct RegistryState<K: Eq + Hash> {
    gates: HashMap<K, Arc<tokio::sync::Mutex<()>>>,
    /// Callers currently holding or waiting for each gate
    occupants: HashMap<K, usize>,
}

impl<K: Eq + Hash> Default for RegistryState<K> {
    fn default() -> Self {
        Self {
            gates: HashMap::new(),
            occupants: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> Clone for KeyedSerializer<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K: Eq + Hash> Default for KeyedSerializer<K> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(RegistryState::default())),
        }
    }
}

impl<K> KeyedSerializer<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, RegistryState<K>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `handler` once every earlier caller for `key` has finished.
    ///
    /// The handler's output is returned untouched; errors are the handler's
    /// business. A cancelled caller gives up its place without affecting others.
    pub async fn invoke<F, Fut, T>(&self, key: &K, handler: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let gate = self.admit(key);
        let _occupancy = Occupancy {
            serializer: self,
            key: key.clone(),
        };

        let span = tracing::debug_span!("keyed_serializer", key = ?key);
        async {
            let _permit = gate.lock().await;
            debug!("Acquired key");
            handler().await
        }
        .instrument(span)
        .await
    }

    /// Register a caller for `key`, creating the queue on first use.
    fn admit(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self.registry();
        let gate = registry
            .gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        *registry.occupants.entry(key.clone()).or_insert(0) += 1;
        gate
    }

    fn release(&self, key: &K) {
        let mut registry = self.registry();
        let remaining = match registry.occupants.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            registry.occupants.remove(key);
            registry.gates.remove(key);
            debug!(key = ?key, "Key queue drained");
        }
    }

    /// Callers currently running or waiting for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.registry().occupants.get(key).copied().unwrap_or(0)
    }

    /// Number of keys with live queues.
    pub fn active_keys(&self) -> usize {
        self.registry().gates.len()
    }
}

/// Decrements the key's occupancy when the caller finishes or is dropped.
struct Occupancy<'a, K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    serializer: &'a KeyedSerializer<K>,
    key: K,
}

impl<K> Drop for Occupancy<'_, K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.serializer.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_removed_after_drain() {
        let serializer: KeyedSerializer<String> = KeyedSerializer::new();
        let key = "trial-1".to_string();

        let value = serializer.invoke(&key, || async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(serializer.pending(&key), 0);
        assert_eq!(serializer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_same_key_never_overlaps() {
        let serializer: KeyedSerializer<String> = KeyedSerializer::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let serializer = serializer.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let key = "trial-1".to_string();
                serializer
                    .invoke(&key, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_its_slot() {
        let serializer: KeyedSerializer<String> = KeyedSerializer::new();
        let key = "trial-1".to_string();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let serializer = serializer.clone();
            let key = key.clone();
            tokio::spawn(async move {
                serializer
                    .invoke(&key, || async move {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        while serializer.pending(&key) < 1 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let serializer = serializer.clone();
            let key = key.clone();
            tokio::spawn(async move { serializer.invoke(&key, || async {}).await })
        };
        while serializer.pending(&key) < 2 {
            tokio::task::yield_now().await;
        }

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(serializer.pending(&key), 1);

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert_eq!(serializer.active_keys(), 0);
    }
}

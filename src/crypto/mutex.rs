//! Per-peer keyed mutex: the Double Ratchet is not commutative, so two
//! concurrent encrypt calls to the same wire JID must be serialized. Same
//! lazy-keyed-mutex shape as [`crate::store::TransactionManager`], scoped
//! by peer key instead of transaction id.

use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct KeyedMutex<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `body` under the exclusive lock for `key`.
    pub async fn with_lock<T, F, Fut>(&self, key: &K, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        body().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_key() {
        let mutex = Arc::new(KeyedMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                mutex
                    .with_lock(&"peer".to_string(), || async {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        assert_eq!(counter.load(Ordering::SeqCst), before + 1);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn independent_keys_do_not_block() {
        let mutex = KeyedMutex::new();
        let a = mutex.with_lock(&"a".to_string(), || async { 1 });
        let b = mutex.with_lock(&"b".to_string(), || async { 2 });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }
}

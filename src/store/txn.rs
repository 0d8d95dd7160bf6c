//! Keystore transaction scoping.
//!
//! A relay call opens a transaction scoped to the sender's id; all state
//! mutations for that call (mapping writes, session installs,
//! sender-key-memory updates) happen inside it, and `sendNode` is the
//! single point of no return — a transport failure aborts the
//! transaction. This is the same lazily-created keyed-mutex shape as
//! [`crate::crypto::KeyedMutex`], scoped by transaction id instead of peer
//! JID.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Serializes concurrent relay calls that share a transaction scope (the
/// sender's own id). Components run *inside* this transaction must not
/// open a nested one.
#[derive(Default)]
pub struct TransactionManager {
    scopes: DashMap<String, Arc<Mutex<()>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
        }
    }

    fn lock_for(&self, scope: &str) -> Arc<Mutex<()>> {
        self.scopes
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `body` under the exclusive lock for `scope`. The stanza is sent
    /// only if `body` returns `Ok` — a transport failure inside `body`
    /// aborts the transaction and its partial mutations are simply not
    /// retried (this in-memory reference keystore has no rollback log;
    /// a real keystore backing store would roll back writes made so far).
    pub async fn transaction<T, F, Fut>(&self, scope: impl Into<String>, body: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let scope = scope.into();
        let lock = self.lock_for(&scope);
        let _guard = lock.lock().await;
        body().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_scope() {
        let mgr = Arc::new(TransactionManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = Arc::clone(&mgr);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                mgr.transaction("same-scope", || async {
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    assert_eq!(counter.load(Ordering::SeqCst), before + 1);
                    Ok::<_, crate::Error>(())
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn independent_scopes_do_not_block() {
        let mgr = TransactionManager::new();
        let a = mgr.transaction("a", || async { Ok::<_, crate::Error>(1) });
        let b = mgr.transaction("b", || async { Ok::<_, crate::Error>(2) });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }
}

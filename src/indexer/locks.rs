use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-repository writer locks. Searches never take these.
#[derive(Clone, Default)]
pub struct RepoLocks {
    entries: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, repo: &str) -> Arc<AsyncMutex<()>> {
        self.entries()
            .entry(repo.to_string())
            .or_default()
            .clone()
    }

    pub async fn lock(&self, repo: &str) -> OwnedMutexGuard<()> {
        self.get(repo).lock_owned().await
    }

    /// Takes the lock only if no writer holds it.
    pub fn try_lock(&self, repo: &str) -> Option<OwnedMutexGuard<()>> {
        self.get(repo).try_lock_owned().ok()
    }

    /// Drops the entry for a repository that no longer exists. The entry
    /// stays while anyone holds or waits on it, so every writer keeps
    /// contending on the same mutex.
    pub fn forget(&self, repo: &str) {
        let mut entries = self.entries();
        if entries.get(repo).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            entries.remove(repo);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_lock_is_per_repo() {
        let locks = RepoLocks::new();
        let _a = locks.lock("a").await;
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());
    }

    #[tokio::test]
    async fn test_release_allows_relock() {
        let locks = RepoLocks::new();
        let guard = locks.lock("a").await;
        drop(guard);
        assert!(locks.try_lock("a").is_some());

        locks.forget("a");
        locks.forget("b");
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_forget_keeps_contended_lock() {
        let locks = RepoLocks::new();
        let guard = locks.lock("r").await;
        locks.forget("r");
        assert_eq!(locks.len(), 1);

        let (acquired_tx, acquired_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _held = locks.lock("r").await;
                acquired_tx.send(()).unwrap();
                let _ = release_rx.await;
            })
        };
        // Let the waiter queue up on the mutex.
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        locks.forget("r");
        acquired_rx.await.unwrap();
        assert!(locks.try_lock("r").is_none());

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        locks.forget("r");
        assert_eq!(locks.len(), 0);
    }
}

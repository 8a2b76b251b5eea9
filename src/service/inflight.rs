use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{RockskipError, SharedError};
use crate::indexer::IndexStats;

type Key = (String, String);

/// Final state of a run; `None` while it is still going.
type Outcome = Option<Result<IndexStats, SharedError>>;

/// Keeps a run alive. Every waiter holds one; the run's token is cancelled
/// when the last of them is dropped.
struct Interest {
    token: CancellationToken,
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Entry {
    rx: watch::Receiver<Outcome>,
    interest: Weak<Interest>,
}

impl Entry {
    /// Still running and somebody still wants the result.
    fn is_live(&self) -> bool {
        self.rx.borrow().is_none()
            && self.rx.has_changed().is_ok()
            && self.interest.strong_count() > 0
    }
}

/// Indexing runs in progress, keyed by (repo, commit). At most one run per
/// key is in flight; later callers wait on the first one's outcome.
#[derive(Clone, Default)]
pub struct InflightIndexes {
    entries: Arc<Mutex<HashMap<Key, Entry>>>,
}

/// Result of `claim`.
pub enum Claim {
    /// The caller must run the index and `complete` the handle.
    Leader(InflightHandle, Waiter),
    /// A run is already in flight.
    Follower(Waiter),
}

/// Held by whoever runs the index. Dropping it without `complete` wakes
/// waiters with `RockskipError::IndexingAborted`.
pub struct InflightHandle {
    key: Key,
    tx: watch::Sender<Outcome>,
    token: CancellationToken,
}

impl InflightHandle {
    pub fn repo(&self) -> &str {
        &self.key.0
    }

    pub fn commit(&self) -> &str {
        &self.key.1
    }

    /// Cancelled on shutdown or once every waiter has gone away.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Publishes the outcome and returns it in the same form the waiters see.
    pub fn complete(self, result: Result<IndexStats>) -> Result<IndexStats> {
        let shared = result.map_err(|e| SharedError(Arc::new(e)));
        let _ = self.tx.send(Some(shared.clone()));
        shared.map_err(anyhow::Error::new)
    }
}

/// Waits for the outcome of an in-flight run. Dropping it withdraws this
/// caller's interest in the run.
pub struct Waiter {
    key: Key,
    rx: watch::Receiver<Outcome>,
    _interest: Arc<Interest>,
}

impl Waiter {
    pub async fn wait(mut self) -> Result<IndexStats> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome.map_err(anyhow::Error::new);
            }
            if self.rx.changed().await.is_err() {
                // Sender gone; a final value may still have been sent.
                if let Some(outcome) = self.rx.borrow().clone() {
                    return outcome.map_err(anyhow::Error::new);
                }
                let (repo, commit) = self.key;
                return Err(RockskipError::IndexingAborted { repo, commit }.into());
            }
        }
    }
}

impl InflightIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Clean up finished or abandoned runs
        entries.retain(|_, entry| entry.is_live());
        entries
    }

    /// Registers a run for (repo, commit), or joins the one in flight. A new
    /// run's token is a child of `parent`.
    pub fn claim(&self, repo: &str, commit: &str, parent: &CancellationToken) -> Claim {
        let key = (repo.to_string(), commit.to_string());
        let mut entries = self.entries();
        let joined = entries
            .get(&key)
            .and_then(|entry| Some((entry.rx.clone(), entry.interest.upgrade()?)));
        if let Some((rx, interest)) = joined {
            return Claim::Follower(Waiter {
                key,
                rx,
                _interest: interest,
            });
        }

        let token = parent.child_token();
        let interest = Arc::new(Interest {
            token: token.clone(),
        });
        let (tx, rx) = watch::channel(None);
        entries.insert(
            key.clone(),
            Entry {
                rx: rx.clone(),
                interest: Arc::downgrade(&interest),
            },
        );
        let waiter = Waiter {
            key: key.clone(),
            rx,
            _interest: interest,
        };
        Claim::Leader(InflightHandle { key, tx, token }, waiter)
    }

    #[cfg(test)]
    fn is_indexing(&self, repo: &str, commit: &str) -> bool {
        self.entries()
            .contains_key(&(repo.to_string(), commit.to_string()))
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find;
    use std::time::Duration;

    fn leader(claim: Claim) -> (InflightHandle, Waiter) {
        match claim {
            Claim::Leader(handle, waiter) => (handle, waiter),
            Claim::Follower(_) => panic!("expected to lead"),
        }
    }

    fn follower(claim: Claim) -> Waiter {
        match claim {
            Claim::Follower(waiter) => waiter,
            Claim::Leader(..) => panic!("expected to follow"),
        }
    }

    #[test]
    fn test_claim_and_complete() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        assert!(!inflight.is_indexing("repo", "c1"));

        let (handle, _waiter) = leader(inflight.claim("repo", "c1", &root));
        assert!(inflight.is_indexing("repo", "c1"));
        let _joined = follower(inflight.claim("repo", "c1", &root));

        // Other commits and repos run independently
        let _other = leader(inflight.claim("repo", "c2", &root));
        let _third = leader(inflight.claim("other", "c1", &root));

        handle.complete(Ok(IndexStats::default())).unwrap();
        assert!(!inflight.is_indexing("repo", "c1"));
        let _again = leader(inflight.claim("repo", "c1", &root));
    }

    #[test]
    fn test_drop_without_complete_frees_key() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, _waiter) = leader(inflight.claim("repo", "c1", &root));
        drop(handle);
        assert!(inflight.is_empty());
        let _again = leader(inflight.claim("repo", "c1", &root));
    }

    #[tokio::test]
    async fn test_waiters_share_outcome() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, own) = leader(inflight.claim("repo", "c1", &root));
        let a = follower(inflight.claim("repo", "c1", &root));
        let b = follower(inflight.claim("repo", "c1", &root));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stats = IndexStats {
                commits_indexed: 3,
                ..IndexStats::default()
            };
            handle.complete(Ok(stats)).unwrap();
        });

        assert_eq!(own.wait().await.unwrap().commits_indexed, 3);
        assert_eq!(a.wait().await.unwrap().commits_indexed, 3);
        assert_eq!(b.wait().await.unwrap().commits_indexed, 3);
    }

    #[tokio::test]
    async fn test_waiters_share_error() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, _own) = leader(inflight.claim("repo", "c1", &root));
        let waiter = follower(inflight.claim("repo", "c1", &root));

        let own = handle
            .complete(Err(RockskipError::Cancelled.into()))
            .unwrap_err();
        let seen = waiter.wait().await.unwrap_err();
        assert!(matches!(find(&own), Some(RockskipError::Cancelled)));
        assert!(matches!(find(&seen), Some(RockskipError::Cancelled)));
    }

    #[tokio::test]
    async fn test_abandoned_run_aborts_waiters() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, _own) = leader(inflight.claim("repo", "c1", &root));
        let waiter = follower(inflight.claim("repo", "c1", &root));
        drop(handle);

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(
            find(&err),
            Some(RockskipError::IndexingAborted { repo, commit }) if repo == "repo" && commit == "c1"
        ));
    }

    #[test]
    fn test_run_survives_until_last_waiter_leaves() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, own) = leader(inflight.claim("repo", "c1", &root));
        let joined = follower(inflight.claim("repo", "c1", &root));

        drop(own);
        assert!(!handle.token().is_cancelled());
        assert!(inflight.is_indexing("repo", "c1"));

        drop(joined);
        assert!(handle.token().is_cancelled());
        // Nobody is waiting on the dying run, so the next caller starts over.
        let (fresh, _waiter) = leader(inflight.claim("repo", "c1", &root));
        assert!(!fresh.token().is_cancelled());
    }

    #[test]
    fn test_root_cancels_runs() {
        let root = CancellationToken::new();
        let inflight = InflightIndexes::new();
        let (handle, _waiter) = leader(inflight.claim("repo", "c1", &root));
        root.cancel();
        assert!(handle.token().is_cancelled());
    }
}

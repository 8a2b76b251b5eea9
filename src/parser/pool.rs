use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::Parser;
use crate::error::RockskipError;

pub type ParserFactory = Arc<dyn Fn() -> Result<Box<dyn Parser>> + Send + Sync>;

enum Slot {
    Ready(Box<dyn Parser>),
    /// The previous instance was discarded; build a new one on next acquire.
    Recreate,
}

struct PoolInner {
    slots: Mutex<Vec<Slot>>,
    available: Semaphore,
    factory: ParserFactory,
    capacity: usize,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, slot: Slot) {
        self.slots().push(slot);
        self.available.add_permits(1);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for slot in self.slots().iter_mut() {
            if let Slot::Ready(parser) = slot {
                parser.close();
            }
        }
    }
}

/// Fixed-capacity pool of parser instances.
#[derive(Clone)]
pub struct ParserPool {
    inner: Arc<PoolInner>,
}

impl ParserPool {
    /// Creates `capacity` instances up front. Fails if any of them fails.
    pub fn new(factory: ParserFactory, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let parser = factory().with_context(|| format!("Failed to create parser {i}"))?;
            slots.push(Slot::Ready(parser));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(slots),
                available: Semaphore::new(capacity),
                factory,
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Instances not currently leased out.
    pub fn available(&self) -> usize {
        self.inner.available.available_permits()
    }

    /// Waits for a free instance or for `cancel` to fire.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ParserLease> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RockskipError::Cancelled.into()),
            permit = self.inner.available.acquire() => {
                permit.map_err(|_| RockskipError::ShuttingDown)?
            }
        };
        // The permit is handed back through `release` when the lease drops.
        permit.forget();

        let slot = self.inner.slots().pop();
        let parser = match slot {
            Some(Slot::Ready(parser)) => parser,
            Some(Slot::Recreate) | None => match (self.inner.factory)() {
                Ok(parser) => {
                    tracing::debug!("Recreated parser instance");
                    parser
                }
                Err(e) => {
                    self.inner.release(Slot::Recreate);
                    return Err(e.context("Failed to recreate parser"));
                }
            },
        };

        Ok(ParserLease {
            parser: Some(parser),
            pool: self.inner.clone(),
        })
    }
}

/// Exclusive use of one pool slot. The slot goes back to the pool on drop:
/// as a live instance if one is held, otherwise as a recreate marker.
pub struct ParserLease {
    parser: Option<Box<dyn Parser>>,
    pool: Arc<PoolInner>,
}

impl ParserLease {
    #[cfg(test)]
    fn parser_mut(&mut self) -> Option<&mut (dyn Parser + 'static)> {
        self.parser.as_deref_mut()
    }

    /// Moves the instance out, e.g. onto a blocking thread.
    pub fn take(&mut self) -> Option<Box<dyn Parser>> {
        self.parser.take()
    }

    pub fn restore(&mut self, parser: Box<dyn Parser>) {
        self.parser = Some(parser);
    }
}

impl Drop for ParserLease {
    fn drop(&mut self) {
        let slot = match self.parser.take() {
            Some(parser) => Slot::Ready(parser),
            None => Slot::Recreate,
        };
        self.pool.release(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tests::{LineParser, counting_factory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_construction_fails_when_factory_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: ParserFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("no more parsers");
            }
            Ok(Box::new(LineParser) as Box<dyn Parser>)
        });
        assert!(ParserPool::new(factory, 3).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_reuses_instances() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ParserPool::new(counting_factory(created.clone()), 2).unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let mut lease = pool.acquire(&cancel).await.unwrap();
            let symbols = lease.parser_mut().unwrap().parse("a", b"x\n").unwrap();
            assert_eq!(symbols.len(), 1);
        }
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_taken_parser_is_recreated() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ParserPool::new(counting_factory(created.clone()), 1).unwrap();
        let cancel = CancellationToken::new();

        let mut lease = pool.acquire(&cancel).await.unwrap();
        drop(lease.take());
        drop(lease);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.capacity(), 1);

        let _lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ParserPool::new(counting_factory(created), 1).unwrap();
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = ParserPool::new(counting_factory(created), 1).unwrap();
        let cancel = CancellationToken::new();

        let _held = pool.acquire(&cancel).await.unwrap();
        cancel.cancel();
        let err = pool.acquire(&cancel).await.err().unwrap();
        assert!(crate::error::is_cancelled(&err));
    }

    #[tokio::test]
    async fn test_failed_recreate_keeps_capacity() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // First call builds the initial instance, the second (recreate) fails.
        let factory: ParserFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("transient failure");
            }
            Ok(Box::new(LineParser) as Box<dyn Parser>)
        });
        let pool = ParserPool::new(factory, 1).unwrap();
        let cancel = CancellationToken::new();

        let mut lease = pool.acquire(&cancel).await.unwrap();
        lease.take();
        drop(lease);

        assert!(pool.acquire(&cancel).await.is_err());
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire(&cancel).await.is_ok());
    }
}

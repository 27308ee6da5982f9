//! A bounded pool of [`Store`] handles.
//!
//! Handles are lent out against a semaphore: `borrow` waits for a free slot,
//! `try_borrow` fails immediately when the pool is exhausted. A handle
//! returned with an open transaction is discarded; the slot stays usable and
//! a fresh handle is opened on the next borrow.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

use super::{Store, StoreError};
use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no database handle available")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    path: PathBuf,
    sem: Arc<Semaphore>,
    idle: Mutex<Vec<Store>>,
    metrics: Arc<Metrics>,
}

impl Pool {
    /// Creates a pool of `capacity` handles for the database at `path`.
    /// Handles are opened lazily; opening the first one eagerly ensures the
    /// schema exists before any caller races for it.
    pub fn new(
        path: impl AsRef<Path>,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PoolError> {
        let path = path.as_ref().to_path_buf();
        let first = Store::open_with_metrics(&path, Arc::clone(&metrics))?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                path,
                sem: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(vec![first]),
                metrics,
            }),
        })
    }

    /// Borrows a handle, waiting until one is free.
    pub async fn borrow(&self) -> Result<PoolHandle, PoolError> {
        let permit = self
            .inner
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        self.inner.take(permit)
    }

    /// Borrows a handle without waiting; fails when all are in use.
    pub fn try_borrow(&self) -> Result<PoolHandle, PoolError> {
        let permit = match self.inner.sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(TryAcquireError::NoPermits) => return Err(PoolError::Exhausted),
            Err(TryAcquireError::Closed) => panic!("pool semaphore closed"),
        };
        self.inner.take(permit)
    }
}

impl PoolInner {
    fn take(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Result<PoolHandle, PoolError> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let store = match idle {
            Some(store) => store,
            None => Store::open_with_metrics(&self.path, Arc::clone(&self.metrics))?,
        };
        Ok(PoolHandle {
            store: Some(store),
            inner: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// A borrowed [`Store`]. Dropping the handle returns the store to the pool,
/// unless a transaction was left open, in which case the handle is discarded.
pub struct PoolHandle {
    store: Option<Store>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PoolHandle {
    type Target = Store;

    fn deref(&self) -> &Store {
        self.store.as_ref().expect("store already returned")
    }
}

impl DerefMut for PoolHandle {
    fn deref_mut(&mut self) -> &mut Store {
        self.store.as_mut().expect("store already returned")
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            if store.in_transaction() {
                warn!("database handle returned with an open transaction, discarding it");
                // Store::drop rolls the transaction back.
                return;
            }
            self.inner
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Network;

    fn make_pool(capacity: usize) -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new().unwrap();
        let pool = Pool::new(dir.path().join("test.db"), capacity, metrics).unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn try_borrow_fails_at_capacity() {
        let (_dir, pool) = make_pool(2);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        assert!(matches!(pool.try_borrow(), Err(PoolError::Exhausted)));

        drop(a);
        let c = pool.try_borrow().expect("slot must be free again");
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn handles_are_reused_and_usable() {
        let (_dir, pool) = make_pool(1);

        {
            let mut h = pool.borrow().await.unwrap();
            let mut net = Network::new("192.168.0.0/24", "pool test").unwrap();
            h.network_add(&mut net).unwrap();
        }

        let mut h = pool.borrow().await.unwrap();
        let nets = h.network_get_all().unwrap();
        assert_eq!(nets.len(), 1);
    }

    #[tokio::test]
    async fn dirty_handle_is_discarded() {
        let (_dir, pool) = make_pool(1);

        {
            let mut h = pool.borrow().await.unwrap();
            h.begin().unwrap();
            // returned dirty on drop
        }

        // the pool opens a replacement lazily; the new handle is clean
        let h = pool.borrow().await.unwrap();
        assert!(!h.in_transaction());
    }
}

//! Reference object pool.
//!
//! `Pool<M>` hands out objects created by a [`Manager`], keeps returned ones
//! idle for reuse and runs a [`PoolReducer`] that destroys idle objects the
//! workload no longer needs.

pub mod config;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::reducer::{ObjectPool, PoolReducer};

pub use config::PoolConfig;

/// Creates and destroys the objects of a [`Pool`].
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Pooled object type.
    type Object: Send + 'static;

    /// Create a new object.
    async fn create(&self) -> Result<Self::Object>;

    /// Destroy an object leaving the pool. The default just drops it.
    async fn destroy(&self, object: Self::Object) -> Result<()> {
        drop(object);
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects currently created, idle or in use.
    pub created: usize,
    /// Objects currently idle.
    pub idle: usize,
    /// Objects currently handed out.
    pub active: usize,
}

/// Inner shared state for the pool.
struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    /// Most recently returned objects at the front.
    idle: Mutex<VecDeque<M::Object>>,
    created: AtomicUsize,
    /// Limits objects handed out at once.
    semaphore: Semaphore,
    closed: AtomicBool,
}

impl<M: Manager> PoolInner<M> {
    fn shut_down_error(&self) -> Error {
        Error::pool(self.config.name.clone(), "pool is shut down")
    }

    /// Return a checked-out object.
    ///
    /// The permit is added back only after the object is idle again (or no
    /// longer counted), so a waiter woken by it never creates past `max_size`.
    fn release(self: &Arc<Self>, object: M::Object) {
        let object = {
            let mut idle = self.idle.lock();
            if self.closed.load(Ordering::SeqCst) {
                object
            } else {
                idle.push_front(object);
                drop(idle);
                self.semaphore.add_permits(1);
                return;
            }
        };
        // Returned after shutdown: destroy instead of keeping it idle.
        self.created.fetch_sub(1, Ordering::SeqCst);
        self.semaphore.add_permits(1);
        let inner = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn(async move {
                    if let Err(error) = inner.manager.destroy(object).await {
                        tracing::warn!(pool = %inner.config.name, %error, "Failed to destroy object");
                    }
                }));
            }
            Err(_) => drop(object),
        }
    }
}

#[async_trait]
impl<M: Manager> ObjectPool for PoolInner<M> {
    fn sample_idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn created_total(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn initial_size(&self) -> usize {
        self.config.initial_size
    }

    async fn reduce_by(&self, count: usize) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.shut_down_error());
        }
        let victims: Vec<_> = {
            let mut idle = self.idle.lock();
            let n = count.min(idle.len());
            (0..n).filter_map(|_| idle.pop_back()).collect()
        };
        let reduced = victims.len();
        self.created.fetch_sub(reduced, Ordering::SeqCst);
        for object in victims {
            if let Err(error) = self.manager.destroy(object).await {
                tracing::warn!(pool = %self.config.name, %error, "Failed to destroy idle object");
            }
        }
        Ok(reduced)
    }
}

/// Bounded object pool with idle reduction.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
    reducer: Option<PoolReducer>,
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .field("reducer", &self.reducer)
            .finish()
    }
}

impl<M: Manager> Pool<M> {
    /// Create the pool, pre-creating `initial_size` objects.
    ///
    /// Starts the reducer when `config.reducer.enabled`, so this must run
    /// inside a tokio runtime.
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            created: AtomicUsize::new(0),
            semaphore: Semaphore::new(config.max_size),
            closed: AtomicBool::new(false),
            manager,
            config,
        });

        for _ in 0..inner.config.initial_size {
            let object = inner.manager.create().await?;
            inner.idle.lock().push_back(object);
            inner.created.fetch_add(1, Ordering::SeqCst);
        }

        let reducer = inner.config.reducer.enabled.then(|| {
            PoolReducer::start(
                Arc::clone(&inner),
                &inner.config.reducer,
                inner.config.name.clone(),
            )
        });

        tracing::debug!(
            pool = %inner.config.name,
            initial_size = inner.config.initial_size,
            max_size = inner.config.max_size,
            reducer = reducer.is_some(),
            "Pool created"
        );
        Ok(Self { inner, reducer })
    }

    /// Acquire an object, reusing the most recently returned idle one.
    ///
    /// The returned guard gives the object back when dropped.
    pub async fn acquire(&self) -> Result<Pooled<M>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(inner.shut_down_error());
        }

        let permit =
            tokio::time::timeout(inner.config.acquire_timeout, inner.semaphore.acquire())
                .await
                .map_err(|_| Error::Timeout {
                    pool: inner.config.name.clone(),
                    timeout_ms: inner.config.acquire_timeout.as_millis() as u64,
                })?
                .map_err(|_| inner.shut_down_error())?;

        let idle = inner.idle.lock().pop_front();
        let object = match idle {
            Some(object) => object,
            None => {
                let object = inner.manager.create().await?;
                inner.created.fetch_add(1, Ordering::SeqCst);
                object
            }
        };

        // Given back when the guard drops.
        permit.forget();
        Ok(Pooled {
            object: Some(object),
            inner: Arc::clone(inner),
        })
    }

    /// Current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let created = self.inner.created_total();
        let idle = self.inner.sample_idle_count();
        PoolStats {
            created,
            idle,
            active: created.saturating_sub(idle),
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The pool's reducer, if enabled.
    pub fn reducer(&self) -> Option<&PoolReducer> {
        self.reducer.as_ref()
    }

    /// Whether the pool was shut down.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut the pool down: stop the reducer and destroy idle objects.
    ///
    /// Objects still handed out are destroyed when returned. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reducer) = &self.reducer {
            reducer.terminate();
        }
        inner.semaphore.close();

        let objects: Vec<_> = inner.idle.lock().drain(..).collect();
        inner.created.fetch_sub(objects.len(), Ordering::SeqCst);
        let mut first_error = None;
        for object in objects {
            if let Err(error) = inner.manager.destroy(object).await {
                tracing::warn!(pool = %inner.config.name, %error, "Failed to destroy idle object");
                first_error.get_or_insert(error);
            }
        }
        tracing::debug!(pool = %inner.config.name, "Pool shut down");
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl<M: Manager> ObjectPool for Pool<M> {
    fn sample_idle_count(&self) -> usize {
        self.inner.sample_idle_count()
    }

    fn created_total(&self) -> usize {
        self.inner.created_total()
    }

    fn initial_size(&self) -> usize {
        self.inner.initial_size()
    }

    async fn reduce_by(&self, count: usize) -> Result<usize> {
        self.inner.reduce_by(count).await
    }
}

impl<M: Manager> Drop for Pool<M> {
    fn drop(&mut self) {
        if let Some(reducer) = &self.reducer {
            reducer.terminate();
        }
    }
}

/// RAII guard for an object acquired from a [`Pool`].
pub struct Pooled<M: Manager> {
    object: Option<M::Object>,
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Pooled<M> {
    /// Take the object out of the pool for good.
    ///
    /// The object no longer counts towards the pool's created objects.
    pub fn detach(mut self) -> Option<M::Object> {
        let object = self.object.take();
        if object.is_some() {
            self.inner.created.fetch_sub(1, Ordering::SeqCst);
            self.inner.semaphore.add_permits(1);
        }
        object
    }
}

impl<M: Manager> Deref for Pooled<M> {
    type Target = M::Object;

    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("pooled object present until drop")
    }
}

impl<M: Manager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("pooled object present until drop")
    }
}

impl<M: Manager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.inner.release(object);
        }
    }
}

impl<M: Manager> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

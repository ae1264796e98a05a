//! Bounded task pools used by parallel nodes.
//!
//! A pool admits at most `max_pool_size + max_queue_size` tasks, runs up to
//! `pool_size` of them at once and applies its [`RejectedPolicy`] beyond that.
//! Pools are either owned by the route that created them (shut down when the
//! route stops) or registered on the engine and shared by reference.

use crate::config::{ThreadPoolProfile, ThreadPoolsConfig};
use crate::exchange::ExchangeError;
use crate::metrics::metrics;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedPolicy {
    Abort,
    #[default]
    CallerRuns,
}

pub struct ThreadPool {
    name: Arc<str>,
    profile: ThreadPoolProfile,
    permits: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("admitted", &self.admitted.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ThreadPool {
    pub fn new(name: impl Into<String>, profile: ThreadPoolProfile) -> Arc<Self> {
        let name: String = name.into();
        let workers = profile.pool_size.max(1);
        Arc::new(Self {
            name: Arc::from(name),
            profile,
            permits: Arc::new(Semaphore::new(workers)),
            admitted: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &ThreadPoolProfile {
        &self.profile
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Tasks admitted and not yet finished.
    pub fn active(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.profile
            .max_pool_size
            .max(self.profile.pool_size)
            .max(1)
            .saturating_add(self.profile.max_queue_size)
    }

    /// Submits `task`, falling back to the rejection policy when the pool is full
    /// or shut down. A `CallerRuns` rejection yields a task that runs inline when
    /// polled.
    pub fn submit<F>(&self, task: F) -> Result<PooledTask<F::Output>, ExchangeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.try_admit() {
            metrics().record_pool_rejection(&self.name);
            tracing::debug!(
                target: "courier::pool",
                event = "task_rejected",
                pool = %self.name,
                policy = ?self.profile.rejected_policy,
                shutdown = self.is_shutdown(),
            );
            return match self.profile.rejected_policy {
                RejectedPolicy::CallerRuns if !self.is_shutdown() => Ok(PooledTask {
                    pool: self.name.clone(),
                    inner: TaskInner::Inline(task.boxed()),
                }),
                _ => Err(ExchangeError::PoolRejected {
                    pool: self.name.to_string(),
                }),
            };
        }

        let slot = AdmissionSlot {
            admitted: self.admitted.clone(),
        };
        let permits = self.permits.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                permit = permits.acquire_owned() => permit.ok()?,
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                output = task => Some(output),
            }
        });
        Ok(PooledTask {
            pool: self.name.clone(),
            inner: TaskInner::Spawned(handle),
        })
    }

    fn try_admit(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let capacity = self.capacity();
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok()
    }

    /// Cancels queued and running tasks; later submissions are rejected.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(target: "courier::pool", event = "pool_shutdown", pool = %self.name);
        }
        self.shutdown.cancel();
        self.permits.close();
    }
}

struct AdmissionSlot {
    admitted: Arc<AtomicUsize>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}

enum TaskInner<T> {
    Spawned(JoinHandle<Option<T>>),
    Inline(BoxFuture<'static, T>),
}

/// Handle to a submitted task. Dropping it aborts the task.
pub struct PooledTask<T> {
    pool: Arc<str>,
    inner: TaskInner<T>,
}

impl<T> PooledTask<T> {
    pub fn abort(&self) {
        if let TaskInner::Spawned(handle) = &self.inner {
            handle.abort();
        }
    }
}

impl<T> Future for PooledTask<T> {
    type Output = Result<T, ExchangeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            TaskInner::Inline(task) => task.as_mut().poll(cx).map(Ok),
            TaskInner::Spawned(handle) => match Pin::new(handle).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Some(output))) => Poll::Ready(Ok(output)),
                Poll::Ready(Ok(None)) => Poll::Ready(Err(ExchangeError::PoolRejected {
                    pool: this.pool.to_string(),
                })),
                Poll::Ready(Err(err)) if err.is_panic() => Poll::Ready(Err(
                    ExchangeError::raised("Panic", format!("task on pool `{}` panicked", this.pool)),
                )),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ExchangeError::PoolRejected {
                    pool: this.pool.to_string(),
                })),
            },
        }
    }
}

impl<T> Drop for PooledTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A pool plus whether the holder is responsible for shutting it down.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    pool: Arc<ThreadPool>,
    owned: bool,
}

impl PoolHandle {
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn shutdown_if_owned(&self) {
        if self.owned {
            self.pool.shutdown();
        }
    }
}

/// Creates route-owned pools from profiles and hands out shared, externally
/// supplied pools by name.
#[derive(Debug, Default)]
pub struct ThreadPoolManager {
    config: ThreadPoolsConfig,
    shared: Mutex<HashMap<String, Arc<ThreadPool>>>,
    created: AtomicUsize,
}

impl ThreadPoolManager {
    pub fn new(config: ThreadPoolsConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn default_profile(&self) -> &ThreadPoolProfile {
        &self.config.default
    }

    /// Registers a shared pool. The engine never shuts it down.
    pub fn register(&self, name: impl Into<String>, pool: Arc<ThreadPool>) {
        self.shared
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(name.into(), pool);
    }

    pub fn new_pool(&self, source: &str, profile: ThreadPoolProfile) -> PoolHandle {
        let seq = self.created.fetch_add(1, Ordering::Relaxed);
        PoolHandle {
            pool: ThreadPool::new(format!("{source}-{seq}"), profile),
            owned: true,
        }
    }

    pub fn new_default_pool(&self, source: &str) -> PoolHandle {
        self.new_pool(source, self.config.default.clone())
    }

    /// Resolves `reference` to a registered shared pool, or to a new owned pool
    /// built from the profile of that name.
    pub fn resolve(&self, source: &str, reference: &str) -> Option<PoolHandle> {
        let shared = self
            .shared
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get(reference)
            .cloned();
        if let Some(pool) = shared {
            return Some(PoolHandle { pool, owned: false });
        }
        self.config
            .profile(reference)
            .cloned()
            .map(|profile| self.new_pool(source, profile))
    }
}

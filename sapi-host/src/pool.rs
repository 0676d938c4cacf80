//! Process pool: bounded engine instances with a lazy primary
//!
//! The pool's concurrency budget is a [`Semaphore`] with `max_instances`
//! slots. Every live instance, the primary included, holds one slot until
//! it is reaped. When the budget is spent, `acquire` waits up to
//! `acquisition_timeout` for a slot and then fails with
//! [`AdmissionError::MaxInstances`].
//!
//! ```rust,ignore
//! let pool = ProcessPool::new(
//!     ModuleInstanceFactory::new(loader, module_id, InstanceConfig::default()),
//!     PoolConfig::from_env(),
//! );
//!
//! let worker = pool.acquire().await?;
//! let response = worker.execute(Request::with_code("echo 1;")).await?;
//! pool.reap(worker).await?;
//! ```

use crate::error::{AdmissionError, RuntimeError};
use crate::instance::{EngineInstance, InstanceConfig, InstanceId};
use crate::module::ModuleLoader;
use crate::semaphore::{AcquireError, Permit, Semaphore};
use async_trait::async_trait;
use sapi_api::ModuleId;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard cap on concurrently live instances, primary included
    pub max_instances: usize,

    /// How long `acquire` waits for a free slot; `None` waits indefinitely
    pub acquisition_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            acquisition_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables
    ///
    /// Environment variables:
    /// - `SAPI_MAX_INSTANCES`: instance cap (default: 5)
    /// - `SAPI_ACQUIRE_TIMEOUT_MS`: slot wait in milliseconds, `0` for no
    ///   timeout (default: 30000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_instances: lookup("SAPI_MAX_INSTANCES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_instances),
            acquisition_timeout: match lookup("SAPI_ACQUIRE_TIMEOUT_MS")
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.acquisition_timeout,
            },
        }
    }
}

/// Produces initialized engine instances for the pool
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    async fn spawn(&self) -> Result<EngineInstance, RuntimeError>;
}

#[async_trait]
impl<F, Fut> InstanceFactory for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<EngineInstance, RuntimeError>> + Send,
{
    async fn spawn(&self) -> Result<EngineInstance, RuntimeError> {
        (self)().await
    }
}

/// Builds instances from a registered module
pub struct ModuleInstanceFactory {
    loader: Arc<dyn ModuleLoader>,
    module: ModuleId,
    config: InstanceConfig,
}

impl ModuleInstanceFactory {
    pub fn new(loader: Arc<dyn ModuleLoader>, module: ModuleId, config: InstanceConfig) -> Self {
        Self {
            loader,
            module,
            config,
        }
    }
}

#[async_trait]
impl InstanceFactory for ModuleInstanceFactory {
    async fn spawn(&self) -> Result<EngineInstance, RuntimeError> {
        let instance = EngineInstance::new(self.config.clone());
        instance
            .initialize_from(self.loader.as_ref(), &self.module)
            .await?;
        Ok(instance)
    }
}

enum PrimarySlot {
    Empty,
    Spawning,
    Ready {
        instance: Arc<EngineInstance>,
        _permit: Permit,
    },
}

struct PoolInner {
    factory: Box<dyn InstanceFactory>,
    config: PoolConfig,
    slots: Semaphore,
    primary: Mutex<PrimarySlot>,
    live: Mutex<HashMap<InstanceId, Arc<EngineInstance>>>,
    spawned: AtomicU64,
    closed: AtomicBool,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_instances: usize,
    /// Live secondary instances
    pub live: usize,
    pub primary: bool,
    /// Free slots in the concurrency budget
    pub remaining: usize,
    /// Instances created over the pool's lifetime
    pub spawned: u64,
}

/// Bounded set of engine instances
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub fn new(factory: impl InstanceFactory + 'static, config: PoolConfig) -> Self {
        let slots = Semaphore::new(config.max_instances).with_timeout(config.acquisition_timeout);
        Self {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                config,
                slots,
                primary: Mutex::new(PrimarySlot::Empty),
                live: Mutex::new(HashMap::new()),
                spawned: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The singleton primary instance, created on first call
    ///
    /// A call made while the primary is still being created fails with
    /// [`AdmissionError::PrimarySpawnInProgress`] instead of waiting.
    pub async fn get_primary(&self) -> Result<Arc<EngineInstance>, RuntimeError> {
        self.ensure_open()?;
        {
            let mut slot = lock(&self.inner.primary);
            match &*slot {
                PrimarySlot::Ready { instance, .. } => return Ok(instance.clone()),
                PrimarySlot::Spawning => {
                    return Err(AdmissionError::PrimarySpawnInProgress.into());
                }
                PrimarySlot::Empty => *slot = PrimarySlot::Spawning,
            }
        }
        let mut spawning = PrimarySpawn {
            slot: &self.inner.primary,
            done: false,
        };

        let permit = self.acquire_slot().await?;
        let instance = Arc::new(self.spawn_instance().await?);

        *lock(&self.inner.primary) = PrimarySlot::Ready {
            instance: instance.clone(),
            _permit: permit,
        };
        spawning.done = true;

        tracing::info!(instance = %instance.id(), "Primary instance spawned");
        Ok(instance)
    }

    /// Spawn a fresh secondary instance within the concurrency budget
    pub async fn acquire(&self) -> Result<PooledInstance, RuntimeError> {
        self.ensure_open()?;
        let permit = self.acquire_slot().await?;
        let instance = Arc::new(self.spawn_instance().await?);

        lock(&self.inner.live).insert(instance.id(), instance.clone());
        tracing::debug!(
            instance = %instance.id(),
            remaining = self.inner.slots.remaining(),
            "Instance acquired"
        );
        Ok(PooledInstance {
            instance,
            permit: Some(permit),
            pool: Arc::downgrade(&self.inner),
            reaped: false,
        })
    }

    /// Destroy `instance` and free its slot
    pub async fn reap(&self, instance: PooledInstance) -> Result<(), RuntimeError> {
        instance.reap().await
    }

    /// Destroy the primary instance; the next `get_primary` creates a new one
    ///
    /// Returns whether there was a primary to reap.
    pub async fn reap_primary(&self) -> Result<bool, RuntimeError> {
        let previous = {
            let mut slot = lock(&self.inner.primary);
            match std::mem::replace(&mut *slot, PrimarySlot::Empty) {
                PrimarySlot::Ready { instance, _permit } => Some((instance, _permit)),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let Some((instance, permit)) = previous else {
            return Ok(false);
        };

        let result = instance.exit().await;
        drop(permit);
        tracing::info!(instance = %instance.id(), "Primary instance reaped");
        result.map(|_| true)
    }

    /// Exit every instance and refuse further admissions
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.slots.close();
        self.reap_primary().await?;

        let live: Vec<_> = lock(&self.inner.live).drain().map(|(_, i)| i).collect();
        for instance in &live {
            instance.exit().await?;
        }
        tracing::info!(exited = live.len(), "Process pool shut down");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_instances: self.inner.config.max_instances,
            live: lock(&self.inner.live).len(),
            primary: matches!(*lock(&self.inner.primary), PrimarySlot::Ready { .. }),
            remaining: self.inner.slots.remaining(),
            spawned: self.inner.spawned.load(Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AdmissionError::Closed.into());
        }
        Ok(())
    }

    async fn acquire_slot(&self) -> Result<Permit, RuntimeError> {
        self.inner.slots.acquire().await.map_err(|e| {
            let error = match e {
                AcquireError::Timeout(waited) => {
                    tracing::warn!(
                        max = self.inner.config.max_instances,
                        waited_ms = waited.as_millis() as u64,
                        "No free instance slot"
                    );
                    AdmissionError::MaxInstances {
                        max: self.inner.config.max_instances,
                    }
                }
                AcquireError::Closed => AdmissionError::Closed,
            };
            error.into()
        })
    }

    async fn spawn_instance(&self) -> Result<EngineInstance, RuntimeError> {
        let instance = self.inner.factory.spawn().await?;
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }
}

/// Resets the primary slot if creation does not finish
struct PrimarySpawn<'a> {
    slot: &'a Mutex<PrimarySlot>,
    done: bool,
}

impl Drop for PrimarySpawn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut slot = lock(self.slot);
        if let PrimarySlot::Spawning = *slot {
            *slot = PrimarySlot::Empty;
        }
    }
}

/// A borrowed pool instance
///
/// Dereferences to the [`EngineInstance`]. Call [`reap`](Self::reap) (or
/// [`ProcessPool::reap`]) when done; dropping it unreaped exits the
/// instance on the current tokio runtime and frees its slot afterwards.
#[derive(Debug)]
pub struct PooledInstance {
    instance: Arc<EngineInstance>,
    permit: Option<Permit>,
    pool: Weak<PoolInner>,
    reaped: bool,
}

impl PooledInstance {
    /// Shared handle to the instance
    pub fn instance(&self) -> &Arc<EngineInstance> {
        &self.instance
    }

    pub async fn reap(mut self) -> Result<(), RuntimeError> {
        self.reaped = true;
        let permit = self.permit.take();
        self.forget();
        let result = self.instance.exit().await;
        drop(permit);
        tracing::debug!(instance = %self.instance.id(), "Instance reaped");
        result
    }

    fn forget(&self) {
        if let Some(pool) = self.pool.upgrade() {
            lock(&pool.live).remove(&self.instance.id());
        }
    }
}

impl Deref for PooledInstance {
    type Target = EngineInstance;

    fn deref(&self) -> &EngineInstance {
        &self.instance
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.forget();
        let instance = self.instance.clone();
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = instance.exit().await {
                        tracing::warn!(instance = %instance.id(), error = %e, "Exit of dropped instance failed");
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                tracing::warn!(
                    instance = %instance.id(),
                    "Pooled instance dropped outside a runtime; slot freed without exit"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

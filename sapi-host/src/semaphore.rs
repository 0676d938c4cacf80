//! Counting semaphore with FIFO waiters and an optional acquisition timeout
//!
//! A one-slot [`Semaphore::execution`] serializes everything that runs on an
//! engine instance; the process pool uses a wider one as its concurrency
//! budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;

/// Errors returned while waiting for a permit
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("Timed out after {0:?} waiting for a permit")]
    Timeout(Duration),

    #[error("Semaphore closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Semaphore {
    permits: Arc<tokio::sync::Semaphore>,
    concurrency: usize,
    timeout: Option<Duration>,
}

/// A held slot; released when dropped
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Semaphore {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(concurrency)),
            concurrency,
            timeout: None,
        }
    }

    /// Single-slot semaphore guaranteeing one in-flight execution
    pub fn execution() -> Self {
        Self::new(1)
    }

    /// Bound how long `acquire` waits; `None` waits indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of free slots
    pub fn remaining(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot in FIFO order
    pub async fn acquire(&self) -> Result<Permit, AcquireError> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| AcquireError::Timeout(timeout))?,
            None => acquire.await,
        };
        permit
            .map(|permit| Permit { _permit: permit })
            .map_err(|_| AcquireError::Closed)
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Run `task` while holding a slot
    pub async fn run<F, T>(&self, task: F) -> Result<T, AcquireError>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(task.await)
    }

    /// Fail all current and future waiters with [`AcquireError::Closed`]
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

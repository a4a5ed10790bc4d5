//! Global limit on concurrent network probes

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{PoolError, Result};

/// Counting gate shared by every check in the process.
///
/// A permit covers exactly one network operation. Closing the gate makes every
/// waiting and future `acquire` fail with [`PoolError::Cancelled`].
#[derive(Debug, Clone)]
pub struct CheckGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl CheckGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| PoolError::Cancelled)
    }

    /// Stop handing out permits
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

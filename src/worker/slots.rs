use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StratumError;

/// The worker's execution slots.
///
/// Assignments take a permit with `try_acquire`; a worker with no free slot refuses
/// instead of queueing.
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    total: usize,
}

/// Held by a job for as long as it occupies a slot.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

impl SlotPool {
    pub fn new(total: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total)),
            total,
        }
    }

    pub fn try_acquire(&self) -> Result<SlotPermit, StratumError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map(|permit| SlotPermit { _permit: permit })
            .map_err(|_| StratumError::SlotUnavailable)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.total.saturating_sub(self.available())
    }

    /// Wait until every permit has been returned.
    pub async fn wait_idle(&self) {
        let Ok(total) = u32::try_from(self.total) else {
            return;
        };
        if total == 0 {
            return;
        }
        if let Ok(all) = self.semaphore.acquire_many(total).await {
            drop(all);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn refuses_when_full() {
        let pool = SlotPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(matches!(
            pool.try_acquire(),
            Err(StratumError::SlotUnavailable)
        ));
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn wait_idle_returns_after_permits_drop() {
        let pool = SlotPool::new(1);
        let permit = pool.try_acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.available(), 1);
    }
}

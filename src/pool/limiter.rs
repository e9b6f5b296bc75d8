use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrent tasks within one job
///
/// The limit starts at the job's task concurrency and can only shrink.
#[derive(Clone)]
pub struct TaskLimiter {
    semaphore: Arc<Semaphore>,
    limit: Arc<AtomicUsize>,
}

impl TaskLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: Arc::new(AtomicUsize::new(limit)),
        }
    }

    /// Waits for a task slot
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Lowers the limit by one, never below 1
    ///
    /// Returns the new limit. A busy slot is retired as soon as it frees up.
    pub fn reduce(&self) -> usize {
        let reduced = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 1).then(|| n - 1)
            });

        match reduced {
            Ok(previous) => {
                let semaphore = self.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permit) = semaphore.acquire_owned().await {
                        permit.forget();
                    }
                });
                tracing::info!("Task concurrency reduced to {}", previous - 1);
                previous - 1
            }
            Err(current) => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reduce_stops_at_one() {
        let limiter = TaskLimiter::new(3);
        assert_eq!(limiter.reduce(), 2);
        assert_eq!(limiter.reduce(), 1);
        assert_eq!(limiter.reduce(), 1);
        assert_eq!(limiter.limit(), 1);
    }

    #[tokio::test]
    async fn test_reduce_retires_a_permit() {
        let limiter = TaskLimiter::new(2);
        limiter.reduce();
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while limiter.semaphore.available_permits() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let first = limiter.acquire().await;
        assert!(first.is_some());
        assert_eq!(limiter.semaphore.available_permits(), 0);
    }

    #[test]
    fn test_zero_limit_is_one() {
        let limiter = TaskLimiter::new(0);
        assert_eq!(limiter.limit(), 1);
    }
}

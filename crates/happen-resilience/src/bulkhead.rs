use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Caps concurrent executions of an action; excess callers queue FIFO on the
/// underlying semaphore and are admitted as running calls complete.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    /// Admit at most `max_concurrent` calls at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))) }
    }

    /// Calls currently in flight.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `action`, waiting for a free slot first.
    pub async fn call<F, Fut, T>(&self, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await.expect("bulkhead semaphore never closes");
        action().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn limits_concurrent_executions_to_cap() {
        let bulkhead = Arc::new(Bulkhead::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bulkhead = Arc::clone(&bulkhead);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .call(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}

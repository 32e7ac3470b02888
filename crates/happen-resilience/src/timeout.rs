use std::future::Future;
use std::time::Duration;

/// Raised by [`with_timeout`] when the deadline elapses first.
#[derive(Debug, thiserror::Error)]
#[error("handler timed out")]
pub struct TimeoutError;

/// Race `action` against `duration`; on expiry, fail with [`TimeoutError`].
pub async fn with_timeout<F, T>(duration: Duration, action: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, action).await.map_err(|_| TimeoutError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_when_action_finishes_in_time() {
        let result = with_timeout(Duration::from_millis(50), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_when_action_outlives_deadline() {
        let result = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            42
        })
        .await;
        assert!(result.is_err());
    }
}

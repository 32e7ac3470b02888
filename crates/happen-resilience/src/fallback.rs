use std::future::Future;

/// Try `primary`; on failure, invoke `secondary` with the error value. The
/// caller is responsible for recording `context.fallbackReason`-equivalent
/// bookkeeping (this crate has no notion of `HandlerContext`).
pub async fn with_fallback<F, Fut, G, FutG, T, E>(primary: F, secondary: G) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    G: FnOnce(E) -> FutG,
    FutG: Future<Output = T>,
{
    match primary().await {
        Ok(value) => value,
        Err(err) => secondary(err).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_primary_value_on_success() {
        let result = with_fallback(|| async { Ok::<_, &str>(1) }, |_err| async { 0 }).await;
        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn invokes_secondary_on_primary_failure() {
        let result = with_fallback(|| async { Err::<i32, _>("boom") }, |err| async move {
            assert_eq!(err, "boom");
            -1
        })
        .await;
        assert_eq!(result, -1);
    }
}

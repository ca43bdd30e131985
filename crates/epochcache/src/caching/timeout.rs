use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use super::cache_error::{CacheEntry, CacheError};

/// Bounds the time a producer may take.
///
/// The returned producer fails with [`CacheError::Timeout`] if the original one does not
/// settle within `timeout`. The original future is dropped at that point, so a late result
/// is never delivered or cached.
pub fn with_timeout<A, T, F, Fut>(
    producer: F,
    timeout: Duration,
) -> impl Fn(A) -> BoxFuture<'static, CacheEntry<T>> + Send + Sync + 'static
where
    A: 'static,
    T: 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheEntry<T>> + Send + 'static,
{
    move |args| {
        let future = producer(args);
        async move {
            tokio::time::timeout(timeout, future)
                .await
                .unwrap_or(Err(CacheError::Timeout(timeout)))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let finished = Arc::new(AtomicBool::new(false));
        let producer = {
            let finished = finished.clone();
            move |delay: u64| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(delay)
                }
            }
        };
        let producer = with_timeout(producer, Duration::from_millis(50));

        assert_eq!(producer(10).await, Ok(10));

        finished.store(false, Ordering::SeqCst);
        let start = tokio::time::Instant::now();
        assert_eq!(
            producer(200).await,
            Err(CacheError::Timeout(Duration::from_millis(50)))
        );
        assert_eq!(start.elapsed(), Duration::from_millis(50));

        // The late result is discarded.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_pass_through() {
        let producer = with_timeout(
            |_: ()| async { Err::<u32, _>(CacheError::producer(anyhow::anyhow!("boom"))) },
            Duration::from_secs(1),
        );
        assert_eq!(
            producer(()).await,
            Err(CacheError::ProducerFailed("boom".into()))
        );
    }
}

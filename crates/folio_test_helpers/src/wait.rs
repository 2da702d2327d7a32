//! Polling helpers for asynchronous tests

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 20ms until it returns true or `timeout` elapses
///
/// Returns whether the condition was met.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use folio_test_helpers::wait::wait_until;
/// use std::time::Duration;
///
/// assert!(wait_until(Duration::from_millis(100), || async { true }).await);
/// # }
/// ```
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_until_eventually_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let met = wait_until(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;
        assert!(met);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let met = wait_until(Duration::from_millis(50), || async { false }).await;
        assert!(!met);
    }
}

//! Bounded polling used by every readiness gate.

use std::future::Future;
use tokio::time::{sleep, Duration, Instant};

/// Poll `probe` every `interval` until it returns true or `max_wait` elapses.
///
/// The probe always runs at least once, so a zero `max_wait` still detects an
/// already-ready resource.
pub async fn wait_until<F, Fut>(interval: Duration, max_wait: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + max_wait;
    loop {
        if probe().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_after_a_few_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let ready = wait_until(Duration::from_millis(5), Duration::from_secs(2), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;

        assert!(ready);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_times_out() {
        let started = Instant::now();
        let ready = wait_until(Duration::from_millis(10), Duration::from_millis(80), || async {
            false
        })
        .await;

        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_zero_timeout_still_probes_once() {
        assert!(wait_until(Duration::from_millis(10), Duration::ZERO, || async { true }).await);
    }
}

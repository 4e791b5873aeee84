use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Below this remainder the coarse sleep hands over to the polling loop.
/// Millisecond-granularity sleeps routinely overshoot by a few hundred
/// microseconds, which matters for sub-millisecond batch timeouts.
pub const COARSE_SLEEP_MARGIN: Duration = Duration::from_millis(10);

/// Hybrid-precision sleep: coarse async sleep while more than the margin
/// remains, then a cooperative-yield loop re-measuring elapsed time each
/// iteration so the deadline is not overshot.
pub async fn precise_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;

    if duration > COARSE_SLEEP_MARGIN {
        tokio::time::sleep(duration - COARSE_SLEEP_MARGIN).await;
    }

    while Instant::now() < deadline {
        tokio::task::yield_now().await;
    }
}

/// A cancellable one-shot flush timer. Cancellation is idempotent and a
/// canceled timer never fires; the race between a late fire and a
/// size-triggered flush is resolved by the scheduler's batch generation
/// counter, not by flags inside the timer.
pub struct FlushTimer {
    handle: JoinHandle<()>,
}

impl FlushTimer {
    pub fn arm(timeout: Duration, on_fire: impl FnOnce() + Send + 'static) -> Self {
        let handle = tokio::spawn(async move {
            precise_sleep(timeout).await;
            on_fire();
        });

        FlushTimer { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn precise_sleep_does_not_undershoot() {
        for timeout_us in [200u64, 2_000, 15_000] {
            let timeout = Duration::from_micros(timeout_us);
            let start = Instant::now();
            precise_sleep(timeout).await;
            let elapsed = start.elapsed();

            assert!(elapsed >= timeout, "slept {elapsed:?} for target {timeout:?}");
            // Generous slack: scheduling noise, not precision, dominates here.
            assert!(
                elapsed < timeout + Duration::from_millis(50),
                "slept {elapsed:?} for target {timeout:?}"
            );
        }
    }

    #[tokio::test]
    async fn timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let _timer = FlushTimer::arm(Duration::from_millis(5), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn canceled_timer_never_fires_and_cancel_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let timer = FlushTimer::arm(Duration::from_millis(15), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        timer.cancel();
        timer.cancel();
        drop(timer);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

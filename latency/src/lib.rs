//! Exponentially-weighted moving average latency tracking for adapter calls.
//!
//! The Status Poller (see `dex_proxy_core::poller`) uses one `LatencyTracker`
//! per adapter connection to decide which of several redundant connections
//! to a venue is currently the fastest to answer, and to widen its own
//! polling interval when a backend is visibly struggling.

use std::future::Future;
use std::time::Duration;

use portable_atomic::AtomicF64;
use tracing::trace;

/// Tracks a running EWMA of call latency in milliseconds.
///
/// `alpha` is the smoothing factor: `next = alpha * sample + (1 - alpha) * prev`.
/// Higher values weight recent samples more heavily.
pub struct LatencyTracker {
    ewma_ms: AtomicF64,
    alpha: f64,
}

impl LatencyTracker {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");

        Self {
            ewma_ms: AtomicF64::new(0.0),
            alpha,
        }
    }

    pub fn record(&self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        // retry on concurrent updates instead of taking a lock; samples
        // arrive from many poller ticks and losing one to a race is fine
        let mut prev = self.ewma_ms.load(portable_atomic::Ordering::Relaxed);
        loop {
            let next = if prev <= 0.0 {
                sample_ms
            } else {
                self.alpha * sample_ms + (1.0 - self.alpha) * prev
            };

            match self.ewma_ms.compare_exchange_weak(
                prev,
                next,
                portable_atomic::Ordering::Relaxed,
                portable_atomic::Ordering::Relaxed,
            ) {
                Ok(_) => {
                    trace!(sample_ms, ewma_ms = next, "latency sample");
                    break;
                }
                Err(observed) => prev = observed,
            }
        }
    }

    pub fn ewma(&self) -> Duration {
        Duration::from_secs_f64((self.ewma_ms.load(portable_atomic::Ordering::Relaxed) / 1000.0).max(0.0))
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(0.3)
    }
}

/// Runs `fut`, recording its wall-clock duration into `tracker`, and
/// returns `fut`'s output unchanged.
pub async fn timed<F, T>(tracker: &LatencyTracker, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = tokio::time::Instant::now();
    let result = fut.await;
    tracker.record(start.elapsed());
    result
}

/// Spawns a background task that folds latency samples sent over the
/// returned channel into `tracker`. Useful when the code measuring latency
/// (e.g. inside an adapter) doesn't have direct access to the tracker owned
/// by the poller.
pub fn spawn_recorder(tracker: std::sync::Arc<LatencyTracker>) -> flume::Sender<Duration> {
    let (tx, rx) = flume::unbounded();

    tokio::spawn(async move {
        while let Ok(sample) = rx.recv_async().await {
            tracker.record(sample);
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_toward_repeated_sample() {
        let tracker = LatencyTracker::new(0.5);

        for _ in 0..20 {
            tracker.record(Duration::from_millis(100));
        }

        let ewma = tracker.ewma().as_millis();
        assert!((95..=105).contains(&ewma), "ewma was {ewma}ms");
    }

    #[test]
    fn first_sample_sets_the_baseline_exactly() {
        let tracker = LatencyTracker::new(0.1);

        tracker.record(Duration::from_millis(42));

        assert_eq!(tracker.ewma(), Duration::from_millis(42));
    }

    #[tokio::test]
    async fn timed_reports_nonzero_duration_for_sleeping_future() {
        let tracker = LatencyTracker::default();

        timed(&tracker, tokio::time::sleep(Duration::from_millis(5))).await;

        assert!(tracker.ewma() > Duration::ZERO);
    }
}

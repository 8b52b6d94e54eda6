// =============================================================================
// Upstream retry with capped exponential backoff
// =============================================================================
//
//   delay(attempt) = base * min(2^attempt, max / base)      1s, 2s, 4s ... 60s
//
// Only `UpstreamUnavailable` is retried; the wait is cut short by shutdown.

use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::errors::PipelineError;
use crate::metrics::StageMetrics;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// 1 s base, capped at `max_secs`.
    pub fn from_secs(max_secs: u64) -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(max_secs))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds, retrying upstream unavailability with backoff.
///
/// Returns `Ok(None)` when shutdown is signalled while waiting to retry.
/// Non-retryable errors are returned immediately.
pub async fn retry_upstream<T, F>(
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
    metrics: &StageMetrics,
    mut op: F,
) -> Result<Option<T>, PipelineError>
where
    F: FnMut() -> Result<T, PipelineError>,
{
    loop {
        match op() {
            Ok(value) => {
                backoff.reset();
                return Ok(Some(value));
            }
            Err(e) if e.is_retryable() => {
                let delay = backoff.next_delay();
                metrics.upstream_retry();
                warn!(
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "upstream unavailable, retrying"
                );
                if *shutdown.borrow() {
                    return Ok(None);
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(None);
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn delays_double_until_cap() {
        let mut b = Backoff::from_secs(60);
        let secs: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_millis(50));
        for _ in 0..100 {
            assert!(b.next_delay() <= Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn retries_until_upstream_returns() {
        let metrics = StageMetrics::default();
        let (_tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
        let calls = Cell::new(0);

        let value = retry_upstream(&mut backoff, &mut rx, &metrics, || {
            calls.set(calls.get() + 1);
            if calls.get() < 4 {
                Err(PipelineError::UpstreamUnavailable("connection refused".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, Some(42));
        assert_eq!(calls.get(), 4);
        assert_eq!(metrics.snapshot().upstream_retries, 3);
        assert_eq!(backoff.attempt(), 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_pass_through() {
        let metrics = StageMetrics::default();
        let (_tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::from_secs(60);
        let result: Result<Option<()>, _> = retry_upstream(&mut backoff, &mut rx, &metrics, || {
            Err(PipelineError::Checkpoint("disk".into()))
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Checkpoint(_))));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let metrics = StageMetrics::default();
        let (tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::from_secs(60);
        tx.send(true).unwrap();
        let result: Option<()> = retry_upstream(&mut backoff, &mut rx, &metrics, || {
            Err(PipelineError::UpstreamUnavailable("down".into()))
        })
        .await
        .unwrap();
        assert!(result.is_none());
    }
}
